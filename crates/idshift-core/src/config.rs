use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

pub const DEFAULT_FLAG_NAME: &str = "identity.function_pathway";

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub flag: FlagConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// The flag that governs which identity pathway serves requests.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct FlagConfig {
    #[serde(default = "default_flag_name")]
    pub name: String,
    #[serde(default = "default_flag_description")]
    pub description: String,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            name: default_flag_name(),
            description: default_flag_description(),
        }
    }
}

fn default_flag_name() -> String {
    DEFAULT_FLAG_NAME.to_string()
}

fn default_flag_description() -> String {
    "Route identity allocation through the function-based service".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RolloutConfig {
    /// Traffic share routed to the new path while in Canary/Monitoring (1-100).
    #[serde(default = "default_canary_percentage")]
    pub canary_percentage: u8,
    /// Time budget of the Monitoring stage. Elapsing it never promotes.
    #[serde(default = "default_monitoring_budget_secs")]
    pub monitoring_budget_secs: u64,
    /// Continuous healthy telemetry required before promotion is accepted.
    #[serde(default = "default_min_healthy_secs")]
    pub min_healthy_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            canary_percentage: default_canary_percentage(),
            monitoring_budget_secs: default_monitoring_budget_secs(),
            min_healthy_secs: default_min_healthy_secs(),
        }
    }
}

fn default_canary_percentage() -> u8 {
    10
}
fn default_monitoring_budget_secs() -> u64 {
    15 * 60
}
fn default_min_healthy_secs() -> u64 {
    10 * 60
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_error_rate_max")]
    pub error_rate_max: f64,
    #[serde(default = "default_five_minutes")]
    pub error_rate_window_secs: u64,
    #[serde(default = "default_p95_latency_ms_max")]
    pub p95_latency_ms_max: f64,
    #[serde(default = "default_five_minutes")]
    pub latency_window_secs: u64,
    /// Conflict rate breaches above `multiplier * baseline`.
    #[serde(default = "default_conflict_multiplier")]
    pub conflict_multiplier: f64,
    #[serde(default = "default_ten_minutes")]
    pub conflict_window_secs: u64,
    /// Samples a window must contain before it can count as a sustained breach.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Largest tolerated hole between samples (and at the window start).
    #[serde(default = "default_max_gap_secs")]
    pub max_gap_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_rate_max: default_error_rate_max(),
            error_rate_window_secs: default_five_minutes(),
            p95_latency_ms_max: default_p95_latency_ms_max(),
            latency_window_secs: default_five_minutes(),
            conflict_multiplier: default_conflict_multiplier(),
            conflict_window_secs: default_ten_minutes(),
            min_samples: default_min_samples(),
            max_gap_secs: default_max_gap_secs(),
        }
    }
}

fn default_error_rate_max() -> f64 {
    0.02
}
fn default_p95_latency_ms_max() -> f64 {
    800.0
}
fn default_conflict_multiplier() -> f64 {
    3.0
}
fn default_five_minutes() -> u64 {
    5 * 60
}
fn default_ten_minutes() -> u64 {
    10 * 60
}
fn default_min_samples() -> usize {
    3
}
fn default_max_gap_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct IdentityConfig {
    /// Fixed domain stamped on every allocated identity.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Legacy endpoint family; local-only allocation when unset.
    #[serde(default)]
    pub legacy_endpoint: Option<String>,
    /// Function-based endpoint; local-only allocation when unset.
    #[serde(default)]
    pub function_endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            legacy_endpoint: None,
            function_endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_domain() -> String {
    "identity.local".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StorageConfig {
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl Config {
    /// Directory holding the SQLite database. `IDSHIFT_STATE_DIR` wins over the file.
    pub fn state_dir(&self) -> PathBuf {
        std::env::var("IDSHIFT_STATE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.storage.state_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("state"))
    }

    /// Semantic checks on top of the schema.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut problems = Vec::new();
        if self.flag.name.trim().is_empty() {
            problems.push("flag.name must not be empty".to_string());
        }
        if !(1..=100).contains(&self.rollout.canary_percentage) {
            problems.push(format!(
                "rollout.canary_percentage must be 1-100 (got {})",
                self.rollout.canary_percentage
            ));
        }
        let m = &self.monitor;
        if !(0.0..=1.0).contains(&m.error_rate_max) {
            problems.push("monitor.error_rate_max must be a fraction in 0..=1".to_string());
        }
        if m.p95_latency_ms_max <= 0.0 {
            problems.push("monitor.p95_latency_ms_max must be positive".to_string());
        }
        if m.conflict_multiplier < 1.0 {
            problems.push("monitor.conflict_multiplier must be >= 1".to_string());
        }
        if m.error_rate_window_secs == 0 || m.latency_window_secs == 0 || m.conflict_window_secs == 0
        {
            problems.push("monitor windows must be non-zero".to_string());
        }
        if m.min_samples < 2 {
            problems.push("monitor.min_samples must be at least 2".to_string());
        }
        if self.identity.domain.trim().is_empty() {
            problems.push("identity.domain must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::Config(problems.join("; ")))
        }
    }
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str) -> Result<Config, MigrationError> {
    let raw: toml::Value =
        toml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))?;
    let json_value =
        serde_json::to_value(&raw).map_err(|e| MigrationError::Config(e.to_string()))?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(MigrationError::Config(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config, MigrationError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MigrationError::Config(format!("{}: {e}", path.display())))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let cfg = parse_config("").expect("defaults");
        assert_eq!(cfg.flag.name, DEFAULT_FLAG_NAME);
        assert_eq!(cfg.rollout.canary_percentage, 10);
        assert_eq!(cfg.rollout.monitoring_budget_secs, 900);
        assert_eq!(cfg.monitor.error_rate_max, 0.02);
        assert_eq!(cfg.monitor.p95_latency_ms_max, 800.0);
        assert_eq!(cfg.monitor.conflict_multiplier, 3.0);
        assert_eq!(cfg.monitor.conflict_window_secs, 600);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse_config(
            r#"
            [flag]
            name = "identity.fn"

            [rollout]
            canary_percentage = 25

            [monitor]
            min_samples = 5

            [identity]
            domain = "example.org"
            function_endpoint = "https://fn.example.org/identity"
            "#,
        )
        .expect("config");
        assert_eq!(cfg.flag.name, "identity.fn");
        assert_eq!(cfg.rollout.canary_percentage, 25);
        assert_eq!(cfg.monitor.min_samples, 5);
        assert_eq!(cfg.identity.domain, "example.org");
        assert!(cfg.identity.legacy_endpoint.is_none());
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = parse_config("[rollout]\ncanary_percentage = \"ten\"\n").unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
    }

    #[test]
    fn semantic_validation_rejects_zero_canary() {
        let err = parse_config("[rollout]\ncanary_percentage = 0\n").unwrap_err();
        assert!(err.to_string().contains("canary_percentage"));
    }

    #[test]
    fn load_config_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("idshift.toml");
        std::fs::write(&path, "[storage]\nstate_dir = \"/tmp/idshift-state\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.storage.state_dir.as_deref(), Some("/tmp/idshift-state"));
    }

    #[test]
    #[serial]
    fn state_dir_env_wins_over_file() {
        let cfg = parse_config("[storage]\nstate_dir = \"from-file\"\n").expect("config");
        std::env::set_var("IDSHIFT_STATE_DIR", "from-env");
        assert_eq!(cfg.state_dir(), PathBuf::from("from-env"));
        std::env::remove_var("IDSHIFT_STATE_DIR");
        assert_eq!(cfg.state_dir(), PathBuf::from("from-file"));
    }

    #[test]
    fn schema_json_mentions_sections() {
        let schema = config_schema_json();
        let text = schema.to_string();
        assert!(text.contains("rollout"));
        assert!(text.contains("monitor"));
    }
}
