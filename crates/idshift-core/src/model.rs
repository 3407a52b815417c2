use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted boolean toggle with audit metadata. At most one record exists per `name`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    pub description: String,
    pub last_modified_by: String,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, defaults: &FlagDefaults, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            enabled: defaults.enabled,
            description: defaults.description.clone(),
            last_modified_by: defaults.created_by.clone(),
            updated_at: now,
        }
    }
}

/// Values used when a flag record has to be created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefaults {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

fn default_creator() -> String {
    "bootstrap".to_string()
}

impl Default for FlagDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            description: String::new(),
            created_by: default_creator(),
        }
    }
}

impl FlagDefaults {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    #[default]
    Validation,
    Canary,
    Monitoring,
    FullCutover,
    RolledBack,
}

impl RolloutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStage::Validation => "validation",
            RolloutStage::Canary => "canary",
            RolloutStage::Monitoring => "monitoring",
            RolloutStage::FullCutover => "full_cutover",
            RolloutStage::RolledBack => "rolled_back",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            RolloutStage::Validation => "Validation",
            RolloutStage::Canary => "Canary",
            RolloutStage::Monitoring => "Monitoring",
            RolloutStage::FullCutover => "Full cutover",
            RolloutStage::RolledBack => "Rolled back",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "validation" => Some(RolloutStage::Validation),
            "canary" => Some(RolloutStage::Canary),
            "monitoring" => Some(RolloutStage::Monitoring),
            "full_cutover" | "fullcutover" => Some(RolloutStage::FullCutover),
            "rolled_back" | "rolledback" => Some(RolloutStage::RolledBack),
            _ => None,
        }
    }

    /// FullCutover and RolledBack end a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutStage::FullCutover | RolloutStage::RolledBack)
    }
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted rollout record. Only [`crate::RolloutController`] produces new values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    pub stage: RolloutStage,
    pub cycle: u32,
    pub canary_percentage: u8,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_flag_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<HealthVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
    pub updated_by: String,
}

impl RolloutState {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            stage: RolloutStage::Validation,
            cycle: 1,
            canary_percentage: 0,
            entered_at: now,
            prior_flag_value: None,
            monitoring_deadline: None,
            last_metrics: None,
            last_reason: None,
            updated_by: "system".to_string(),
        }
    }

    /// Copy of this state moved into `stage`, keeping cycle bookkeeping.
    pub fn enter(&self, stage: RolloutStage, now: DateTime<Utc>, actor: &str) -> Self {
        Self {
            stage,
            entered_at: now,
            updated_by: actor.to_string(),
            ..self.clone()
        }
    }

    /// Compare-and-set key.
    pub fn version(&self) -> (RolloutStage, u32) {
        (self.stage, self.cycle)
    }
}

/// Rollout state plus derived, non-persisted facts.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub state: RolloutState,
    /// Monitoring time budget has elapsed. Informational; never advances the stage.
    pub budget_exhausted: bool,
    pub promotable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BreachReason {
    ErrorRate,
    P95Latency,
    ConflictRate,
}

impl BreachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachReason::ErrorRate => "error_rate",
            BreachReason::P95Latency => "p95_latency",
            BreachReason::ConflictRate => "conflict_rate",
        }
    }
}

impl fmt::Display for BreachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry point for the canary traffic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub at: DateTime<Utc>,
    /// Fraction of failed requests, 0.0..=1.0.
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    /// Duplicate-claim attempts per request.
    pub conflict_rate: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsWindow {
    /// Conflict rate observed on the legacy path before the migration.
    #[serde(default)]
    pub conflict_baseline: f64,
    #[serde(default)]
    pub samples: Vec<MetricSample>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthVerdict {
    pub healthy: bool,
    #[serde(default)]
    pub reasons: Vec<BreachReason>,
    pub evaluated_at: DateTime<Utc>,
    pub samples: usize,
    /// Seconds of continuous telemetry the verdict is based on.
    pub coverage_secs: i64,
}

impl HealthVerdict {
    pub fn breach(&self) -> Option<ThresholdBreach> {
        if self.healthy {
            return None;
        }
        Some(ThresholdBreach {
            reasons: self.reasons.clone(),
            observed_at: self.evaluated_at,
        })
    }
}

/// Internal signal that forces an automatic rollback. Never surfaced to end users.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdBreach {
    pub reasons: Vec<BreachReason>,
    pub observed_at: DateTime<Utc>,
}

impl ThresholdBreach {
    pub fn summary(&self) -> String {
        let codes: Vec<&str> = self.reasons.iter().map(|r| r.as_str()).collect();
        format!("sustained breach: {}", codes.join(","))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Pathway {
    Legacy,
    Function,
}

impl Pathway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pathway::Legacy => "legacy",
            Pathway::Function => "function",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => Some(Pathway::Legacy),
            "function" => Some(Pathway::Function),
            _ => None,
        }
    }
}

impl fmt::Display for Pathway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed username. Immutable after creation except for `verified`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: String,
    pub display_name: String,
    pub owner_id: String,
    pub domain: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub pathway: Pathway,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_slugs_round_trip_through_labels() {
        for stage in [
            RolloutStage::Validation,
            RolloutStage::Canary,
            RolloutStage::Monitoring,
            RolloutStage::FullCutover,
            RolloutStage::RolledBack,
        ] {
            assert_eq!(RolloutStage::from_slug(stage.as_str()), Some(stage));
        }
        assert_eq!(
            RolloutStage::from_slug("Full-Cutover"),
            Some(RolloutStage::FullCutover)
        );
        assert_eq!(RolloutStage::from_slug("done"), None);
    }

    #[test]
    fn only_cutover_and_rollback_are_terminal() {
        assert!(RolloutStage::FullCutover.is_terminal());
        assert!(RolloutStage::RolledBack.is_terminal());
        assert!(!RolloutStage::Monitoring.is_terminal());
    }

    #[test]
    fn healthy_verdict_carries_no_breach() {
        let verdict = HealthVerdict {
            healthy: true,
            reasons: Vec::new(),
            evaluated_at: Utc::now(),
            samples: 3,
            coverage_secs: 300,
        };
        assert!(verdict.breach().is_none());

        let verdict = HealthVerdict {
            healthy: false,
            reasons: vec![BreachReason::ErrorRate, BreachReason::ConflictRate],
            ..verdict
        };
        let breach = verdict.breach().expect("breach");
        assert_eq!(breach.summary(), "sustained breach: error_rate,conflict_rate");
    }

    #[test]
    fn flag_serializes_with_audit_fields_in_camel_case() {
        let flag = FeatureFlag::new("identity.function_pathway", &FlagDefaults::default(), Utc::now());
        let value = serde_json::to_value(&flag).expect("json");
        assert_eq!(value["enabled"], false);
        assert_eq!(value["lastModifiedBy"], "bootstrap");
        assert!(value.get("updatedAt").is_some());
    }
}
