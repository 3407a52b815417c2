//! Effective flag values. An override, when defined at all, always wins over
//! the stored record; a missing record resolves to `false`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::FlagStore;

/// Where operator overrides come from. `Some` means "defined", even when empty.
pub trait OverrideSource: Send + Sync {
    fn lookup(&self, flag: &str) -> Option<String>;
}

/// Process environment, keyed `IDSHIFT_FLAG_<NAME>` with every
/// non-alphanumeric character of the flag name mapped to `_`.
#[derive(Clone, Debug)]
pub struct ProcessEnv {
    prefix: String,
}

impl Default for ProcessEnv {
    fn default() -> Self {
        Self {
            prefix: "IDSHIFT_FLAG_".to_string(),
        }
    }
}

impl ProcessEnv {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key_for(&self, flag: &str) -> String {
        let suffix: String = flag
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl OverrideSource for ProcessEnv {
    fn lookup(&self, flag: &str) -> Option<String> {
        std::env::var(self.key_for(flag)).ok()
    }
}

/// Fixed override table, for embedding and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticOverrides(HashMap<String, String>);

impl StaticOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: impl Into<String>, raw: impl Into<String>) -> Self {
        self.0.insert(flag.into(), raw.into());
        self
    }
}

impl OverrideSource for StaticOverrides {
    fn lookup(&self, flag: &str) -> Option<String> {
        self.0.get(flag).cloned()
    }
}

/// Only the literal `true` (trimmed, any case) enables; anything else disables.
pub fn parse_override(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ResolutionSource {
    Override {
        raw: String,
    },
    Stored {
        last_modified_by: String,
        updated_at: DateTime<Utc>,
    },
    /// No record: fail-closed default.
    Default,
    /// Store could not be read: fail-closed default.
    Unavailable {
        error: String,
    },
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Resolution {
    pub flag: String,
    pub value: bool,
    pub source: ResolutionSource,
}

#[derive(Clone)]
pub struct FlagResolver {
    store: Arc<dyn FlagStore>,
    overrides: Arc<dyn OverrideSource>,
}

impl FlagResolver {
    pub fn new(store: Arc<dyn FlagStore>, overrides: Arc<dyn OverrideSource>) -> Self {
        Self { store, overrides }
    }

    pub fn from_env(store: Arc<dyn FlagStore>) -> Self {
        Self::new(store, Arc::new(ProcessEnv::default()))
    }

    /// Effective value of `flag`. Never fails.
    pub async fn resolve(&self, flag: &str) -> bool {
        self.explain(flag).await.value
    }

    pub async fn explain(&self, flag: &str) -> Resolution {
        if let Some(raw) = self.overrides.lookup(flag) {
            let value = parse_override(&raw);
            debug!(flag, value, "flag resolved from override");
            return Resolution {
                flag: flag.to_string(),
                value,
                source: ResolutionSource::Override { raw },
            };
        }
        match self.store.get_flag(flag).await {
            Ok(Some(record)) => Resolution {
                flag: flag.to_string(),
                value: record.enabled,
                source: ResolutionSource::Stored {
                    last_modified_by: record.last_modified_by,
                    updated_at: record.updated_at,
                },
            },
            Ok(None) => Resolution {
                flag: flag.to_string(),
                value: false,
                source: ResolutionSource::Default,
            },
            Err(err) => {
                warn!(flag, error = %err, "flag store unreadable; resolving to false");
                Resolution {
                    flag: flag.to_string(),
                    value: false,
                    source: ResolutionSource::Unavailable {
                        error: err.to_string(),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureFlag, FlagDefaults};
    use crate::test_support::MemoryStore;
    use serial_test::serial;

    const FLAG: &str = "identity.function_pathway";

    fn resolver(store: Arc<MemoryStore>, overrides: StaticOverrides) -> FlagResolver {
        FlagResolver::new(store, Arc::new(overrides))
    }

    async fn seed(store: &MemoryStore, enabled: bool) {
        let defaults = FlagDefaults {
            enabled,
            ..FlagDefaults::default()
        };
        store
            .insert_flag_if_absent(&FeatureFlag::new(FLAG, &defaults, Utc::now()))
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn unset_override_uses_stored_false() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, false).await;
        assert!(!resolver(store, StaticOverrides::new()).resolve(FLAG).await);
    }

    #[tokio::test]
    async fn true_override_beats_stored_false() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, false).await;
        let r = resolver(store, StaticOverrides::new().with(FLAG, "true"));
        assert!(r.resolve(FLAG).await);
    }

    #[tokio::test]
    async fn any_defined_override_beats_stored_true() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, true).await;
        for raw in ["", "false", "1", "yes", "enabled"] {
            let r = resolver(store.clone(), StaticOverrides::new().with(FLAG, raw));
            let res = r.explain(FLAG).await;
            assert!(!res.value, "override {raw:?} must win");
            assert_eq!(res.source, ResolutionSource::Override { raw: raw.into() });
        }
    }

    #[tokio::test]
    async fn missing_record_is_fail_closed() {
        let store = Arc::new(MemoryStore::default());
        let res = resolver(store, StaticOverrides::new()).explain(FLAG).await;
        assert!(!res.value);
        assert_eq!(res.source, ResolutionSource::Default);
    }

    #[tokio::test]
    async fn store_failure_resolves_false_without_error() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, true).await;
        store.fail_next_reads(1);
        let res = resolver(store, StaticOverrides::new()).explain(FLAG).await;
        assert!(!res.value);
        assert!(matches!(res.source, ResolutionSource::Unavailable { .. }));
    }

    #[test]
    fn override_parsing_accepts_only_true() {
        assert!(parse_override("true"));
        assert!(parse_override(" TRUE "));
        assert!(!parse_override(""));
        assert!(!parse_override("1"));
        assert!(!parse_override("truthy"));
    }

    #[test]
    fn env_key_is_upper_snake() {
        let env = ProcessEnv::default();
        assert_eq!(
            env.key_for("identity.function-pathway"),
            "IDSHIFT_FLAG_IDENTITY_FUNCTION_PATHWAY"
        );
    }

    #[tokio::test]
    #[serial]
    async fn process_env_override_wins() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, false).await;
        let key = ProcessEnv::default().key_for(FLAG);
        std::env::set_var(&key, "true");
        let r = FlagResolver::from_env(store.clone());
        assert!(r.resolve(FLAG).await);
        std::env::set_var(&key, "");
        assert!(!r.resolve(FLAG).await);
        std::env::remove_var(&key);
        store.set_flag_enabled(FLAG, true, "ops").await.expect("set");
        assert!(r.resolve(FLAG).await);
    }
}
