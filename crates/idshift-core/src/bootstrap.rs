use std::sync::Arc;

use chrono::Utc;
use idshift_events::Bus;
use idshift_topics::TOPIC_FLAGS_BOOTSTRAPPED;
use serde_json::json;
use tracing::{debug, info};

use crate::error::MigrationError;
use crate::model::{FeatureFlag, FlagDefaults};
use crate::store::{FlagStore, InsertOutcome};

/// Makes sure a flag record exists before first use. Safe to call from any
/// number of concurrent callers: all of them end up with the single stored record.
#[derive(Clone)]
pub struct BootstrapGuard {
    store: Arc<dyn FlagStore>,
    bus: Option<Bus>,
}

impl BootstrapGuard {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn ensure_flag(
        &self,
        name: &str,
        defaults: &FlagDefaults,
    ) -> Result<FeatureFlag, MigrationError> {
        if name.trim().is_empty() {
            return Err(MigrationError::Validation {
                field: "flag name",
                value: name.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(existing) = self.store.get_flag(name).await? {
            return Ok(existing);
        }
        let candidate = FeatureFlag::new(name, defaults, Utc::now());
        match self.store.insert_flag_if_absent(&candidate).await? {
            InsertOutcome::Created(flag) => {
                info!(
                    target: "idshift.audit",
                    flag = %flag.name,
                    enabled = flag.enabled,
                    by = %flag.last_modified_by,
                    "flag bootstrapped"
                );
                if let Some(bus) = &self.bus {
                    bus.publish(
                        TOPIC_FLAGS_BOOTSTRAPPED,
                        &json!({"name": flag.name, "enabled": flag.enabled}),
                    );
                }
                Ok(flag)
            }
            InsertOutcome::Existing(flag) => {
                debug!(flag = %flag.name, "flag created concurrently; reusing stored record");
                Ok(flag)
            }
        }
    }
}
