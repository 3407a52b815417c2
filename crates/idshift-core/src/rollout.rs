//! Staged migration controller.
//!
//! ```text
//! Validation --checks-passed--> Canary --canary-enabled--> Monitoring
//! Monitoring --promote (healthy window + operator)--> FullCutover
//! Monitoring --rollback (operator or sustained breach)--> RolledBack
//! RolledBack --restart--> Validation (next cycle)
//! ```
//!
//! Every transition is a compare-and-set on the stored `(stage, cycle)`, so of
//! two racing commands (say a manual and an automatic rollback) exactly one
//! applies and the other is rejected as `InvalidTransition`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use idshift_events::Bus;
use idshift_topics as topics;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapGuard;
use crate::clock::{Clock, SystemClock};
use crate::config::{FlagConfig, RolloutConfig};
use crate::error::MigrationError;
use crate::model::{
    FlagDefaults, HealthVerdict, MetricsWindow, RolloutStage, RolloutState, RolloutStatus,
};
use crate::monitor::MonitorEvaluator;
use crate::store::{FlagStore, FlagWrite, RolloutStore};

/// Operator confirmation naming the step being confirmed. Must match the current stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageConfirmation {
    /// Pre-cutover checks passed: Validation -> Canary.
    ChecksPassed,
    /// Canary traffic enabled: Canary -> Monitoring.
    CanaryEnabled,
    /// Promote after a healthy window: Monitoring -> FullCutover.
    Promote,
}

impl StageConfirmation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageConfirmation::ChecksPassed => "checks-passed",
            StageConfirmation::CanaryEnabled => "canary-enabled",
            StageConfirmation::Promote => "promote",
        }
    }
}

impl fmt::Display for StageConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageConfirmation {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "checks-passed" => Ok(StageConfirmation::ChecksPassed),
            "canary-enabled" => Ok(StageConfirmation::CanaryEnabled),
            "promote" | "full-cutover" => Ok(StageConfirmation::Promote),
            other => Err(MigrationError::Validation {
                field: "stage confirmation",
                value: other.to_string(),
                reason: "expected checks-passed, canary-enabled or promote".to_string(),
            }),
        }
    }
}

/// Outcome of feeding telemetry to the controller.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub verdict: HealthVerdict,
    pub rolled_back: bool,
    pub state: RolloutState,
}

pub struct RolloutController {
    store: Arc<dyn RolloutStore>,
    flags: Arc<dyn FlagStore>,
    evaluator: MonitorEvaluator,
    cfg: RolloutConfig,
    flag_name: String,
    clock: Arc<dyn Clock>,
    bus: Option<Bus>,
}

impl RolloutController {
    /// Bootstraps the governing flag and the rollout record, then returns the controller.
    pub async fn open(
        store: Arc<dyn RolloutStore>,
        flags: Arc<dyn FlagStore>,
        flag: &FlagConfig,
        cfg: RolloutConfig,
        evaluator: MonitorEvaluator,
    ) -> Result<Self, MigrationError> {
        Self::open_with(store, flags, flag, cfg, evaluator, Arc::new(SystemClock), None).await
    }

    pub async fn open_with(
        store: Arc<dyn RolloutStore>,
        flags: Arc<dyn FlagStore>,
        flag: &FlagConfig,
        cfg: RolloutConfig,
        evaluator: MonitorEvaluator,
        clock: Arc<dyn Clock>,
        bus: Option<Bus>,
    ) -> Result<Self, MigrationError> {
        let mut guard = BootstrapGuard::new(flags.clone());
        if let Some(bus) = &bus {
            guard = guard.with_bus(bus.clone());
        }
        guard
            .ensure_flag(&flag.name, &FlagDefaults::described(flag.description.clone()))
            .await?;
        store.init_rollout(&RolloutState::initial(clock.now())).await?;
        Ok(Self {
            store,
            flags,
            evaluator,
            cfg,
            flag_name: flag.name.clone(),
            clock,
            bus,
        })
    }

    pub fn flag_name(&self) -> &str {
        &self.flag_name
    }

    pub async fn state(&self) -> Result<RolloutState, MigrationError> {
        self.store
            .load_rollout()
            .await?
            .ok_or_else(|| MigrationError::NotFound("rollout state".to_string()))
    }

    pub async fn status(&self) -> Result<RolloutStatus, MigrationError> {
        let state = self.state().await?;
        let now = self.clock.now();
        let budget_exhausted = state.stage == RolloutStage::Monitoring
            && state
                .monitoring_deadline
                .map(|deadline| now >= deadline)
                .unwrap_or(false);
        let blocked_by = self.promotion_blocker(&state, now);
        Ok(RolloutStatus {
            promotable: blocked_by.is_none(),
            budget_exhausted,
            blocked_by,
            state,
        })
    }

    /// Operator-confirmed forward step.
    pub async fn advance(
        &self,
        confirmation: StageConfirmation,
        actor: &str,
    ) -> Result<RolloutState, MigrationError> {
        let current = self.state().await?;
        let now = self.clock.now();
        match (current.stage, confirmation) {
            (RolloutStage::Validation, StageConfirmation::ChecksPassed) => {
                let prior = self
                    .flags
                    .get_flag(&self.flag_name)
                    .await?
                    .map(|flag| flag.enabled)
                    .unwrap_or(false);
                let mut next = current.enter(RolloutStage::Canary, now, actor);
                next.canary_percentage = self.cfg.canary_percentage;
                next.prior_flag_value = Some(prior);
                self.commit(&current, next, None, "checks-passed").await
            }
            (RolloutStage::Canary, StageConfirmation::CanaryEnabled) => {
                let mut next = current.enter(RolloutStage::Monitoring, now, actor);
                next.monitoring_deadline =
                    Some(now + seconds(self.cfg.monitoring_budget_secs));
                next.last_metrics = None;
                self.commit(&current, next, None, "canary-enabled").await
            }
            (RolloutStage::Monitoring, StageConfirmation::Promote) => {
                if let Some(blocker) = self.promotion_blocker(&current, now) {
                    return Err(MigrationError::InvalidTransition {
                        stage: current.stage,
                        command: "promote",
                        detail: blocker,
                    });
                }
                let mut next = current.enter(RolloutStage::FullCutover, now, actor);
                next.canary_percentage = 100;
                let write = FlagWrite {
                    name: self.flag_name.clone(),
                    enabled: true,
                    modified_by: actor.to_string(),
                };
                let state = self.commit(&current, next, Some(&write), "promote").await?;
                self.publish(topics::TOPIC_ROLLOUT_PROMOTED, &state);
                Ok(state)
            }
            (stage, confirmation) => Err(MigrationError::invalid_transition(
                stage,
                confirmation.as_str(),
            )),
        }
    }

    /// Manual rollback. Only valid while monitoring.
    pub async fn rollback(&self, reason: &str, actor: &str) -> Result<RolloutState, MigrationError> {
        let current = self.state().await?;
        self.roll_back_from(&current, reason, actor, None).await
    }

    /// Evaluates telemetry; a sustained breach rolls back automatically.
    pub async fn observe(&self, window: &MetricsWindow) -> Result<Observation, MigrationError> {
        let current = self.state().await?;
        if current.stage != RolloutStage::Monitoring {
            return Err(MigrationError::invalid_transition(current.stage, "observe"));
        }
        let window = samples_since(window, current.entered_at);
        let verdict = self.evaluator.evaluate(&window);
        self.publish(topics::TOPIC_MONITOR_EVALUATED, &verdict);

        if let Some(breach) = verdict.breach() {
            warn!(
                reasons = %breach.summary(),
                cycle = current.cycle,
                "sustained threshold breach; rolling back"
            );
            self.publish(topics::TOPIC_MONITOR_BREACH, &breach);
            let state = self
                .roll_back_from(&current, &breach.summary(), "monitor", Some(verdict.clone()))
                .await?;
            return Ok(Observation {
                verdict,
                rolled_back: true,
                state,
            });
        }

        let mut next = current.clone();
        next.last_metrics = Some(verdict.clone());
        let state = self.commit(&current, next, None, "observe").await?;
        Ok(Observation {
            verdict,
            rolled_back: false,
            state,
        })
    }

    /// Starts a new cycle after a rollback.
    pub async fn restart(&self, actor: &str) -> Result<RolloutState, MigrationError> {
        let current = self.state().await?;
        if current.stage != RolloutStage::RolledBack {
            return Err(MigrationError::invalid_transition(current.stage, "restart"));
        }
        let mut next = RolloutState::initial(self.clock.now());
        next.cycle = current.cycle.saturating_add(1);
        next.updated_by = actor.to_string();
        let state = self.commit(&current, next, None, "restart").await?;
        self.publish(topics::TOPIC_ROLLOUT_RESTARTED, &state);
        Ok(state)
    }

    async fn roll_back_from(
        &self,
        current: &RolloutState,
        reason: &str,
        actor: &str,
        verdict: Option<HealthVerdict>,
    ) -> Result<RolloutState, MigrationError> {
        if current.stage != RolloutStage::Monitoring {
            return Err(MigrationError::invalid_transition(current.stage, "rollback"));
        }
        let mut next = current.enter(RolloutStage::RolledBack, self.clock.now(), actor);
        next.canary_percentage = 0;
        next.last_reason = Some(reason.to_string());
        if verdict.is_some() {
            next.last_metrics = verdict;
        }
        let write = FlagWrite {
            name: self.flag_name.clone(),
            enabled: current.prior_flag_value.unwrap_or(false),
            modified_by: actor.to_string(),
        };
        let state = self.commit(current, next, Some(&write), "rollback").await?;
        self.publish(
            topics::TOPIC_ROLLOUT_ROLLED_BACK,
            &json!({"cycle": state.cycle, "reason": reason, "by": actor}),
        );
        Ok(state)
    }

    async fn commit(
        &self,
        current: &RolloutState,
        next: RolloutState,
        flag: Option<&FlagWrite>,
        command: &'static str,
    ) -> Result<RolloutState, MigrationError> {
        let applied = self
            .store
            .swap_rollout(current.version(), &next, flag)
            .await?;
        if !applied {
            let stage = self
                .store
                .load_rollout()
                .await?
                .map(|s| s.stage)
                .unwrap_or(current.stage);
            warn!(command, %stage, "rollout changed concurrently; command rejected");
            return Err(MigrationError::InvalidTransition {
                stage,
                command,
                detail: "rollout state changed concurrently".to_string(),
            });
        }
        if next.stage != current.stage {
            info!(
                target: "idshift.audit",
                from = %current.stage,
                to = %next.stage,
                cycle = next.cycle,
                canary = next.canary_percentage,
                by = %next.updated_by,
                "rollout stage changed"
            );
            self.publish(
                topics::TOPIC_ROLLOUT_STAGE_CHANGED,
                &json!({
                    "from": current.stage,
                    "to": next.stage,
                    "cycle": next.cycle,
                    "canaryPercentage": next.canary_percentage,
                    "by": next.updated_by,
                }),
            );
        }
        if let Some(write) = flag {
            info!(
                target: "idshift.audit",
                flag = %write.name,
                enabled = write.enabled,
                by = %write.modified_by,
                "flag written by rollout"
            );
            self.publish(
                topics::TOPIC_FLAGS_UPDATED,
                &json!({"name": write.name, "enabled": write.enabled, "by": write.modified_by}),
            );
        }
        Ok(next)
    }

    /// `None` when a promote confirmation would be accepted right now.
    fn promotion_blocker(&self, state: &RolloutState, now: DateTime<Utc>) -> Option<String> {
        if state.stage != RolloutStage::Monitoring {
            return Some(format!("rollout is in stage {}", state.stage));
        }
        let required = seconds(self.cfg.min_healthy_secs);
        if now - state.entered_at < required {
            return Some(format!(
                "monitoring needs {}s before promotion",
                self.cfg.min_healthy_secs
            ));
        }
        let Some(verdict) = state.last_metrics.as_ref() else {
            return Some("no health evaluation recorded in this cycle".to_string());
        };
        if !verdict.healthy {
            return Some("last health evaluation was unhealthy".to_string());
        }
        if verdict.samples == 0 || verdict.evaluated_at < state.entered_at {
            return Some("no telemetry recorded in this monitoring stage".to_string());
        }
        let max_age = seconds(self.evaluator.config().max_gap_secs);
        if now - verdict.evaluated_at > max_age {
            return Some(format!(
                "last health evaluation is {}s old",
                (now - verdict.evaluated_at).num_seconds()
            ));
        }
        if verdict.coverage_secs < required.num_seconds() {
            return Some(format!(
                "healthy telemetry covers {}s of the required {}s",
                verdict.coverage_secs, self.cfg.min_healthy_secs
            ));
        }
        None
    }

    fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        if let Some(bus) = &self.bus {
            bus.publish(kind, payload);
        }
    }
}

/// Only telemetry from the current stage may vouch for it.
fn samples_since(window: &MetricsWindow, since: DateTime<Utc>) -> MetricsWindow {
    let samples: Vec<_> = window
        .samples
        .iter()
        .filter(|s| s.at >= since)
        .cloned()
        .collect();
    let dropped = window.samples.len() - samples.len();
    if dropped > 0 {
        debug!(dropped, since = %since, "ignoring telemetry from before the monitoring stage");
    }
    MetricsWindow {
        conflict_baseline: window.conflict_baseline,
        samples,
    }
}

const MAX_BUDGET_SECS: i64 = 365 * 24 * 60 * 60;

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(MAX_BUDGET_SECS).min(MAX_BUDGET_SECS))
}
