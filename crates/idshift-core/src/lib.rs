//! Core of the identity API migration: feature-flag resolution with
//! environment-override precedence, idempotent flag bootstrap, sustained-breach
//! health evaluation, the staged rollout state machine, and username
//! allocation routed across the legacy and function-based pathways.
//!
//! Persistence is abstracted behind the traits in [`store`]; `idshift-kernel`
//! provides the SQLite implementation.

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod monitor;
pub mod pathway;
pub mod resolver;
pub mod retry;
pub mod rollout;
pub mod store;

#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use bootstrap::BootstrapGuard;
pub use clock::{Clock, SystemClock};
pub use config::{load_config, Config};
pub use error::MigrationError;
pub use identity::{validate_username, IdentityAllocator};
pub use model::*;
pub use monitor::MonitorEvaluator;
pub use pathway::{AllocationPathway, HttpPathway, LocalPathway};
pub use resolver::{FlagResolver, OverrideSource, ProcessEnv, Resolution, ResolutionSource};
pub use retry::RetryPolicy;
pub use rollout::{Observation, RolloutController, StageConfirmation};
pub use store::{FlagStore, FlagWrite, IdentityLedger, InsertOutcome, RolloutStore};
