//! Storage seams. Implementations must provide storage-level atomicity:
//! create-if-absent for flags, a unique constraint for usernames, and
//! compare-and-set for rollout state. Callers never emulate these with a
//! read followed by a write.

use async_trait::async_trait;

use crate::error::MigrationError;
use crate::model::{FeatureFlag, Identity, RolloutStage, RolloutState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Created(T),
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Created(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Flag mutation applied together with a rollout transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagWrite {
    pub name: String,
    pub enabled: bool,
    pub modified_by: String,
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get_flag(&self, name: &str) -> Result<Option<FeatureFlag>, MigrationError>;

    /// Atomically inserts `flag` unless a record with the same name exists, in
    /// which case the stored record is returned untouched.
    async fn insert_flag_if_absent(
        &self,
        flag: &FeatureFlag,
    ) -> Result<InsertOutcome<FeatureFlag>, MigrationError>;

    /// Updates `enabled` plus audit metadata. `NotFound` when no record exists.
    async fn set_flag_enabled(
        &self,
        name: &str,
        enabled: bool,
        modified_by: &str,
    ) -> Result<FeatureFlag, MigrationError>;
}

#[async_trait]
pub trait IdentityLedger: Send + Sync {
    /// Claims `identity.username`. Exactly one of any number of concurrent
    /// reservations for the same username succeeds; the rest get `Conflict`.
    async fn reserve(&self, identity: &Identity) -> Result<(), MigrationError>;

    /// Drops a reservation whose pathway dispatch failed.
    async fn release(&self, username: &str) -> Result<bool, MigrationError>;

    async fn find_identity(&self, username: &str) -> Result<Option<Identity>, MigrationError>;

    async fn set_verified(
        &self,
        username: &str,
        verified: bool,
    ) -> Result<Option<Identity>, MigrationError>;
}

#[async_trait]
pub trait RolloutStore: Send + Sync {
    async fn load_rollout(&self) -> Result<Option<RolloutState>, MigrationError>;

    /// Stores `initial` if no rollout record exists and returns whatever is stored.
    async fn init_rollout(&self, initial: &RolloutState) -> Result<RolloutState, MigrationError>;

    /// Replaces the record only if it is still at `expected` (stage, cycle).
    /// `flag`, when given, is written in the same atomic unit. Returns `false`
    /// without side effects when the expectation no longer holds.
    async fn swap_rollout(
        &self,
        expected: (RolloutStage, u32),
        next: &RolloutState,
        flag: Option<&FlagWrite>,
    ) -> Result<bool, MigrationError>;
}
