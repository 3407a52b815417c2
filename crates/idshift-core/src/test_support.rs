//! In-memory store and manual clock for exercising the core without SQLite.
//! The store upholds the same atomicity contracts as the kernel: every trait
//! call runs under one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::error::MigrationError;
use crate::model::{FeatureFlag, Identity, RolloutStage, RolloutState};
use crate::store::{FlagStore, FlagWrite, IdentityLedger, InsertOutcome, RolloutStore};

#[derive(Default)]
struct Inner {
    flags: HashMap<String, FeatureFlag>,
    identities: HashMap<String, Identity>,
    rollout: Option<RolloutState>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    /// The next `n` reads fail with `StorageUnavailable`.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// The next `n` writes fail with `StorageUnavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn flag_count(&self) -> usize {
        self.lock().flags.len()
    }

    pub fn identity_count(&self) -> usize {
        self.lock().identities.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn trip(counter: &AtomicU32) -> Result<(), MigrationError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(MigrationError::StorageUnavailable(
                "injected failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn read_gate(&self) -> Result<(), MigrationError> {
        Self::trip(&self.failing_reads)
    }

    fn write_gate(&self) -> Result<(), MigrationError> {
        Self::trip(&self.failing_writes)
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn get_flag(&self, name: &str) -> Result<Option<FeatureFlag>, MigrationError> {
        self.read_gate()?;
        Ok(self.lock().flags.get(name).cloned())
    }

    async fn insert_flag_if_absent(
        &self,
        flag: &FeatureFlag,
    ) -> Result<InsertOutcome<FeatureFlag>, MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        if let Some(existing) = inner.flags.get(&flag.name) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        inner.flags.insert(flag.name.clone(), flag.clone());
        Ok(InsertOutcome::Created(flag.clone()))
    }

    async fn set_flag_enabled(
        &self,
        name: &str,
        enabled: bool,
        modified_by: &str,
    ) -> Result<FeatureFlag, MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        let Some(flag) = inner.flags.get_mut(name) else {
            return Err(MigrationError::NotFound(format!("flag `{name}`")));
        };
        flag.enabled = enabled;
        flag.last_modified_by = modified_by.to_string();
        flag.updated_at = Utc::now();
        Ok(flag.clone())
    }
}

#[async_trait]
impl IdentityLedger for MemoryStore {
    async fn reserve(&self, identity: &Identity) -> Result<(), MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        if inner.identities.contains_key(&identity.username) {
            return Err(MigrationError::Conflict(identity.username.clone()));
        }
        inner
            .identities
            .insert(identity.username.clone(), identity.clone());
        Ok(())
    }

    async fn release(&self, username: &str) -> Result<bool, MigrationError> {
        self.write_gate()?;
        Ok(self.lock().identities.remove(username).is_some())
    }

    async fn find_identity(&self, username: &str) -> Result<Option<Identity>, MigrationError> {
        self.read_gate()?;
        Ok(self.lock().identities.get(username).cloned())
    }

    async fn set_verified(
        &self,
        username: &str,
        verified: bool,
    ) -> Result<Option<Identity>, MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        Ok(inner.identities.get_mut(username).map(|identity| {
            identity.verified = verified;
            identity.clone()
        }))
    }
}

#[async_trait]
impl RolloutStore for MemoryStore {
    async fn load_rollout(&self) -> Result<Option<RolloutState>, MigrationError> {
        self.read_gate()?;
        Ok(self.lock().rollout.clone())
    }

    async fn init_rollout(&self, initial: &RolloutState) -> Result<RolloutState, MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        Ok(inner.rollout.get_or_insert_with(|| initial.clone()).clone())
    }

    async fn swap_rollout(
        &self,
        expected: (RolloutStage, u32),
        next: &RolloutState,
        flag: Option<&FlagWrite>,
    ) -> Result<bool, MigrationError> {
        self.write_gate()?;
        let mut inner = self.lock();
        let matches = inner
            .rollout
            .as_ref()
            .map(|current| current.version() == expected)
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        if let Some(write) = flag {
            let now = Utc::now();
            let entry = inner
                .flags
                .entry(write.name.clone())
                .or_insert_with(|| FeatureFlag {
                    name: write.name.clone(),
                    enabled: write.enabled,
                    description: String::new(),
                    last_modified_by: write.modified_by.clone(),
                    updated_at: now,
                });
            entry.enabled = write.enabled;
            entry.last_modified_by = write.modified_by.clone();
            entry.updated_at = now;
        }
        inner.rollout = Some(next.clone());
        Ok(true)
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().expect("clock lock poisoned");
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
