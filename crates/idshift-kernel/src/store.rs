use async_trait::async_trait;
use idshift_core::{
    FeatureFlag, FlagStore, FlagWrite, Identity, IdentityLedger, InsertOutcome, MigrationError,
    RolloutStage, RolloutState, RolloutStore,
};

use crate::Kernel;

fn unavailable(err: anyhow::Error) -> MigrationError {
    tracing::warn!(error = %format!("{err:#}"), "sqlite operation failed");
    MigrationError::StorageUnavailable(format!("{err:#}"))
}

#[async_trait]
impl FlagStore for Kernel {
    async fn get_flag(&self, name: &str) -> Result<Option<FeatureFlag>, MigrationError> {
        let name = name.to_string();
        self.blocking(move |k| k.read_flag(&name))
            .await
            .map_err(unavailable)
    }

    async fn insert_flag_if_absent(
        &self,
        flag: &FeatureFlag,
    ) -> Result<InsertOutcome<FeatureFlag>, MigrationError> {
        let flag = flag.clone();
        self.blocking(move |k| k.insert_flag(&flag))
            .await
            .map_err(unavailable)
    }

    async fn set_flag_enabled(
        &self,
        name: &str,
        enabled: bool,
        modified_by: &str,
    ) -> Result<FeatureFlag, MigrationError> {
        let (n, by) = (name.to_string(), modified_by.to_string());
        self.blocking(move |k| k.update_flag_enabled(&n, enabled, &by))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| MigrationError::NotFound(format!("flag `{name}`")))
    }
}

#[async_trait]
impl IdentityLedger for Kernel {
    async fn reserve(&self, identity: &Identity) -> Result<(), MigrationError> {
        let candidate = identity.clone();
        let reserved = self
            .blocking(move |k| k.reserve_identity(&candidate))
            .await
            .map_err(unavailable)?;
        if reserved {
            Ok(())
        } else {
            Err(MigrationError::Conflict(identity.username.clone()))
        }
    }

    async fn release(&self, username: &str) -> Result<bool, MigrationError> {
        let u = username.to_string();
        self.blocking(move |k| k.release_identity(&u))
            .await
            .map_err(unavailable)
    }

    async fn find_identity(&self, username: &str) -> Result<Option<Identity>, MigrationError> {
        let u = username.to_string();
        self.blocking(move |k| k.get_identity(&u))
            .await
            .map_err(unavailable)
    }

    async fn set_verified(
        &self,
        username: &str,
        verified: bool,
    ) -> Result<Option<Identity>, MigrationError> {
        let u = username.to_string();
        self.blocking(move |k| k.set_identity_verified(&u, verified))
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl RolloutStore for Kernel {
    async fn load_rollout(&self) -> Result<Option<RolloutState>, MigrationError> {
        self.blocking(|k| k.read_rollout()).await.map_err(unavailable)
    }

    async fn init_rollout(&self, initial: &RolloutState) -> Result<RolloutState, MigrationError> {
        let initial = initial.clone();
        self.blocking(move |k| k.insert_rollout_if_absent(&initial))
            .await
            .map_err(unavailable)
    }

    async fn swap_rollout(
        &self,
        expected: (RolloutStage, u32),
        next: &RolloutState,
        flag: Option<&FlagWrite>,
    ) -> Result<bool, MigrationError> {
        let next = next.clone();
        let flag = flag.cloned();
        self.blocking(move |k| k.cas_rollout(expected, &next, flag.as_ref()))
            .await
            .map_err(unavailable)
    }
}
