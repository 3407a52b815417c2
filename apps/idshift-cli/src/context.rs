use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use idshift_core::{
    load_config, AllocationPathway, BootstrapGuard, Config, FlagResolver, HttpPathway,
    IdentityAllocator, LocalPathway, MigrationError, MonitorEvaluator, Pathway, RetryPolicy,
    RolloutController, SystemClock,
};
use idshift_events::{Bus, Envelope};
use idshift_kernel::Kernel;
use tokio::sync::broadcast;

/// Everything a storage-backed command needs: config, the SQLite kernel and
/// the event bus whose traffic is journaled when the command finishes.
pub struct AppContext {
    pub config: Config,
    pub kernel: Arc<Kernel>,
    pub bus: Bus,
    pub retry: RetryPolicy,
    journal_rx: broadcast::Receiver<Envelope>,
}

impl AppContext {
    /// `explicit` (flag or `IDSHIFT_CONFIG`), else `./idshift.toml` when it
    /// exists, else built-in defaults.
    pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            return load_config(path)
                .with_context(|| format!("loading config {}", path.display()));
        }
        let local = Path::new("idshift.toml");
        if local.exists() {
            return load_config(local).context("loading ./idshift.toml");
        }
        Ok(Config::default())
    }

    pub async fn open(config: Config) -> Result<Self> {
        let dir = config.state_dir();
        let kernel = {
            let open_dir = dir.clone();
            tokio::task::spawn_blocking(move || Kernel::open(&open_dir))
                .await
                .context("opening state")?
                .with_context(|| format!("opening state dir {}", dir.display()))?
        };
        tracing::debug!(db = %kernel.db_path().display(), "kernel ready");
        let bus = Bus::new(1024);
        let journal_rx = bus.subscribe();
        Ok(Self {
            config,
            kernel: Arc::new(kernel),
            bus,
            retry: RetryPolicy::default(),
            journal_rx,
        })
    }

    pub fn resolver(&self) -> FlagResolver {
        FlagResolver::from_env(self.kernel.clone())
    }

    pub fn guard(&self) -> BootstrapGuard {
        BootstrapGuard::new(self.kernel.clone()).with_bus(self.bus.clone())
    }

    pub async fn controller(&self) -> Result<RolloutController> {
        let kernel = &self.kernel;
        let flag = &self.config.flag;
        let rollout = &self.config.rollout;
        let monitor = &self.config.monitor;
        let bus = &self.bus;
        let ctl = self
            .retry
            .run("open rollout", move || {
                RolloutController::open_with(
                    kernel.clone(),
                    kernel.clone(),
                    flag,
                    rollout.clone(),
                    MonitorEvaluator::new(monitor.clone()),
                    Arc::new(SystemClock),
                    Some(bus.clone()),
                )
            })
            .await
            .context("opening rollout controller")?;
        Ok(ctl)
    }

    pub fn allocator(&self) -> Result<IdentityAllocator> {
        let identity = &self.config.identity;
        let legacy = self.pathway(Pathway::Legacy, identity.legacy_endpoint.as_deref())?;
        let function = self.pathway(Pathway::Function, identity.function_endpoint.as_deref())?;
        Ok(IdentityAllocator::new(
            self.kernel.clone(),
            self.resolver(),
            self.config.flag.name.clone(),
            identity.domain.clone(),
            legacy,
            function,
        )
        .with_bus(self.bus.clone()))
    }

    fn pathway(
        &self,
        which: Pathway,
        endpoint: Option<&str>,
    ) -> Result<Arc<dyn AllocationPathway>> {
        let pathway: Arc<dyn AllocationPathway> = match endpoint {
            Some(url) => Arc::new(
                HttpPathway::new(which, url, self.config.identity.timeout())
                    .with_context(|| format!("building {which} pathway client"))?,
            ),
            None => Arc::new(LocalPathway(which)),
        };
        Ok(pathway)
    }

    /// Persists everything published on the bus during this command.
    pub async fn flush_journal(mut self) {
        let kernel = &self.kernel;
        for env in Bus::drain(&mut self.journal_rx) {
            let env = &env;
            let res = self
                .retry
                .run("journal event", move || async move {
                    kernel
                        .append_event_async(env)
                        .await
                        .map_err(|e| MigrationError::StorageUnavailable(format!("{e:#}")))
                })
                .await;
            if let Err(err) = res {
                tracing::warn!(kind = %env.kind, error = %err, "failed to journal event");
            }
        }
    }
}
