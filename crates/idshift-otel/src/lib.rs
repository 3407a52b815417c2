//! Tracing setup shared by the idshift binaries.
//!
//! Console output goes to stderr so command results on stdout stay machine
//! readable. Events on the `idshift.audit` target (flag changes, stage
//! transitions, identity decisions) can additionally be written to a rolling
//! file by setting `IDSHIFT_AUDIT_LOG_ROLL=1`.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

pub const AUDIT_TARGET: &str = "idshift.audit";

static AUDIT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditLogSettings {
    pub dir: String,
    pub prefix: String,
    pub rotation: String,
}

impl AuditLogSettings {
    /// `None` unless `IDSHIFT_AUDIT_LOG_ROLL=1`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if get("IDSHIFT_AUDIT_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        let dir = get("IDSHIFT_AUDIT_LOG_DIR")
            .or_else(|| get("IDSHIFT_LOGS_DIR"))
            .unwrap_or_else(|| "logs".to_string());
        let prefix = get("IDSHIFT_AUDIT_LOG_PREFIX").unwrap_or_else(|| "audit".into());
        let rotation = get("IDSHIFT_AUDIT_LOG_ROTATION")
            .map(|r| r.to_lowercase())
            .unwrap_or_else(|| "daily".into());
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }

    fn writer(&self) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation.as_str() {
            "hourly" => tracing_appender::rolling::hourly(&self.dir, &self.prefix),
            "minutely" => tracing_appender::rolling::minutely(&self.dir, &self.prefix),
            "never" => tracing_appender::rolling::never(&self.dir, &self.prefix),
            _ => tracing_appender::rolling::daily(&self.dir, &self.prefix),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));

    match AuditLogSettings::from_lookup(|k| std::env::var(k).ok()) {
        Some(settings) => {
            if std::fs::create_dir_all(&settings.dir).is_err() {
                tracing::warn!(directory = %settings.dir, "failed to create audit log directory");
            }
            let (nb, guard) = tracing_appender::non_blocking(settings.writer());
            let _ = AUDIT_GUARD.set(guard);
            let targets = Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO);
            let audit_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb)
                .with_filter(targets);
            let _ = registry.with(audit_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}
