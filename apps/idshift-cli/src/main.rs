use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use idshift_core::MigrationError;
use serde_json::json;

mod commands;
mod context;

use commands::{ConfigCmd, EventsCmd, FlagCmd, IdentityCmd, MonitorCmd, Output, RolloutCmd};
use context::AppContext;

#[derive(Parser)]
#[command(name = "idshift", version, about = "Identity API migration controller")]
struct Cli {
    /// Path to idshift.toml (defaults to ./idshift.toml when present)
    #[arg(long, global = true, env = "IDSHIFT_CONFIG")]
    config: Option<PathBuf>,
    /// Emit JSON instead of a human summary
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feature flag helpers (resolve, explain, ensure, set, show)
    Flag {
        #[command(subcommand)]
        cmd: FlagCmd,
    },
    /// Staged rollout of the function-based pathway
    Rollout {
        #[command(subcommand)]
        cmd: RolloutCmd,
    },
    /// Evaluate a metrics window without touching rollout state
    Monitor {
        #[command(subcommand)]
        cmd: MonitorCmd,
    },
    /// Username validation and identity allocation
    Identity {
        #[command(subcommand)]
        cmd: IdentityCmd,
    },
    /// Event journal helpers
    Events {
        #[command(subcommand)]
        cmd: EventsCmd,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[tokio::main]
async fn main() {
    idshift_otel::init("info");
    let cli = Cli::parse();
    let out = Output { json: cli.json };
    if let Err(err) = run(cli).await {
        if out.json {
            let (code, _) = classify(&err);
            println!(
                "{}",
                json!({"ok": false, "error": {"code": code, "message": format!("{err:#}")}})
            );
        }
        eprintln!("error: {err:#}");
        std::process::exit(classify(&err).1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let out = Output { json: cli.json };
    let config = AppContext::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Config { cmd } => commands::config::run(&config, &out, cmd),
        Commands::Monitor { cmd } => commands::monitor::run(&config, &out, cmd),
        Commands::Flag { cmd } => {
            let ctx = AppContext::open(config).await?;
            let res = commands::flag::run(&ctx, &out, cmd).await;
            ctx.flush_journal().await;
            res
        }
        Commands::Rollout { cmd } => {
            let ctx = AppContext::open(config).await?;
            let res = commands::rollout::run(&ctx, &out, cmd).await;
            ctx.flush_journal().await;
            res
        }
        Commands::Identity { cmd } => {
            let ctx = AppContext::open(config).await?;
            let res = commands::identity::run(&ctx, &out, cmd).await;
            ctx.flush_journal().await;
            res
        }
        Commands::Events { cmd } => {
            let ctx = AppContext::open(config).await?;
            commands::events::run(&ctx, &out, cmd).await
        }
    }
}

/// Error code and process exit status. Unclassified failures exit with 1.
fn classify(err: &anyhow::Error) -> (&'static str, i32) {
    match err.downcast_ref::<MigrationError>() {
        Some(e) => {
            let status = match e {
                MigrationError::Validation { .. } => 2,
                MigrationError::Conflict(_) => 3,
                MigrationError::NotFound(_) => 4,
                MigrationError::InvalidTransition { .. } => 5,
                MigrationError::StorageUnavailable(_) => 6,
                MigrationError::Upstream { .. } | MigrationError::Rejected { .. } => 7,
                MigrationError::Config(_) => 8,
            };
            (e.code(), status)
        }
        None => ("internal", 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn migration_errors_keep_their_exit_status_through_context() {
        let err = anyhow::Error::new(MigrationError::Conflict("x".into())).context("identity create");
        assert_eq!(classify(&err), ("conflict", 3));
        assert_eq!(classify(&anyhow::anyhow!("boom")), ("internal", 1));
    }
}
