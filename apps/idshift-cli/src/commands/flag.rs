use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use idshift_core::{FlagDefaults, FlagStore, MigrationError, ProcessEnv, ResolutionSource};

use super::{yes_no, Output};
use crate::context::AppContext;

#[derive(Subcommand)]
pub enum FlagCmd {
    /// Print the effective value (env override, then stored record, then false)
    Resolve(FlagNameArgs),
    /// Print the effective value and where it came from
    Explain(FlagNameArgs),
    /// Create the flag record if absent; never modifies an existing one
    Ensure(FlagEnsureArgs),
    /// Set the stored value outside of a rollout
    Set(FlagSetArgs),
    /// Print the stored record
    Show(FlagNameArgs),
}

#[derive(Args)]
pub struct FlagNameArgs {
    /// Flag name; defaults to the governing flag from config
    pub name: Option<String>,
}

#[derive(Args)]
pub struct FlagEnsureArgs {
    /// Flag name; defaults to the governing flag from config
    pub name: Option<String>,
    /// Initial value when the record has to be created
    #[arg(long)]
    pub enabled: bool,
    /// Description stored on creation
    #[arg(long)]
    pub description: Option<String>,
    /// Recorded as lastModifiedBy on creation
    #[arg(long, default_value = "bootstrap")]
    pub by: String,
}

#[derive(Args)]
pub struct FlagSetArgs {
    /// Flag name; defaults to the governing flag from config
    pub name: Option<String>,
    /// Turn the flag on
    #[arg(long, conflicts_with = "disabled", required_unless_present = "disabled")]
    pub enabled: bool,
    /// Turn the flag off
    #[arg(long)]
    pub disabled: bool,
    /// Operator recorded as lastModifiedBy
    #[arg(long)]
    pub by: String,
}

fn flag_name(ctx: &AppContext, name: Option<String>) -> String {
    name.unwrap_or_else(|| ctx.config.flag.name.clone())
}

pub async fn run(ctx: &AppContext, out: &Output, cmd: FlagCmd) -> Result<()> {
    match cmd {
        FlagCmd::Resolve(args) => {
            let name = flag_name(ctx, args.name);
            let value = ctx.resolver().resolve(&name).await;
            out.emit(&serde_json::json!({"flag": name, "value": value}), || {
                format!("{name} = {value}")
            });
        }
        FlagCmd::Explain(args) => {
            let name = flag_name(ctx, args.name);
            let resolution = ctx.resolver().explain(&name).await;
            out.emit(&resolution, || {
                let why = match &resolution.source {
                    ResolutionSource::Override { raw } => format!(
                        "override {}={raw:?}",
                        ProcessEnv::default().key_for(&name)
                    ),
                    ResolutionSource::Stored {
                        last_modified_by,
                        updated_at,
                    } => format!(
                        "stored record, last modified by {last_modified_by} at {}",
                        updated_at.to_rfc3339()
                    ),
                    ResolutionSource::Default => "no record; default".to_string(),
                    ResolutionSource::Unavailable { error } => {
                        format!("store unavailable ({error}); default")
                    }
                };
                format!("{name} = {} ({why})", resolution.value)
            });
        }
        FlagCmd::Ensure(args) => {
            let name = flag_name(ctx, args.name);
            let defaults = FlagDefaults {
                enabled: args.enabled,
                description: args
                    .description
                    .unwrap_or_else(|| ctx.config.flag.description.clone()),
                created_by: args.by,
            };
            let guard = ctx.guard();
            let flag = ctx
                .retry
                .run("flag ensure", || guard.ensure_flag(&name, &defaults))
                .await
                .with_context(|| format!("ensuring flag {name}"))?;
            out.emit(&flag, || {
                format!(
                    "{} = {} (last modified by {})",
                    flag.name, flag.enabled, flag.last_modified_by
                )
            });
        }
        FlagCmd::Set(args) => {
            let name = flag_name(ctx, args.name);
            let enabled = args.enabled && !args.disabled;
            let kernel = &ctx.kernel;
            let by = &args.by;
            let name_ref = &name;
            let flag = ctx
                .retry
                .run("flag set", move || {
                    kernel.set_flag_enabled(name_ref, enabled, by)
                })
                .await
                .with_context(|| format!("setting flag {name}"))?;
            tracing::info!(
                target: "idshift.audit",
                flag = %flag.name,
                enabled = flag.enabled,
                by = %flag.last_modified_by,
                "flag set manually"
            );
            ctx.bus.publish(
                idshift_topics::TOPIC_FLAGS_UPDATED,
                &serde_json::json!({
                    "name": flag.name,
                    "enabled": flag.enabled,
                    "by": flag.last_modified_by,
                }),
            );
            out.emit(&flag, || format!("{} = {}", flag.name, flag.enabled));
        }
        FlagCmd::Show(args) => {
            let name = flag_name(ctx, args.name);
            let flag = ctx
                .kernel
                .get_flag(&name)
                .await?
                .ok_or_else(|| MigrationError::NotFound(format!("flag `{name}`")))?;
            out.emit(&flag, || {
                format!(
                    "name:        {}\nenabled:     {}\ndescription: {}\nmodified by: {}\nupdated at:  {}",
                    flag.name,
                    yes_no(flag.enabled),
                    flag.description,
                    flag.last_modified_by,
                    flag.updated_at.to_rfc3339()
                )
            });
        }
    }
    Ok(())
}
