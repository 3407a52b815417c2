use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use idshift_core::{validate_username, Identity, MigrationError};
use serde_json::json;

use super::{yes_no, Output};
use crate::context::AppContext;

#[derive(Subcommand)]
pub enum IdentityCmd {
    /// Check a username against the allowed format; exits non-zero when invalid
    Validate(UsernameArgs),
    /// Advisory availability check through the active pathway
    Check(UsernameArgs),
    /// Claim a username through the pathway selected by the flag
    Create(CreateArgs),
    /// Mark an identity as verified
    Verify(UsernameArgs),
    /// Print a stored identity
    Show(UsernameArgs),
}

#[derive(Args)]
pub struct UsernameArgs {
    pub username: String,
}

#[derive(Args)]
pub struct CreateArgs {
    pub username: String,
    #[arg(long)]
    pub display_name: String,
    /// Owning user id
    #[arg(long)]
    pub owner: String,
}

pub async fn run(ctx: &AppContext, out: &Output, cmd: IdentityCmd) -> Result<()> {
    match cmd {
        IdentityCmd::Validate(args) => {
            if !validate_username(&args.username) {
                return Err(MigrationError::Validation {
                    field: "username",
                    value: args.username,
                    reason: "expected 3-64 of [a-z0-9._-]".to_string(),
                }
                .into());
            }
            out.emit(&json!({"username": args.username, "valid": true}), || {
                format!("{} is valid", args.username)
            });
        }
        IdentityCmd::Check(args) => {
            let allocator = ctx.allocator()?;
            let route = allocator.route().await;
            let available = allocator
                .check(&args.username)
                .await
                .with_context(|| format!("checking {}", args.username))?;
            out.emit(
                &json!({"username": args.username, "available": available, "pathway": route}),
                || {
                    format!(
                        "{}: available {} (via {route})",
                        args.username,
                        yes_no(available)
                    )
                },
            );
        }
        IdentityCmd::Create(args) => {
            let allocator = ctx.allocator()?;
            let identity = allocator
                .create(&args.username, &args.display_name, &args.owner)
                .await
                .context("identity create")?;
            out.emit(&identity, || render(&identity));
        }
        IdentityCmd::Verify(args) => {
            let identity = ctx
                .allocator()?
                .mark_verified(&args.username)
                .await
                .context("identity verify")?;
            out.emit(&identity, || render(&identity));
        }
        IdentityCmd::Show(args) => {
            let identity = ctx
                .allocator()?
                .get(&args.username)
                .await?
                .ok_or_else(|| MigrationError::NotFound(format!("identity `{}`", args.username)))?;
            out.emit(&identity, || render(&identity));
        }
    }
    Ok(())
}

fn render(identity: &Identity) -> String {
    format!(
        "{}@{} ({}) owner {} via {}, verified {}",
        identity.username,
        identity.domain,
        identity.display_name,
        identity.owner_id,
        identity.pathway,
        yes_no(identity.verified)
    )
}
