use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use idshift_core::{RolloutState, RolloutStatus, StageConfirmation};

use super::monitor::{read_window, verdict_summary};
use super::{yes_no, Output};
use crate::context::AppContext;

#[derive(Subcommand)]
pub enum RolloutCmd {
    /// Current stage, cycle and whether promotion would be accepted
    Status,
    /// Confirm the step matching the current stage
    Advance(AdvanceArgs),
    /// Roll back from Monitoring, restoring the prior flag value
    Rollback(RollbackArgs),
    /// Start a new cycle after a rollback
    Restart(ActorArgs),
    /// Feed a metrics window; a sustained breach rolls back automatically
    Observe(ObserveArgs),
}

#[derive(Args)]
pub struct ActorArgs {
    /// Operator recorded on the transition
    #[arg(long, default_value = "operator")]
    pub by: String,
}

#[derive(Args)]
pub struct AdvanceArgs {
    /// checks-passed | canary-enabled | promote
    pub confirmation: StageConfirmation,
    #[command(flatten)]
    pub actor: ActorArgs,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Why the rollout is being rolled back
    #[arg(long)]
    pub reason: String,
    #[command(flatten)]
    pub actor: ActorArgs,
}

#[derive(Args)]
pub struct ObserveArgs {
    /// Metrics window JSON: {"conflictBaseline": .., "samples": [..]}
    #[arg(long)]
    pub metrics: PathBuf,
}

pub async fn run(ctx: &AppContext, out: &Output, cmd: RolloutCmd) -> Result<()> {
    let ctl = ctx.controller().await?;
    match cmd {
        RolloutCmd::Status => {
            let status = ctl.status().await.context("reading rollout status")?;
            out.emit(&status, || render_status(&status));
        }
        RolloutCmd::Advance(args) => {
            let state = ctl
                .advance(args.confirmation, &args.actor.by)
                .await
                .with_context(|| format!("rollout advance {}", args.confirmation))?;
            out.emit(&state, || render_transition(&state));
        }
        RolloutCmd::Rollback(args) => {
            let state = ctl
                .rollback(&args.reason, &args.actor.by)
                .await
                .context("rollout rollback")?;
            out.emit(&state, || render_transition(&state));
        }
        RolloutCmd::Restart(args) => {
            let state = ctl.restart(&args.by).await.context("rollout restart")?;
            out.emit(&state, || render_transition(&state));
        }
        RolloutCmd::Observe(args) => {
            let window = read_window(&args.metrics)?;
            let observation = ctl.observe(&window).await.context("rollout observe")?;
            out.emit(&observation, || {
                let mut text = verdict_summary(&observation.verdict);
                if observation.rolled_back {
                    text.push_str("\nrolled back automatically");
                }
                text.push('\n');
                text.push_str(&render_transition(&observation.state));
                text
            });
        }
    }
    Ok(())
}

fn render_transition(state: &RolloutState) -> String {
    format!(
        "stage: {} (cycle {}), canary {}%",
        state.stage.display_label(),
        state.cycle,
        state.canary_percentage
    )
}

fn render_status(status: &RolloutStatus) -> String {
    let s = &status.state;
    let mut lines = vec![
        format!("stage:       {} (cycle {})", s.stage.display_label(), s.cycle),
        format!("canary:      {}%", s.canary_percentage),
        format!("entered at:  {} by {}", s.entered_at.to_rfc3339(), s.updated_by),
    ];
    if let Some(deadline) = s.monitoring_deadline {
        lines.push(format!(
            "budget ends: {}{}",
            deadline.to_rfc3339(),
            if status.budget_exhausted { " (exhausted)" } else { "" }
        ));
    }
    if let Some(verdict) = &s.last_metrics {
        lines.push(format!("last verdict: {}", verdict_summary(verdict)));
    }
    if let Some(reason) = &s.last_reason {
        lines.push(format!("last reason: {reason}"));
    }
    let mut promotable = yes_no(status.promotable).to_string();
    if let Some(blocker) = &status.blocked_by {
        promotable.push_str(&format!(" ({blocker})"));
    }
    lines.push(format!("promotable:  {promotable}"));
    lines.join("\n")
}
