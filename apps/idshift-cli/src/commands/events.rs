use anyhow::Result;
use clap::{Args, Subcommand};

use super::Output;
use crate::context::AppContext;

#[derive(Subcommand)]
pub enum EventsCmd {
    /// Print the most recent journaled events, oldest first
    Tail(TailArgs),
}

#[derive(Args)]
pub struct TailArgs {
    /// Number of events to show
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
    /// Only show events whose kind starts with this prefix (e.g. rollout.)
    #[arg(long)]
    pub kind_prefix: Option<String>,
}

pub async fn run(ctx: &AppContext, out: &Output, cmd: EventsCmd) -> Result<()> {
    match cmd {
        EventsCmd::Tail(args) => {
            let rows = ctx
                .kernel
                .recent_events_async(args.limit.max(1), args.kind_prefix)
                .await?;
            out.emit(&rows, || {
                if rows.is_empty() {
                    return "no events".to_string();
                }
                rows.iter()
                    .map(|r| format!("{:>5}  {}  {:<24} {}", r.id, r.time, r.kind, r.payload))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
    }
    Ok(())
}
