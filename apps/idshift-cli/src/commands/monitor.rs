use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use idshift_core::{Config, HealthVerdict, MetricsWindow, MonitorEvaluator};

use super::Output;

#[derive(Subcommand)]
pub enum MonitorCmd {
    /// Evaluate a metrics window against the configured thresholds
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Metrics window JSON: {"conflictBaseline": .., "samples": [..]}
    #[arg(long)]
    pub metrics: PathBuf,
}

pub fn run(config: &Config, out: &Output, cmd: MonitorCmd) -> Result<()> {
    match cmd {
        MonitorCmd::Evaluate(args) => {
            let window = read_window(&args.metrics)?;
            let verdict = MonitorEvaluator::new(config.monitor.clone()).evaluate(&window);
            out.emit(&verdict, || verdict_summary(&verdict));
        }
    }
    Ok(())
}

pub fn read_window(path: &Path) -> Result<MetricsWindow> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading metrics {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing metrics {}", path.display()))
}

pub fn verdict_summary(verdict: &HealthVerdict) -> String {
    let coverage = format!(
        "{} samples, {}s continuous coverage",
        verdict.samples, verdict.coverage_secs
    );
    match verdict.breach() {
        None => format!("healthy ({coverage})"),
        Some(breach) => format!("{} ({coverage})", breach.summary()),
    }
}
