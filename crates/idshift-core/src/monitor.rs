//! Health verdicts over canary telemetry.
//!
//! A metric counts as breached only when every sample inside its window
//! violates the threshold, the window holds at least `min_samples` points, and
//! the points cover the window without holes larger than `max_gap_secs`. A
//! single spike therefore never flips the verdict.

use chrono::{DateTime, Duration, Utc};

use crate::config::MonitorConfig;
use crate::model::{BreachReason, HealthVerdict, MetricSample, MetricsWindow};

#[derive(Clone, Debug)]
pub struct MonitorEvaluator {
    cfg: MonitorConfig,
}

impl Default for MonitorEvaluator {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl MonitorEvaluator {
    pub fn new(cfg: MonitorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    pub fn evaluate(&self, window: &MetricsWindow) -> HealthVerdict {
        let mut samples: Vec<&MetricSample> = window.samples.iter().collect();
        samples.sort_by_key(|s| s.at);

        let Some(last) = samples.last() else {
            return HealthVerdict {
                healthy: true,
                reasons: Vec::new(),
                evaluated_at: Utc::now(),
                samples: 0,
                coverage_secs: 0,
            };
        };
        let end = last.at;

        let mut reasons = Vec::new();
        let cfg = &self.cfg;
        if self.sustained(&samples, end, cfg.error_rate_window_secs, |s| {
            exceeds(s.error_rate, cfg.error_rate_max)
        }) {
            reasons.push(BreachReason::ErrorRate);
        }
        if self.sustained(&samples, end, cfg.latency_window_secs, |s| {
            exceeds(s.p95_latency_ms, cfg.p95_latency_ms_max)
        }) {
            reasons.push(BreachReason::P95Latency);
        }
        let conflict_limit = window.conflict_baseline.max(0.0) * cfg.conflict_multiplier;
        if self.sustained(&samples, end, cfg.conflict_window_secs, |s| {
            exceeds(s.conflict_rate, conflict_limit)
        }) {
            reasons.push(BreachReason::ConflictRate);
        }

        HealthVerdict {
            healthy: reasons.is_empty(),
            reasons,
            evaluated_at: end,
            samples: samples.len(),
            coverage_secs: self.continuous_coverage(&samples).num_seconds(),
        }
    }

    fn sustained<F>(
        &self,
        samples: &[&MetricSample],
        end: DateTime<Utc>,
        window_secs: u64,
        breached: F,
    ) -> bool
    where
        F: Fn(&MetricSample) -> bool,
    {
        let start = end - secs(window_secs);
        let in_window: Vec<&MetricSample> =
            samples.iter().copied().filter(|s| s.at >= start).collect();
        if in_window.len() < self.cfg.min_samples {
            return false;
        }
        let max_gap = secs(self.cfg.max_gap_secs);
        if in_window[0].at - start > max_gap {
            return false;
        }
        if in_window.windows(2).any(|pair| pair[1].at - pair[0].at > max_gap) {
            return false;
        }
        in_window.iter().all(|s| breached(*s))
    }

    /// Span of the trailing run of samples with no hole above `max_gap_secs`.
    fn continuous_coverage(&self, samples: &[&MetricSample]) -> Duration {
        let max_gap = secs(self.cfg.max_gap_secs);
        let Some(last) = samples.last() else {
            return Duration::zero();
        };
        let mut earliest = last.at;
        for pair in samples.windows(2).rev() {
            if pair[1].at - pair[0].at > max_gap {
                break;
            }
            earliest = pair[0].at;
        }
        last.at - earliest
    }
}

/// Non-finite readings count as breaching so they never pass for healthy coverage.
fn exceeds(value: f64, limit: f64) -> bool {
    !value.is_finite() || value > limit
}

const MAX_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(MAX_WINDOW_SECS).min(MAX_WINDOW_SECS))
}
