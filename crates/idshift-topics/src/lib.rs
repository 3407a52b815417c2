//! Canonical event topic constants shared across the migration crates.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Feature flags
pub const TOPIC_FLAGS_BOOTSTRAPPED: &str = "flags.bootstrapped";
pub const TOPIC_FLAGS_UPDATED: &str = "flags.updated";

// Identity allocation
pub const TOPIC_IDENTITY_CREATED: &str = "identity.created";
pub const TOPIC_IDENTITY_REJECTED: &str = "identity.rejected";
pub const TOPIC_IDENTITY_VERIFIED: &str = "identity.verified";

// Monitoring
pub const TOPIC_MONITOR_BREACH: &str = "monitor.breach";
pub const TOPIC_MONITOR_EVALUATED: &str = "monitor.evaluated";

// Rollout
pub const TOPIC_ROLLOUT_PROMOTED: &str = "rollout.promoted";
pub const TOPIC_ROLLOUT_RESTARTED: &str = "rollout.restarted";
pub const TOPIC_ROLLOUT_ROLLED_BACK: &str = "rollout.rolled_back";
pub const TOPIC_ROLLOUT_STAGE_CHANGED: &str = "rollout.stage.changed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_dot_case() {
        for topic in [
            TOPIC_FLAGS_BOOTSTRAPPED,
            TOPIC_FLAGS_UPDATED,
            TOPIC_IDENTITY_CREATED,
            TOPIC_IDENTITY_REJECTED,
            TOPIC_IDENTITY_VERIFIED,
            TOPIC_MONITOR_BREACH,
            TOPIC_MONITOR_EVALUATED,
            TOPIC_ROLLOUT_PROMOTED,
            TOPIC_ROLLOUT_RESTARTED,
            TOPIC_ROLLOUT_ROLLED_BACK,
            TOPIC_ROLLOUT_STAGE_CHANGED,
        ] {
            assert!(topic.contains('.'), "{topic} should be dot.case");
            assert_eq!(topic, topic.to_ascii_lowercase());
        }
    }
}
