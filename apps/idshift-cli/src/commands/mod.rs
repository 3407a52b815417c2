use serde::Serialize;

pub mod config;
pub mod events;
pub mod flag;
pub mod identity;
pub mod monitor;
pub mod rollout;

pub use config::ConfigCmd;
pub use events::EventsCmd;
pub use flag::FlagCmd;
pub use identity::IdentityCmd;
pub use monitor::MonitorCmd;
pub use rollout::RolloutCmd;

/// Chooses between a JSON document and a human summary on stdout.
#[derive(Clone, Copy, Debug)]
pub struct Output {
    pub json: bool,
}

impl Output {
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("failed to render JSON: {e}"),
            }
        } else {
            println!("{}", human());
        }
    }
}

pub(crate) fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
