use anyhow::Result;
use clap::Subcommand;
use idshift_core::config::config_schema_json;
use idshift_core::Config;

use super::Output;

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Print the idshift.toml JSON schema
    Schema,
    /// Print the effective configuration after defaults and env
    Show,
}

pub fn run(config: &Config, out: &Output, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema => {
            let schema = config_schema_json();
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        ConfigCmd::Show => {
            let effective = serde_json::json!({
                "config": config,
                "stateDir": config.state_dir(),
            });
            let rendered = toml::to_string_pretty(config)?;
            out.emit(&effective, || {
                format!("{rendered}\n# state dir: {}", config.state_dir().display())
            });
        }
    }
    Ok(())
}
