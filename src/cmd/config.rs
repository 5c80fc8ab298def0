//! Configuration view and validation commands: `stagehand config`.

use std::path::Path;

use anyhow::{Context, Result};
use stagehand::config::StagehandToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stagehand Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stagehand.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let (config, warnings) = super::load_effective(config_path)?;
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("projects_root = {}", config.projects_root().display());
            for warning in warnings {
                println!("warning: {}", warning);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stagehand.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = StagehandToml::load(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stagehand.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            StagehandToml::default().save(config_path)?;

            println!("Created stagehand.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [stream] heartbeat and subscriber limits");
            println!("  - [preview] dev server command, port range, projects_root");
            println!("  - [logging] level, format, dir");
            println!();
        }
    }

    Ok(())
}
