//! Server command: `stagehand serve`.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ServeArgs;

pub async fn cmd_serve(config_path: &Path, args: ServeArgs) -> Result<()> {
    let (mut config, env_warnings) = super::load_effective(config_path)?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(root) = args.projects_root {
        config.preview.projects_root = Some(root);
    }
    if args.dev {
        config.server.dev_mode = true;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    let _guard = stagehand::logging::init(&config.log_settings()).context("Failed to initialize logging")?;

    if config_path.exists() {
        tracing::info!(path = %config_path.display(), "Loaded configuration");
    } else {
        tracing::info!(path = %config_path.display(), "No configuration file; using defaults");
    }
    for warning in env_warnings.iter().chain(config.validate().iter()) {
        tracing::warn!("{}", warning);
    }

    stagehand::server::start_server(config).await
}
