use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use stagehand::logging::LogFormat;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Live project event streams and preview dev-server supervision")]
pub struct Cli {
    /// Path to stagehand.toml (defaults to ./.stagehand/stagehand.toml)
    #[arg(long, global = true, env = "STAGEHAND_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (control API, push channel, socket transport)
    Serve(ServeArgs),
    /// View, validate or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (0 picks a free one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding `<project>/repo` workspaces
    #[arg(long)]
    pub projects_root: Option<PathBuf>,

    /// Enable permissive CORS for local frontend development
    #[arg(long)]
    pub dev: bool,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (file + environment)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default stagehand.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(stagehand::config::default_config_path);

    match cli.command {
        Commands::Serve(args) => cmd::cmd_serve(&config_path, args).await?,
        Commands::Config { command } => cmd::cmd_config(&config_path, command)?,
    }

    Ok(())
}
