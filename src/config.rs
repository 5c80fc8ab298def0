//! Configuration for the stagehand server, read from `stagehand.toml`.
//!
//! Values are layered file → environment → CLI flags. Every key is optional;
//! a missing file means all defaults.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! dev_mode = false
//!
//! [stream]
//! heartbeat_interval_secs = 30
//! max_subscribers = 100
//! socket_path_prefix = "/api/chat"
//!
//! [preview]
//! port_range_start = 3100
//! port_range_end = 3999
//! command = "npm"
//! args = ["run", "dev", "--", "--port", "{port}"]
//! projects_root = "/srv/stagehand/projects"
//!
//! [preview.env]
//! BROWSER = "none"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hub::{HubConfig, SocketSettings};
use crate::logging::{LogFormat, LogSettings};
use crate::preview::PreviewSettings;
use crate::preview::process::PORT_PLACEHOLDER;

pub const CONFIG_FILE_NAME: &str = "stagehand.toml";

pub const ENV_HOST: &str = "STAGEHAND_HOST";
pub const ENV_PORT: &str = "STAGEHAND_PORT";
pub const ENV_PROJECTS_ROOT: &str = "STAGEHAND_PROJECTS_ROOT";
pub const ENV_LOG_LEVEL: &str = "STAGEHAND_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Enables permissive CORS for local frontends.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub heartbeat_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_subscribers: usize,
    pub subscriber_buffer: usize,
    pub socket_path_prefix: String,
    pub handshake_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        let hub = HubConfig::default();
        let socket = SocketSettings::default();
        Self {
            heartbeat_interval_secs: hub.heartbeat_interval.as_secs(),
            cleanup_interval_secs: hub.cleanup_interval.as_secs(),
            idle_timeout_secs: hub.idle_timeout.as_secs(),
            max_subscribers: hub.max_subscribers,
            subscriber_buffer: hub.subscriber_buffer,
            socket_path_prefix: socket.path_prefix,
            handshake_timeout_secs: socket.handshake_timeout.as_secs(),
            ping_interval_secs: socket.ping_interval.as_secs(),
            pong_timeout_secs: socket.pong_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSection {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_probe_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub log_capacity: usize,
    pub log_excerpt_lines: usize,
    pub public_host: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub install_command: String,
    pub install_args: Vec<String>,
    pub install_timeout_secs: u64,
    /// Defaults to `~/.stagehand/projects`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_root: Option<PathBuf>,
}

impl Default for PreviewSection {
    fn default() -> Self {
        let preview = PreviewSettings::default();
        Self {
            port_range_start: *preview.port_range.start(),
            port_range_end: *preview.port_range.end(),
            port_probe_timeout_ms: preview.probe_timeout.as_millis() as u64,
            poll_interval_secs: preview.poll_interval.as_secs(),
            startup_timeout_secs: preview.startup_timeout.as_secs(),
            stop_grace_secs: preview.stop_grace.as_secs(),
            log_capacity: preview.log_capacity,
            log_excerpt_lines: preview.log_excerpt_lines,
            public_host: preview.public_host,
            command: preview.command,
            args: preview.args,
            env: preview.env.into_iter().collect(),
            install_command: preview.install_command,
            install_args: preview.install_args,
            install_timeout_secs: preview.install_timeout.as_secs(),
            projects_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        let defaults = LogSettings::default();
        Self {
            level: defaults.level,
            format: defaults.format,
            dir: defaults.dir,
        }
    }
}

/// The complete stagehand.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagehandToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub preview: PreviewSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StagehandToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STAGEHAND_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Returns warnings for values that could
    /// not be used; those keys keep their previous value.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(host) = lookup(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warnings.push(format!("Ignoring {}='{}': not a port number", ENV_PORT, port)),
            }
        }
        if let Some(root) = lookup(ENV_PROJECTS_ROOT).filter(|v| !v.trim().is_empty()) {
            self.preview.projects_root = Some(PathBuf::from(root.trim()));
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level.trim().to_string();
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let stream = &self.stream;
        for (key, value) in [
            ("stream.heartbeat_interval_secs", stream.heartbeat_interval_secs),
            ("stream.cleanup_interval_secs", stream.cleanup_interval_secs),
            ("stream.idle_timeout_secs", stream.idle_timeout_secs),
            ("stream.handshake_timeout_secs", stream.handshake_timeout_secs),
            ("stream.ping_interval_secs", stream.ping_interval_secs),
            ("stream.pong_timeout_secs", stream.pong_timeout_secs),
            ("preview.poll_interval_secs", self.preview.poll_interval_secs),
            ("preview.startup_timeout_secs", self.preview.startup_timeout_secs),
            ("preview.install_timeout_secs", self.preview.install_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!("{} is 0; it must be at least 1", key));
            }
        }
        if stream.max_subscribers == 0 {
            warnings.push("stream.max_subscribers is 0; every subscriber will be rejected".to_string());
        }
        if stream.subscriber_buffer == 0 {
            warnings.push("stream.subscriber_buffer must be at least 1".to_string());
        }
        if stream.pong_timeout_secs <= stream.ping_interval_secs {
            warnings.push(format!(
                "stream.pong_timeout_secs ({}) should exceed stream.ping_interval_secs ({})",
                stream.pong_timeout_secs, stream.ping_interval_secs
            ));
        }
        if !stream.socket_path_prefix.starts_with('/') {
            warnings.push(format!(
                "stream.socket_path_prefix '{}' must start with '/'",
                stream.socket_path_prefix
            ));
        }

        let preview = &self.preview;
        if preview.port_range_start > preview.port_range_end {
            warnings.push(format!(
                "preview port range {}-{} is empty",
                preview.port_range_start, preview.port_range_end
            ));
        }
        if preview.port_range_start == 0 {
            warnings.push("preview.port_range_start must not be 0".to_string());
        }
        if preview.command.trim().is_empty() {
            warnings.push("preview.command is empty".to_string());
        }
        if !preview.args.iter().any(|arg| arg.contains(PORT_PLACEHOLDER)) {
            warnings.push(format!(
                "preview.args has no {} placeholder; the dev server must read the PORT variable",
                PORT_PLACEHOLDER
            ));
        }
        if preview.log_capacity == 0 {
            warnings.push("preview.log_capacity is 0; dev server output will not be kept".to_string());
        }

        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.logging.level) {
            warnings.push(format!("Invalid logging.level '{}': {}", self.logging.level, e));
        }

        warnings
    }

    pub fn hub_config(&self) -> HubConfig {
        let stream = &self.stream;
        HubConfig {
            heartbeat_interval: Duration::from_secs(stream.heartbeat_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(stream.cleanup_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(stream.idle_timeout_secs),
            max_subscribers: stream.max_subscribers,
            subscriber_buffer: stream.subscriber_buffer.max(1),
        }
    }

    pub fn socket_settings(&self) -> SocketSettings {
        let stream = &self.stream;
        SocketSettings {
            path_prefix: stream.socket_path_prefix.clone(),
            handshake_timeout: Duration::from_secs(stream.handshake_timeout_secs),
            ping_interval: Duration::from_secs(stream.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(stream.pong_timeout_secs),
        }
    }

    pub fn preview_settings(&self) -> PreviewSettings {
        let preview = &self.preview;
        PreviewSettings {
            command: preview.command.clone(),
            args: preview.args.clone(),
            env: preview
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            port_range: preview.port_range_start..=preview.port_range_end,
            probe_timeout: Duration::from_millis(preview.port_probe_timeout_ms),
            poll_interval: Duration::from_secs(preview.poll_interval_secs.max(1)),
            startup_timeout: Duration::from_secs(preview.startup_timeout_secs),
            stop_grace: Duration::from_secs(preview.stop_grace_secs),
            log_capacity: preview.log_capacity,
            log_excerpt_lines: preview.log_excerpt_lines,
            public_host: preview.public_host.clone(),
            install_command: preview.install_command.clone(),
            install_args: preview.install_args.clone(),
            install_timeout: Duration::from_secs(preview.install_timeout_secs),
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            level: self.logging.level.clone(),
            format: self.logging.format,
            dir: self.logging.dir.clone(),
        }
    }

    /// Where project repositories live.
    pub fn projects_root(&self) -> PathBuf {
        self.preview
            .projects_root
            .clone()
            .unwrap_or_else(default_projects_root)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// `~/.stagehand`, or `.stagehand` when there is no home directory.
pub fn stagehand_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".stagehand"))
        .unwrap_or_else(|| PathBuf::from(".stagehand"))
}

/// `./.stagehand/stagehand.toml`, relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(".stagehand").join(CONFIG_FILE_NAME)
}

pub fn default_projects_root() -> PathBuf {
    stagehand_home().join("projects")
}
