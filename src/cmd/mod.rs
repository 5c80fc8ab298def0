//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `config` | `Config`         |

pub mod config;
pub mod serve;

pub use config::cmd_config;
pub use serve::cmd_serve;

use std::path::Path;

use anyhow::Result;
use stagehand::config::StagehandToml;

/// Load the file at `path` (defaults when missing) and apply environment
/// overrides. Returns the config and any override warnings.
pub fn load_effective(path: &Path) -> Result<(StagehandToml, Vec<String>)> {
    let mut config = StagehandToml::load_or_default(path)?;
    let warnings = config.apply_env();
    Ok((config, warnings))
}
