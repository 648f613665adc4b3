//! Beat configuration loading
//!
//! Settings come from an optional YAML file, overridden by `HWBEAT__`
//! environment variables (`HWBEAT__OUTPUT__TYPE=console`,
//! `HWBEAT__PIPELINE__BATCH_SIZE=100`, ...).

use anyhow::{Context, Result};
use beat_lib::BeatConfig;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "hwbeat.yml";

const ENV_PREFIX: &str = "HWBEAT";
const ENV_SEPARATOR: &str = "__";

/// Config file named on the command line, or the default
pub fn config_path<I>(args: I) -> PathBuf
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .find(|arg| !arg.starts_with('-'))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from the file (if present) and the environment
pub fn load(path: &Path) -> Result<BeatConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

    settings
        .try_deserialize()
        .context("Failed to parse configuration")
}
