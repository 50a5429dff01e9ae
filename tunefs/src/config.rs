use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunefs/tunefs.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuneConfig {
    // Name of the cluster stack running on this node
    pub cluster_stack: String,
    // Directory shared by every node, holding the per-volume lock files
    pub lock_dir: PathBuf,
    // Environment variable handing the lock state to child processes
    pub lock_env: String,
    pub interactive: bool,
}

impl Default for TuneConfig {
    fn default() -> Self {
        TuneConfig {
            cluster_stack: libtunefs::ondisk::DEFAULT_CLUSTER_STACK.to_string(),
            lock_dir: PathBuf::from("/var/lib/tunefs/locks"),
            lock_env: libtunefs::access::DEFAULT_LOCK_ENV.to_string(),
            interactive: false,
        }
    }
}

/// Load `path`, or the default file if none was named. Only a missing
/// default file falls back to built-in values.
pub fn load_config(path: Option<&Path>) -> Result<TuneConfig> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if !explicit && e.kind() == io::ErrorKind::NotFound => {
            return Ok(TuneConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config from {}", path.display()));
        }
    };
    if content.trim().is_empty() {
        return Ok(TuneConfig::default());
    }
    let cfg: TuneConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config {}", path.display()))?;
    Ok(cfg)
}
