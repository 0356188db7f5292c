//! # svol-config
//!
//! Mount configuration for shortvol.
//!
//! One YAML file describes one volume: which driver backs it, how deep the
//! node tree is, and the root identifier from the previous mount. The file
//! is read once at startup and written back at clean unmount with the new
//! root identifier, which is the only state that survives across mounts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for one mounted volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the shortener driver backing the volume.
    pub driver: String,
    /// Root identifier from the previous mount; empty means fresh volume.
    pub root_id: String,
    /// Number of tree levels between the root and the leaves.
    pub depth: u32,
    /// Driver-specific options, decoded by the selected driver.
    pub driver_opts: serde_yaml::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: "tinyurl".to_string(),
            root_id: String::new(),
            depth: 3,
            driver_opts: serde_yaml::Value::Null,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "using config file");
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "saving config file");
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.driver.is_empty() {
            return Err(ConfigError::Invalid("driver must be set".to_string()));
        }
        if self.depth == 0 {
            return Err(ConfigError::Invalid("depth must be positive".to_string()));
        }
        Ok(())
    }

    /// A commented starter config.
    pub fn template() -> String {
        r#"# shortvol volume configuration
#
# driver: which URL shortener backs the volume (tinyurl, bitly, memory)
# root_id: filled in automatically at unmount; leave empty for a new volume
# depth: tree levels between root and leaves; fixes the volume capacity
# driver_opts: driver-specific settings, e.g. timeout_secs for the
#              network drivers or node_size/id_size for the memory driver
driver: tinyurl
root_id: ""
depth: 3
driver_opts: {}
"#
        .to_string()
    }
}
