//! Store configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! root = "/var/lib/myapp/store"
//! create_root = true
//! ```
//!
//! Every field is optional. `TILDEFS_ROOT` in the environment overrides
//! `root` when [`StoreConfig::with_env_overrides`] is applied.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FilestoreError;

/// Environment variable that overrides the configured root.
pub const ROOT_ENV: &str = "TILDEFS_ROOT";

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML for [`StoreConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// `root` is empty.
    #[error("store root is empty")]
    EmptyRoot,

    /// The root could not be turned into a store path or created.
    #[error("invalid store root: {0}")]
    Root(#[from] FilestoreError),
}

/// Where the store lives and how to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Real directory backing the store.
    pub root: PathBuf,
    /// Create `root` (and its parents) on open if it is missing.
    pub create_root: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            create_root: true,
        }
    }
}

impl StoreConfig {
    /// A config rooted at `root`, with defaults for everything else.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// `<data dir>/tildefs`, or `tildefs-data` when the platform has no
    /// data directory.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("tildefs"))
            .unwrap_or_else(|| PathBuf::from("tildefs-data"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `TILDEFS_ROOT` if it is set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                self.root = PathBuf::from(root);
            }
        }
        self
    }

    /// The root as an absolute path. A relative root is taken against the
    /// current directory here, once, so store paths never depend on it.
    pub fn absolute_root(&self) -> Result<PathBuf, ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        std::path::absolute(&self.root).map_err(|source| ConfigError::Read {
            path: self.root.clone(),
            source,
        })
    }
}
