//! Optional TOML configuration file.
//!
//! Every field is optional; present fields override [`Config`] defaults and are
//! themselves overridden by environment variables and command-line flags.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}

/// On-disk representation of [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub api_base: Option<String>,
    pub api_token: Option<String>,
    pub organization_id: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub history_poll_interval_secs: Option<u64>,
    pub history_limit: Option<usize>,
    pub storage_prefix: Option<String>,
    pub transformation_level: Option<String>,
    pub preserve_structure: Option<bool>,
    pub request_timeout_secs: Option<u64>,
    /// Path of the SQLite resumability store.
    pub store_path: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay the fields present in this file onto `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(v) = &self.api_base {
            config.api_base = v.clone();
        }
        if let Some(v) = &self.api_token {
            config.api_token = Some(v.clone());
        }
        if let Some(v) = &self.organization_id {
            config.organization_id = v.clone();
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.history_poll_interval_secs {
            config.history_poll_interval_secs = v;
        }
        if let Some(v) = self.history_limit {
            config.history_limit = v;
        }
        if let Some(v) = &self.storage_prefix {
            config.storage_prefix = v.clone();
        }
        if let Some(v) = &self.transformation_level {
            config.transformation_level = v.clone();
        }
        if let Some(v) = self.preserve_structure {
            config.preserve_structure = v;
        }
        if let Some(v) = self.request_timeout_secs {
            config.request_timeout_secs = v;
        }
    }
}
