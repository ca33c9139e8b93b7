use std::path::PathBuf;

use serde::Deserialize;

use super::defaults;
use crate::brain::canon::CanonPolicy;

/// Parsed robot configuration. Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the master secret used to derive user hashes.
    pub secret: Option<PathBuf>,
    pub brain: BrainConfig,
    pub speak: SpeakConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Kv,
    Sql,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub backend: BackendKind,
    /// Store location: a directory for `kv`, a database file for `sql`.
    pub path: Option<PathBuf>,
    pub order: usize,
    pub canon: CanonPolicy,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: None,
            order: defaults::ORDER,
            canon: CanonPolicy::default(),
        }
    }
}

impl BrainConfig {
    pub fn store_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => match self.backend {
                BackendKind::Kv => PathBuf::from(defaults::KV_PATH),
                BackendKind::Sql => PathBuf::from(defaults::SQL_PATH),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SpeakConfig {
    pub max_steps: usize,
    pub max_chars: usize,
}

impl Default for SpeakConfig {
    fn default() -> Self {
        Self {
            max_steps: defaults::MAX_STEPS,
            max_chars: defaults::MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}
