use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use toml::{Table, Value};

use super::defaults;
use super::paths::AppPaths;
use super::types::Config;
use super::validation::validate_config;
use crate::core::errors::BrainError;

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("ROBOT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        self.paths.user_data_dir.join(defaults::CONFIG_FILE)
    }

    /// Loads the config at `explicit`, or at the discovered location. A
    /// missing file is an error only when the path was given explicitly.
    pub fn load_config(&self, explicit: Option<&Path>) -> Result<Config, BrainError> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config_path());
        let mut config = if path.exists() || explicit.is_some() {
            let contents = fs::read_to_string(&path).map_err(|err| {
                BrainError::Config(format!("couldn't read {}: {}", path.display(), err))
            })?;
            parse_config(&contents, |name| env::var(name).ok())?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };
        self.resolve_paths(&mut config);
        Ok(config)
    }

    fn resolve_paths(&self, config: &mut Config) {
        config.brain.path = Some(self.paths.resolve(&config.brain.store_path()));
        config.log.dir = config.log.dir.as_deref().map(|dir| self.paths.resolve(dir));
        config.secret = config.secret.as_deref().map(|secret| self.paths.resolve(secret));
    }
}

/// Parses TOML config text, expanding `$VAR` and `${VAR}` in string values
/// through `lookup` before validation.
pub fn parse_config<F>(contents: &str, lookup: F) -> Result<Config, BrainError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut table: Table = toml::from_str(contents).map_err(BrainError::config)?;
    expand_table(&mut table, &lookup);
    validate_config(&table)?;
    let mut config: Config = Value::Table(table).try_into().map_err(BrainError::config)?;
    // A secret whose variables were all unset is not configured.
    if config.secret.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
        config.secret = None;
    }
    Ok(config)
}

fn expand_table<F>(table: &mut Table, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    for (_, value) in table.iter_mut() {
        expand_value(value, lookup);
    }
}

fn expand_value<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(text) => *text = expand_env(text, lookup),
        Value::Table(table) => expand_table(table, lookup),
        Value::Array(items) => {
            for item in items {
                expand_value(item, lookup);
            }
        }
        _ => {}
    }
}

/// Unset variables expand to the empty string.
pub fn expand_env<F>(text: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("env var pattern is valid")
    });
    re.replace_all(text, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        lookup(name).unwrap_or_default()
    })
    .into_owned()
}
