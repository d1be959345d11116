//! Shared configuration helpers for the auth gateway services.
//!
//! Configuration comes from an optional file named by the `CONFIG` environment
//! variable, then prefixed environment variables override individual fields.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Environment variable naming the configuration file to load.
pub const CONFIG_PATH_ENV: &str = "CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format for {0}")]
    UnsupportedFormat(PathBuf),
}

/// Implemented by every service configuration struct.
pub trait ServiceConfig: DeserializeOwned + Default {
    /// Prefix for environment overrides, e.g. `AUTH_GATEWAY_`.
    const PREFIX: &'static str;

    /// Apply `PREFIX`-ed environment variables on top of the loaded values.
    fn apply_environment_overrides(&mut self, prefix: &str);
}

/// Load a service configuration from `$CONFIG` (if set) and the environment.
pub fn load<T: ServiceConfig>() -> Result<T, ConfigError> {
    let mut config = match env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => from_path::<T>(Path::new(&path))?,
        _ => {
            tracing::info!("no config file given, using defaults");
            T::default()
        }
    };
    config.apply_environment_overrides(T::PREFIX);
    Ok(config)
}

/// Load a service configuration from `path` and apply environment overrides.
pub fn load_from_path<T: ServiceConfig>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let mut config = from_path::<T>(path.as_ref())?;
    config.apply_environment_overrides(T::PREFIX);
    Ok(config)
}

fn from_path<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    let config = match extension.as_deref() {
        Some("toml") => toml::from_str(&contents)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        Some("json") => serde_json::from_str(&contents)?,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Read `prefix` + `name` from the environment, ignoring empty values.
pub fn env_override(prefix: &str, name: &str) -> Option<String> {
    env::var(format!("{prefix}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

/// Parse `prefix` + `name` from the environment, keeping `current` when the
/// variable is missing or malformed.
pub fn parse_override<T>(prefix: &str, name: &str, current: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_override(prefix, name) {
        Some(value) => value
            .parse::<T>()
            .inspect_err(|error| {
                let var = format!("{prefix}{name}");
                tracing::warn!(%var, %value, %error, "invalid override, keeping configured value");
            })
            .unwrap_or(current),
        None => current,
    }
}
