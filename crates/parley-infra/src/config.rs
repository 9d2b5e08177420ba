//! Configuration loader for Parley.
//!
//! Resolution order for the file: an explicit path (the `--config` flag),
//! then `PARLEY_CONFIG`, then `~/.parley/config.toml`. An explicitly named
//! file must exist and parse; the home-directory file is optional and falls
//! back to defaults when missing or malformed. Environment overrides are
//! applied last, then the result is validated.

use std::path::{Path, PathBuf};

use parley_types::config::ParleyConfig;
use parley_types::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PARLEY_CONFIG";

/// Overrides `database.url`.
pub const DATABASE_URL_ENV: &str = "PARLEY_DATABASE_URL";

/// Overrides `auth.jwt_secret`.
pub const JWT_SECRET_ENV: &str = "PARLEY_JWT_SECRET";

/// `~/.parley/config.toml`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley").join("config.toml"))
}

/// Load, override, and validate the effective configuration.
pub async fn load_config(explicit: Option<&Path>) -> Result<ParleyConfig, ConfigError> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let mut config = match named {
        Some(path) => read_config(&path).await?,
        None => match default_config_path() {
            Some(path) => load_optional(&path).await,
            None => ParleyConfig::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Read and parse a config file that is required to exist.
pub async fn read_config(path: &Path) -> Result<ParleyConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    ParleyConfig::from_toml(&content)
}

/// Read an optional config file.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: logs a warning, then defaults.
pub async fn load_optional(path: &Path) -> ParleyConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return ParleyConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ParleyConfig::default();
        }
    };

    match ParleyConfig::from_toml(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            ParleyConfig::default()
        }
    }
}

/// Apply environment overrides using `lookup` to read variables.
///
/// Empty values are ignored.
pub fn apply_env_overrides(config: &mut ParleyConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty(DATABASE_URL_ENV) {
        config.database.url = Some(url);
    }
    if let Some(secret) = non_empty(JWT_SECRET_ENV) {
        config.auth.jwt_secret = Some(secret);
    }
}
