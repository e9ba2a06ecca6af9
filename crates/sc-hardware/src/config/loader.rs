//! Configuration loading for sample changers.
//!
//! Configuration is layered with Figment:
//! 1. the TOML file
//! 2. environment variables prefixed with `SC_`, `__` separating nested keys
//!    (`SC_TIMING__ACTION_TIMEOUT=5m`)
//!
//! # Usage
//!
//! ```rust,ignore
//! use sc_hardware::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config/isara2.toml"))?;
//! println!("Loaded changer: {}", config.name);
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use tracing::{debug, info};

use super::schema::ChangerConfig;

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "SC_";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong types)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Semantic validation error
    #[error("Config validation failed:\n{0}")]
    ValidationError(String),
}

impl From<ConfigLoadError> for sc_core::ScError {
    fn from(err: ConfigLoadError) -> Self {
        sc_core::ScError::Configuration(err.to_string())
    }
}

fn validated(config: ChangerConfig) -> Result<ChangerConfig, ConfigLoadError> {
    config
        .validate()
        .map_err(|errors| ConfigLoadError::ValidationError(errors.join("\n")))?;
    info!(
        changer = %config.name,
        driver = %config.driver,
        holders = config.geometry.holder_count(),
        "Loaded sample changer config"
    );
    Ok(config)
}

/// Load a changer configuration from a TOML file plus `SC_` environment
/// overrides, then validate it.
pub fn load_config(path: &Path) -> Result<ChangerConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    debug!("Loading sample changer config from: {}", path.display());

    let config: ChangerConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;

    validated(config)
}

/// Load a changer configuration from a TOML string (no environment layer).
///
/// Useful for tests and embedded configurations.
pub fn load_config_from_str(toml_content: &str) -> Result<ChangerConfig, ConfigLoadError> {
    let config: ChangerConfig =
        toml::from_str(toml_content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
    validated(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{DriverKind, ExchangeStrategy, PresenceSource};
    use std::io::Write;
    use std::time::Duration;

    const MARVIN: &str = r#"
        name = "MARVIN"
        driver = "marvin"

        [geometry]
        type = "pucks"
        baskets = 17
        basket_type = "spine"

        [timing]
        action_timeout = "90s"
    "#;

    #[test]
    fn test_load_from_str() {
        let config = load_config_from_str(MARVIN).unwrap();
        assert_eq!(config.driver, DriverKind::Marvin);
        assert_eq!(config.timing.action_timeout, Duration::from_secs(90));
        assert_eq!(config.exchange_strategy(), ExchangeStrategy::UnloadThenLoad);
        assert_eq!(
            config.presence_source(),
            PresenceSource::Bitmask {
                mounted_puck_override: true
            }
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = load_config_from_str(
            r#"
            name = "broken"
            [geometry]
            type = "pucks"
            baskets = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::ValidationError(_)));

        let err = load_config_from_str("name = 3").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MARVIN.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.name, "MARVIN");
        assert_eq!(config.geometry.holder_count(), 17);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/changer.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }
}
