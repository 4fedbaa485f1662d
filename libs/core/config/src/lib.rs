pub mod server;
pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    Invalid { key: String, details: String },
}

/// Application environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local runs, pretty logs
    Production,  // Deployed, JSON logs
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
///
/// Empty values count as unset.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Name and version of the running binary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Build an [`AppInfo`] from the calling crate's Cargo metadata
#[macro_export]
macro_rules! app_info {
    () => {
        $crate::AppInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        for value in ["production", "PRODUCTION", "Production"] {
            temp_env::with_var("APP_ENV", Some(value), || {
                assert_eq!(Environment::from_env(), Environment::Production);
            });
        }
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            assert_eq!(env_or_default("TEST_VAR", "default"), "test_value");
        });
        temp_env::with_var_unset("MISSING_VAR", || {
            assert_eq!(env_or_default("MISSING_VAR", "default_value"), "default_value");
        });
    }

    #[test]
    fn test_env_required_success() {
        temp_env::with_var("REQUIRED_VAR", Some("required_value"), || {
            let result = env_required("REQUIRED_VAR");
            assert_eq!(result.unwrap(), "required_value");
        });
    }

    #[test]
    fn test_env_required_missing_or_blank() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let err = env_required("MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });

        temp_env::with_var("BLANK_REQUIRED", Some("  "), || {
            assert_eq!(
                env_required("BLANK_REQUIRED"),
                Err(ConfigError::MissingEnvVar("BLANK_REQUIRED".to_string()))
            );
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("PARSE_VAR", Some(" 42 "), || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 7), Ok(42));
        });
        temp_env::with_var_unset("PARSE_VAR", || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 7), Ok(7));
        });
        temp_env::with_var("PARSE_VAR", Some("-1"), || {
            let err = env_parse::<u32>("PARSE_VAR", 7).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "PARSE_VAR"));
        });
    }

    #[test]
    fn test_app_info_macro() {
        let info = app_info!();
        assert_eq!(info.name, "core_config");
        assert!(!info.version.is_empty());
    }
}
