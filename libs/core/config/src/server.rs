use crate::{env_or_default, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Default port for the worker's admin (health/metrics) server
pub const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Admin server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for ServerConfig {
    /// Reads from environment variables with sensible defaults:
    /// - HEALTH_HOST: defaults to 0.0.0.0 (all interfaces)
    /// - HEALTH_PORT: defaults to 8082
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_or_default("HEALTH_PORT", &DEFAULT_HEALTH_PORT.to_string())
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "HEALTH_PORT".to_string(),
                details: format!("{}", e),
            })?;

        Ok(Self { host, port })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: DEFAULT_HEALTH_PORT,
        }
    }
}
