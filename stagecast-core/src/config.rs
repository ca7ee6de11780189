use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sfu: SfuSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bound on each connection's outbound event queue; events for clients
    /// that fall this far behind are dropped.
    pub event_queue_capacity: usize,
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            event_queue_capacity: 1000,
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for verifying bearer tokens minted by the identity
    /// service. Must be overridden outside development.
    pub token_secret: String,
    /// Clock skew tolerated when checking token expiry.
    pub token_leeway_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "stagecast-dev-secret".to_string(),
            token_leeway_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSettings {
    /// Upper bound on any single SFU engine call (router creation, transport
    /// negotiation, produce, consume).
    pub request_timeout_seconds: u64,
}

impl Default for SfuSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
        }
    }
}

impl SfuSettings {
    #[must_use]
    pub const fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `STAGECAST_*`
    /// environment overrides (e.g. `STAGECAST_SERVER__PORT=9000`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(&path.to_string_lossy()));
        } else {
            builder = builder.add_source(File::with_name("stagecast").required(false));
        }

        builder
            .add_source(Environment::with_prefix("STAGECAST").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.event_queue_capacity == 0 {
            errors.push("server.event_queue_capacity must be at least 1".to_string());
        }
        if self.auth.token_secret.is_empty() {
            errors.push("auth.token_secret must not be empty".to_string());
        }
        if self.sfu.request_timeout_seconds == 0 {
            errors.push("sfu.request_timeout_seconds must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_validate_rejects_zero_port_and_empty_secret() {
        let mut config = Config::default();
        config.server.port = 0;
        config.auth.token_secret.clear();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
