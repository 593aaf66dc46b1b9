//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::application::errors::ConfigError;
use crate::application::messaging::{
    LoggingMiddleware, Middleware, MiddlewareChain, RateLimitMiddleware, TimestampMiddleware,
};

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Built-in middleware to install, in the order logging, rate limit, timestamp
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MiddlewareConfig {
    pub logging: bool,
    pub timestamp: bool,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            logging: true,
            timestamp: false,
            rate_limit: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "socket-dispatch".to_string(),
            middleware: MiddlewareConfig {
                logging: true,
                timestamp: true,
                rate_limit: Some(RateLimitConfig {
                    max_requests: 20,
                    window_seconds: 60,
                }),
            },
        }
    }
}

impl RateLimitConfig {
    /// Parse `"<max-requests>/<window-seconds>"`, e.g. `20/60`
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let (max, window) = value
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidValue(format!("expected <max>/<seconds>, got '{}'", value)))?;

        let max_requests = max
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("max requests '{}': {}", max, e)))?;
        let window_seconds = window
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("window seconds '{}': {}", window, e)))?;

        let config = Self {
            max_requests,
            window_seconds,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidValue("rate-limit max-requests must be > 0".to_string()));
        }
        if self.window_seconds == 0 {
            return Err(ConfigError::InvalidValue("rate-limit window-seconds must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read config: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".to_string()));
        }
        if let Some(rate_limit) = &self.middleware.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Defaults overridden by `SOCKET_NAME` and `SOCKET_RATE_LIMIT` (`<max>/<seconds>` or `off`)
    pub fn load_env() -> Self {
        let mut config = Config::default();

        if let Ok(name) = std::env::var("SOCKET_NAME") {
            if !name.trim().is_empty() {
                config.name = name;
            }
        }

        if let Ok(limit) = std::env::var("SOCKET_RATE_LIMIT") {
            if limit.eq_ignore_ascii_case("off") {
                config.middleware.rate_limit = None;
            } else {
                match RateLimitConfig::parse(&limit) {
                    Ok(rate_limit) => config.middleware.rate_limit = Some(rate_limit),
                    Err(e) => tracing::warn!("Ignoring SOCKET_RATE_LIMIT: {}", e),
                }
            }
        }

        config
    }

    /// Ordered middleware list for `Socket::new` / `Socket::update`
    pub fn middleware(&self) -> Vec<Arc<dyn Middleware>> {
        let mut chain = MiddlewareChain::new();
        if self.middleware.logging {
            chain = chain.add(LoggingMiddleware);
        }
        if let Some(limit) = self.middleware.rate_limit {
            chain = chain.add(RateLimitMiddleware::new(limit.max_requests, limit.window_seconds));
        }
        if self.middleware.timestamp {
            chain = chain.add(TimestampMiddleware);
        }
        chain.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
        assert_eq!(config.middleware().len(), 3);
    }

    #[test]
    fn test_partial_yaml_uses_middleware_defaults() {
        let config = Config::from_yaml("name: chat\n").unwrap();
        assert_eq!(config.middleware, MiddlewareConfig::default());
        assert_eq!(config.middleware().len(), 1);
    }

    #[test]
    fn test_rejects_zero_window() {
        let yaml = "name: chat\nmiddleware:\n  rate-limit:\n    max-requests: 5\n    window-seconds: 0\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_rejects_blank_name() {
        assert!(matches!(Config::from_yaml("name: ' '\n"), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_parse_rate_limit() {
        assert_eq!(
            RateLimitConfig::parse("10/30").unwrap(),
            RateLimitConfig {
                max_requests: 10,
                window_seconds: 30
            }
        );
        assert!(RateLimitConfig::parse("10").is_err());
        assert!(RateLimitConfig::parse("x/30").is_err());
        assert!(RateLimitConfig::parse("0/30").is_err());
    }

    #[test]
    fn test_missing_middleware_fields_use_defaults() {
        let config = Config::from_yaml("name: chat\nmiddleware:\n  timestamp: true\n").unwrap();
        assert!(config.middleware.logging);
        assert!(config.middleware.timestamp);
        assert_eq!(config.middleware.rate_limit, None);
    }
}
