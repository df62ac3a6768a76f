//! Provider configuration.
//!
//! The configuration is received as a JSON object from the provider
//! `configure` call. Missing attributes fall back to defaults, and a few
//! environment variables may override them:
//!
//! - `EXOSCALE_API_ENVIRONMENT`: API environment (default `api`)
//! - `EXOSCALE_TIMEOUT`: timeout of each resource operation, in seconds (default 300)

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RulesError};

/// Default API environment.
pub const DEFAULT_ENVIRONMENT: &str = "api";

/// Default zone for security group operations.
pub const DEFAULT_ZONE: &str = "ch-gva-2";

/// Default timeout of a resource operation, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Environment variable overriding [`ProviderConfig::environment`].
pub const ENV_ENVIRONMENT: &str = "EXOSCALE_API_ENVIRONMENT";

/// Environment variable overriding [`ProviderConfig::timeout`].
pub const ENV_TIMEOUT: &str = "EXOSCALE_TIMEOUT";

/// The API environment and zone a backend request is addressed to.
///
/// Every [`SecurityGroupBackend`](crate::SecurityGroupBackend) call carries
/// one; security groups in another zone are invisible to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// API environment, e.g. `api`.
    pub environment: String,
    /// Zone, e.g. `ch-gva-2`.
    pub zone: String,
}

impl Endpoint {
    /// Endpoint for `zone` in `environment`.
    pub fn new(environment: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            zone: zone.into(),
        }
    }

    /// Base URL of the zone's API.
    pub fn url(&self) -> String {
        format!("https://{}-{}.exoscale.com/v2", self.environment, self.zone)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ENVIRONMENT, DEFAULT_ZONE)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.environment, self.zone)
    }
}

/// Settings shared by every resource operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API environment the backing service lives in.
    pub environment: String,
    /// Zone security groups are managed in.
    pub zone: String,
    /// Timeout of each create/read/update/delete operation, in seconds.
    pub timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            zone: DEFAULT_ZONE.to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ProviderConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a provider configuration object; `null` yields the defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(environment) = lookup(ENV_ENVIRONMENT).filter(|v| !v.is_empty()) {
            self.environment = environment;
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT).filter(|v| !v.is_empty()) {
            self.timeout = timeout.trim().parse().map_err(|_| {
                RulesError::Configuration(format!(
                    "{} must be a number of seconds, got {:?}",
                    ENV_TIMEOUT, timeout
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the API environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// Set the operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs();
        self
    }

    /// Where backend requests are sent.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.environment, &self.zone)
    }

    /// The operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.environment.is_empty() {
            return Err(RulesError::Configuration(
                "environment must not be empty".to_string(),
            ));
        }
        if self.zone.is_empty() {
            return Err(RulesError::Configuration("zone must not be empty".to_string()));
        }
        if self.timeout == 0 {
            return Err(RulesError::Configuration(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::new();
        assert_eq!(config.environment, "api");
        assert_eq!(config.zone, "ch-gva-2");
        assert_eq!(config.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_from_value() {
        let config =
            ProviderConfig::from_value(json!({"zone": "de-fra-1", "timeout": 60})).unwrap();
        assert_eq!(config.zone, "de-fra-1");
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.environment, DEFAULT_ENVIRONMENT);

        assert_eq!(
            ProviderConfig::from_value(serde_json::Value::Null).unwrap(),
            ProviderConfig::default()
        );
    }

    #[test]
    fn test_from_value_rejects_invalid() {
        assert!(matches!(
            ProviderConfig::from_value(json!({"timeout": 0})),
            Err(RulesError::Configuration(_))
        ));
        assert!(matches!(
            ProviderConfig::from_value(json!({"timeout": "soon"})),
            Err(RulesError::Serialization(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = ProviderConfig::new()
            .with_overrides(|key| match key {
                ENV_ENVIRONMENT => Some("ppapi".to_string()),
                ENV_TIMEOUT => Some("30".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.environment, "ppapi");
        assert_eq!(config.timeout, 30);

        let err = ProviderConfig::new()
            .with_overrides(|key| (key == ENV_TIMEOUT).then(|| "later".to_string()))
            .unwrap_err();
        assert!(matches!(err, RulesError::Configuration(_)));
    }

    #[test]
    fn test_builders() {
        let config = ProviderConfig::new()
            .with_zone("at-vie-1")
            .with_environment("ppapi")
            .with_timeout(Duration::from_secs(10));
        assert_eq!(config.zone, "at-vie-1");
        assert_eq!(config.environment, "ppapi");
        assert_eq!(config.timeout, 10);
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(ProviderConfig::new().endpoint(), Endpoint::default());

        let endpoint = ProviderConfig::new()
            .with_zone("de-fra-1")
            .with_environment("ppapi")
            .endpoint();
        assert_eq!(endpoint, Endpoint::new("ppapi", "de-fra-1"));
        assert_eq!(endpoint.url(), "https://ppapi-de-fra-1.exoscale.com/v2");
        assert_eq!(endpoint.to_string(), "ppapi-de-fra-1");
    }
}
