//! Configuration for the realtime connection manager
//!
//! Loaded from a TOML file. Every section has defaults except `[endpoint]`,
//! which must at least name the production URL.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeConfig {
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub token_refresh: TokenRefreshSection,
}

/// Deployment environment used for endpoint selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

/// Client platform, reported to the server and used for local endpoint selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

/// Kind of client presenting the credentials
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Mobile,
    Web,
}

/// Endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSection {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    #[serde(default = "default_platform")]
    pub platform: Platform,
    /// Secure URL used in production
    pub production_url: Option<String>,
    /// Port of the local development server
    #[serde(default = "default_development_port")]
    pub development_port: u16,
    /// Replaces the platform-specific local URL when set
    pub development_url: Option<String>,
}

fn default_environment() -> Environment {
    Environment::Production
}

fn default_platform() -> Platform {
    Platform::Web
}

fn default_development_port() -> u16 {
    3000
}

/// Transport section, handed to the transport as its own reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Allowed transport mechanisms (restricted to exactly one)
    #[serde(default = "default_transports")]
    pub transports: Vec<String>,
    #[serde(default = "default_true")]
    pub reconnection: bool,
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
    #[serde(default = "default_reconnection_delay_max_ms")]
    pub reconnection_delay_max_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            transports: default_transports(),
            reconnection: true,
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            reconnection_delay_max_ms: default_reconnection_delay_max_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_transports() -> Vec<String> {
    vec!["websocket".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_reconnection_attempts() -> u32 {
    5
}

fn default_reconnection_delay_ms() -> u64 {
    1000
}

fn default_reconnection_delay_max_ms() -> u64 {
    5000
}

fn default_timeout_ms() -> u64 {
    20000
}

/// Auth section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    #[serde(default = "default_client_type")]
    pub client_type: ClientType,
    /// Environment variable holding the access token (CLI token provider)
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            client_type: default_client_type(),
            token_env: default_token_env(),
        }
    }
}

fn default_client_type() -> ClientType {
    ClientType::Mobile
}

fn default_token_env() -> String {
    "REALTIME_TOKEN".to_string()
}

/// Token refresh backoff section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRefreshSection {
    #[serde(default = "default_refresh_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_refresh_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_refresh_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_refresh_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for TokenRefreshSection {
    fn default() -> Self {
        Self {
            max_attempts: default_refresh_attempts(),
            base_delay_ms: default_refresh_base_delay_ms(),
            max_jitter_ms: default_refresh_jitter_ms(),
            max_delay_ms: default_refresh_max_delay_ms(),
        }
    }
}

fn default_refresh_attempts() -> u32 {
    3
}

fn default_refresh_base_delay_ms() -> u64 {
    500
}

fn default_refresh_jitter_ms() -> u64 {
    200
}

fn default_refresh_max_delay_ms() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RealtimeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RealtimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.transports.len() != 1 {
            return Err(ConfigError::InvalidConfig(format!(
                "transport.transports must name exactly one mechanism, got {:?}",
                self.transport.transports
            )));
        }

        if self.transport.reconnection_delay_ms > self.transport.reconnection_delay_max_ms {
            return Err(ConfigError::InvalidConfig(
                "transport.reconnection_delay_ms must not exceed reconnection_delay_max_ms"
                    .to_string(),
            ));
        }

        if self.token_refresh.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "token_refresh.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.token_refresh.base_delay_ms > self.token_refresh.max_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "token_refresh.base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }

        if self.endpoint.environment == Environment::Production
            && self.endpoint.production_url.is_none()
        {
            return Err(ConfigError::InvalidConfig(
                "endpoint.production_url is required in production".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[endpoint]
environment = "development"
platform = "android"
production_url = "https://realtime.example.com"
development_port = 4000

[auth]
client_type = "mobile"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
