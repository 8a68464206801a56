//! Endpoint resolution
//!
//! The manager never decides where to connect on its own; it asks an injected
//! [`EndpointResolver`] on every connect so tests can supply a fixed URL.

use crate::config::{EndpointSection, Environment, Platform};
use thiserror::Error;
use url::Url;

/// Android emulators reach the host machine through this alias
const ANDROID_EMULATOR_HOST: &str = "10.0.2.2";
const LOCAL_HOST: &str = "localhost";

/// Endpoint resolution errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EndpointError {
    #[error("No endpoint URL configured for {0}")]
    MissingUrl(String),
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("Production endpoint must be secure (https or wss): {0}")]
    InsecureProductionUrl(String),
}

/// Resolves the realtime server URL
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self) -> Result<String, EndpointError>;
}

/// Picks the secure production URL or a platform-specific local URL
#[derive(Debug, Clone)]
pub struct EnvironmentEndpointResolver {
    environment: Environment,
    platform: Platform,
    production_url: Option<String>,
    development_port: u16,
    development_url: Option<String>,
}

impl EnvironmentEndpointResolver {
    pub fn new(environment: Environment, platform: Platform) -> Self {
        Self {
            environment,
            platform,
            production_url: None,
            development_port: 3000,
            development_url: None,
        }
    }

    pub fn from_config(section: &EndpointSection) -> Self {
        Self {
            environment: section.environment,
            platform: section.platform,
            production_url: section.production_url.clone(),
            development_port: section.development_port,
            development_url: section.development_url.clone(),
        }
    }

    pub fn with_production_url(mut self, url: impl Into<String>) -> Self {
        self.production_url = Some(url.into());
        self
    }

    pub fn with_development_port(mut self, port: u16) -> Self {
        self.development_port = port;
        self
    }

    pub fn with_development_url(mut self, url: impl Into<String>) -> Self {
        self.development_url = Some(url.into());
        self
    }

    /// Local URL for the development server as seen from the given platform
    pub fn local_url(platform: Platform, port: u16) -> String {
        let host = match platform {
            Platform::Android => ANDROID_EMULATOR_HOST,
            Platform::Ios | Platform::Web => LOCAL_HOST,
        };
        format!("http://{host}:{port}")
    }
}

impl EndpointResolver for EnvironmentEndpointResolver {
    fn resolve(&self) -> Result<String, EndpointError> {
        match self.environment {
            Environment::Production => {
                let raw = self
                    .production_url
                    .as_ref()
                    .ok_or_else(|| EndpointError::MissingUrl("production".to_string()))?;
                let url = Url::parse(raw).map_err(|_| EndpointError::InvalidUrl(raw.clone()))?;
                if !matches!(url.scheme(), "https" | "wss") {
                    return Err(EndpointError::InsecureProductionUrl(raw.clone()));
                }
                Ok(raw.clone())
            }
            Environment::Development => {
                let resolved = match &self.development_url {
                    Some(url) => url.clone(),
                    None => Self::local_url(self.platform, self.development_port),
                };
                Url::parse(&resolved).map_err(|_| EndpointError::InvalidUrl(resolved.clone()))?;
                Ok(resolved)
            }
        }
    }
}

/// Always resolves to the same URL
#[derive(Debug, Clone)]
pub struct FixedEndpoint(pub String);

impl FixedEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }
}

impl EndpointResolver for FixedEndpoint {
    fn resolve(&self) -> Result<String, EndpointError> {
        if self.0.is_empty() {
            return Err(EndpointError::MissingUrl("fixed endpoint".to_string()));
        }
        Ok(self.0.clone())
    }
}
