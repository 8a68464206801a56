//! Token gateway
//!
//! Thin adapter over the external token provider. The provider issues and
//! refreshes credentials; the gateway gives the manager a uniform way to read
//! the current token, trigger a refresh, and follow token changes.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Token provider errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenError {
    #[error("Token provider unavailable: {0}")]
    Unavailable(String),
    #[error("Token refresh rejected: {0}")]
    RefreshRejected(String),
}

/// Authentication state broadcast by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub is_authenticated: bool,
}

impl TokenState {
    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            is_authenticated: true,
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

/// External collaborator that owns credentials
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, refreshed by the provider if it knows it is stale
    async fn valid_token(&self) -> Result<Option<String>, TokenError>;

    /// Force a refresh; `Ok(None)` means this attempt produced no token
    async fn refresh_token(&self) -> Result<Option<String>, TokenError>;

    /// Stream of authentication state changes
    fn token_changes(&self) -> watch::Receiver<TokenState>;
}

/// Adapter the manager uses to talk to the [`TokenProvider`]
#[derive(Clone)]
pub struct TokenGateway {
    provider: Arc<dyn TokenProvider>,
}

impl TokenGateway {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }

    pub async fn current_token(&self) -> Result<Option<String>, TokenError> {
        self.provider.valid_token().await
    }

    pub async fn refresh(&self) -> Result<Option<String>, TokenError> {
        self.provider.refresh_token().await
    }

    /// Run `callback` for every change after subscription
    ///
    /// Changes are handled one at a time: the next change is not observed until
    /// the previous callback future has completed. Must be called from within a
    /// Tokio runtime.
    pub fn subscribe<C, Fut>(&self, mut callback: C) -> TokenSubscription
    where
        C: FnMut(TokenState) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.provider.token_changes();
        rx.borrow_and_update();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                debug!(
                    authenticated = state.is_authenticated,
                    "Token change observed"
                );
                callback(state).await;
            }
            debug!("Token change stream closed");
        });

        TokenSubscription {
            handle: Some(handle),
        }
    }
}

/// Active token-change subscription; cancelled on drop
#[derive(Debug)]
pub struct TokenSubscription {
    handle: Option<JoinHandle<()>>,
}

impl TokenSubscription {
    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TokenSubscription {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Reads the token from an environment variable
///
/// A refresh re-reads the variable and broadcasts the value if it changed.
pub struct EnvTokenProvider {
    var_name: String,
    changes: watch::Sender<TokenState>,
}

impl EnvTokenProvider {
    pub fn new(var_name: impl Into<String>) -> Self {
        let var_name = var_name.into();
        let initial = Self::read(&var_name)
            .map(TokenState::authenticated)
            .unwrap_or_default();
        let (changes, _) = watch::channel(initial);
        Self { var_name, changes }
    }

    fn read(var_name: &str) -> Option<String> {
        std::env::var(var_name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn valid_token(&self) -> Result<Option<String>, TokenError> {
        Ok(Self::read(&self.var_name))
    }

    async fn refresh_token(&self) -> Result<Option<String>, TokenError> {
        let token = Self::read(&self.var_name);
        let state = token
            .clone()
            .map(TokenState::authenticated)
            .unwrap_or_default();
        self.changes.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if token.is_none() {
            warn!(var = %self.var_name, "Token environment variable is empty");
        }
        Ok(token)
    }

    fn token_changes(&self) -> watch::Receiver<TokenState> {
        self.changes.subscribe()
    }
}
