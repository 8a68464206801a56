//! Mock implementations for testing
//!
//! Provides a mock transport factory and token provider so the connection
//! manager can be driven end to end without a server.

use crate::token::{TokenError, TokenProvider, TokenState};
use crate::transport::{
    AuthContext, EventSink, Transport, TransportError, TransportEvent, TransportFactory,
    TransportOptions,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

pub type EmittedEvent = (String, Value);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
struct MockBehavior {
    auto_connect: bool,
    open_error: Option<String>,
    create_error: Option<String>,
}

/// Factory that records every transport it creates
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<Vec<MockTransport>>>,
    behavior: Arc<Mutex<MockBehavior>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports fire `Connected` as soon as they are opened
    pub fn with_auto_connect(self) -> Self {
        lock(&self.behavior).auto_connect = true;
        self
    }

    /// `open` fails with the given message
    pub fn with_open_error(self, message: impl Into<String>) -> Self {
        lock(&self.behavior).open_error = Some(message.into());
        self
    }

    /// `create` fails with the given message
    pub fn with_create_error(self, message: impl Into<String>) -> Self {
        lock(&self.behavior).create_error = Some(message.into());
        self
    }

    pub fn created(&self) -> Vec<MockTransport> {
        lock(&self.created).clone()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn last(&self) -> Option<MockTransport> {
        lock(&self.created).last().cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(
        &self,
        endpoint: &str,
        options: TransportOptions,
        sink: EventSink,
    ) -> Result<MockTransport, TransportError> {
        let behavior = lock(&self.behavior).clone();
        if let Some(message) = behavior.create_error {
            return Err(TransportError::InvalidConfig(message));
        }

        let mut created = lock(&self.created);
        let transport = MockTransport {
            state: Arc::new(MockTransportState {
                index: created.len(),
                endpoint: endpoint.to_string(),
                auth: Mutex::new(options.auth.clone()),
                options,
                sink,
                behavior,
                emitted: Mutex::new(Vec::new()),
                auth_swaps: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                reconnection: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                fail_emit: AtomicBool::new(false),
                socket_id: Mutex::new(None),
            }),
        };
        created.push(transport.clone());
        Ok(transport)
    }
}

struct MockTransportState {
    index: usize,
    endpoint: String,
    options: TransportOptions,
    sink: EventSink,
    behavior: MockBehavior,
    emitted: Mutex<Vec<EmittedEvent>>,
    auth: Mutex<AuthContext>,
    auth_swaps: AtomicUsize,
    opens: AtomicUsize,
    reconnection: AtomicBool,
    closed: AtomicBool,
    fail_emit: AtomicBool,
    socket_id: Mutex<Option<String>>,
}

/// Mock transport; clones share state
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockTransportState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("index", &self.state.index)
            .field("endpoint", &self.state.endpoint)
            .field("closed", &self.closed())
            .finish()
    }
}

impl MockTransport {
    /// Deliver an event to the manager as the real transport would
    ///
    /// Events are delivered even after `close`, to simulate late callbacks.
    pub fn fire(&self, event: TransportEvent) {
        if let TransportEvent::Connected { socket_id } = &event {
            *lock(&self.state.socket_id) = socket_id.clone();
        }
        if let TransportEvent::Disconnected { .. } = &event {
            *lock(&self.state.socket_id) = None;
        }
        (self.state.sink)(event);
    }

    pub fn connect_ok(&self, socket_id: &str) {
        self.fire(TransportEvent::Connected {
            socket_id: Some(socket_id.to_string()),
        });
    }

    pub fn drop_connection(&self, reason: &str) {
        self.fire(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn connect_error(&self, message: &str) {
        self.fire(TransportEvent::ConnectError {
            message: message.to_string(),
        });
    }

    pub fn server_event(&self, event: &str, payload: Value) {
        self.fire(TransportEvent::Message {
            event: event.to_string(),
            payload,
        });
    }

    pub fn emitted(&self) -> Vec<EmittedEvent> {
        lock(&self.state.emitted).clone()
    }

    /// Emitted events with the given name
    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        lock(&self.state.emitted)
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn take_emitted(&self) -> Vec<EmittedEvent> {
        std::mem::take(&mut *lock(&self.state.emitted))
    }

    pub fn set_fail_emit(&self, fail: bool) {
        self.state.fail_emit.store(fail, Ordering::SeqCst);
    }

    pub fn auth(&self) -> AuthContext {
        lock(&self.state.auth).clone()
    }

    pub fn auth_swaps(&self) -> usize {
        self.state.auth_swaps.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &TransportOptions {
        &self.state.options
    }

    pub fn endpoint(&self) -> &str {
        &self.state.endpoint
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn reconnection_enabled(&self) -> bool {
        self.state.reconnection.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let opens = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(message) = &self.state.behavior.open_error {
            return Err(TransportError::OpenFailed(message.clone()));
        }
        if self.state.behavior.auto_connect {
            self.connect_ok(&format!("mock-{}-{opens}", self.state.index));
        }
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.state.fail_emit.load(Ordering::SeqCst) {
            return Err(TransportError::EmitFailed {
                event: event.to_string(),
                reason: "mock emit failure".to_string(),
            });
        }
        lock(&self.state.emitted).push((event.to_string(), payload));
        Ok(())
    }

    fn set_auth(&self, auth: AuthContext) {
        *lock(&self.state.auth) = auth;
        self.state.auth_swaps.fetch_add(1, Ordering::SeqCst);
    }

    fn disable_reconnection(&self) {
        self.state.reconnection.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        *lock(&self.state.socket_id) = None;
    }

    fn socket_id(&self) -> Option<String> {
        lock(&self.state.socket_id).clone()
    }
}

/// Token provider with a settable token and scripted refresh results
///
/// Refreshes with nothing scripted return `Ok(None)`.
pub struct MockTokenProvider {
    token: Mutex<Option<String>>,
    refresh_results: Mutex<VecDeque<Result<Option<String>, TokenError>>>,
    refresh_calls: AtomicUsize,
    changes: watch::Sender<TokenState>,
}

impl MockTokenProvider {
    pub fn new(token: Option<&str>) -> Self {
        let initial = token.map(TokenState::authenticated).unwrap_or_default();
        let (changes, _) = watch::channel(initial);
        Self {
            token: Mutex::new(token.map(str::to_string)),
            refresh_results: Mutex::new(VecDeque::new()),
            refresh_calls: AtomicUsize::new(0),
            changes,
        }
    }

    pub fn push_refresh_result(&self, result: Result<Option<String>, TokenError>) {
        lock(&self.refresh_results).push_back(result);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Change the token and notify subscribers; `None` signs out
    pub fn set_token(&self, token: Option<&str>) {
        *lock(&self.token) = token.map(str::to_string);
        self.changes
            .send_replace(token.map(TokenState::authenticated).unwrap_or_default());
    }

    /// Publish a state without touching the stored token
    pub fn publish(&self, state: TokenState) {
        self.changes.send_replace(state);
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn valid_token(&self) -> Result<Option<String>, TokenError> {
        Ok(lock(&self.token).clone())
    }

    async fn refresh_token(&self) -> Result<Option<String>, TokenError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let result = lock(&self.refresh_results).pop_front().unwrap_or(Ok(None));
        if let Ok(Some(token)) = &result {
            *lock(&self.token) = Some(token.clone());
        }
        result
    }

    fn token_changes(&self) -> watch::Receiver<TokenState> {
        self.changes.subscribe()
    }
}
