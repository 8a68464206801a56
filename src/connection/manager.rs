//! Connection manager
//!
//! Owns the single live transport and everything that must outlive it: the
//! room registry, the handler registry, and the observable connection state.
//!
//! ## Locking
//!
//! All mutable state lives in one `ManagerCore` behind a `std::sync::Mutex`.
//! Transport methods are called with the lock held (they must not call back
//! into the manager). Every transition is published to the state store while
//! the lock is held, so the store always agrees with the core. State listeners
//! and event handlers are never called with the lock held: each operation
//! collects them in a [`Deferred`] and runs it after the guard is dropped, so
//! callbacks are free to call the manager.
//!
//! ## Connect cycles
//!
//! Every `connect()` and `disconnect()` bumps a cycle counter. Event sinks,
//! refresh timers and in-flight connects capture the cycle they belong to and
//! do nothing once it has been superseded.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::handlers::{EventHandler, HandlerRegistry, HandlerSubscription};
use super::policy::{ConnectErrorKind, ReconnectionPolicy, RetryDecision};
use super::rooms::{Room, RoomRegistry};
use super::state::{
    next_state, ConnectionSnapshot, ConnectionStateStore, ConnectionStatus, LifecycleEvent,
    StateListener, StateNotification, StateSubscription, AUTHENTICATION_FAILED,
    RECONNECTION_FAILED,
};
use crate::config::{ClientType, Platform, RealtimeConfig, TransportSection};
use crate::endpoint::{EndpointResolver, EnvironmentEndpointResolver};
use crate::error::{sanitize_error_message, ConnectionError, ConnectionResult};
use crate::token::{TokenError, TokenGateway, TokenState, TokenSubscription};
use crate::transport::{
    AuthContext, EventSink, Transport, TransportEvent, TransportFactory, TransportOptions,
};
use crate::{connection_span, token_span};

/// Local event fired after every successful (re)connect
pub const SOCKET_CONNECTED: &str = "socket:connected";
/// Local event fired when the live transport goes away
pub const SOCKET_DISCONNECTED: &str = "socket:disconnected";
/// Local event fired for every connect error surfaced as state
pub const SOCKET_ERROR: &str = "socket:error";

const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Runtime settings for a [`ConnectionManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub client_type: ClientType,
    pub platform: Platform,
    pub transport: TransportSection,
    pub refresh: ReconnectionPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            client_type: ClientType::Mobile,
            platform: Platform::Web,
            transport: TransportSection::default(),
            refresh: ReconnectionPolicy::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            client_type: config.auth.client_type,
            platform: config.endpoint.platform,
            transport: config.transport.clone(),
            refresh: ReconnectionPolicy::from_config(&config.token_refresh),
        }
    }
}

/// Point-in-time view of the manager for diagnostics and UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub is_connected: bool,
    /// Server-assigned id of the live socket, when the transport exposes one
    ///
    /// The Socket.IO adapter cannot read it from its client, so it stays
    /// `None` there even while connected.
    pub socket_id: Option<String>,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub rooms: Vec<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
}

/// Side effects collected under the lock and run after it is released
#[derive(Default)]
struct Deferred {
    states: Vec<StateNotification>,
    dispatches: Vec<(Vec<EventHandler>, Value)>,
}

impl Deferred {
    fn run(self, store: &ConnectionStateStore) {
        for notification in self.states {
            store.notify(notification);
        }
        for (handlers, payload) in self.dispatches {
            for handler in handlers {
                handler(&payload);
            }
        }
    }
}

struct ManagerCore<T> {
    snapshot: ConnectionSnapshot,
    store: Arc<ConnectionStateStore>,
    cycle: u64,
    transport: Option<Arc<T>>,
    /// Transport has reported `Connected` and not yet dropped
    live: bool,
    rooms: RoomRegistry,
    handlers: HandlerRegistry,
    /// Handlers attached to the current live transport
    attached: HandlerRegistry,
    token_subscription: Option<TokenSubscription>,
    last_token: Option<String>,
    /// Token change seen while a connect was still acquiring its token
    pending_token: Option<String>,
    socket_id: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    connected_once: bool,
    reconnect_count: u32,
    refresh_attempts: u32,
    refresh_in_flight: bool,
    reconnection_disabled: bool,
    closed: bool,
}

impl<T> ManagerCore<T> {
    fn new(store: Arc<ConnectionStateStore>) -> Self {
        Self {
            snapshot: ConnectionSnapshot::disconnected(),
            store,
            cycle: 0,
            transport: None,
            live: false,
            rooms: RoomRegistry::new(),
            handlers: HandlerRegistry::new(),
            attached: HandlerRegistry::new(),
            token_subscription: None,
            last_token: None,
            pending_token: None,
            socket_id: None,
            connected_at: None,
            connected_once: false,
            reconnect_count: 0,
            refresh_attempts: 0,
            refresh_in_flight: false,
            reconnection_disabled: false,
            closed: false,
        }
    }

    fn transition(&mut self, event: LifecycleEvent, deferred: &mut Deferred) {
        let next = next_state(&self.snapshot, &event);
        if next != self.snapshot {
            self.snapshot = next.clone();
            if let Some(notification) = self.store.publish(next) {
                deferred.states.push(notification);
            }
        }
    }

    fn local_event(&self, event: &str, payload: Value, deferred: &mut Deferred) {
        let handlers = self.handlers.handlers_for(event);
        if !handlers.is_empty() {
            deferred.dispatches.push((handlers, payload));
        }
    }

    fn drop_live(&mut self) {
        self.live = false;
        self.attached.clear();
        self.socket_id = None;
    }

    fn reset_refresh(&mut self) {
        self.refresh_attempts = 0;
        self.refresh_in_flight = false;
    }
}

struct ManagerInner<F: TransportFactory> {
    factory: F,
    endpoint: Arc<dyn EndpointResolver>,
    tokens: TokenGateway,
    settings: ConnectionSettings,
    store: Arc<ConnectionStateStore>,
    core: Mutex<ManagerCore<F::Transport>>,
}

/// Owns one authenticated realtime connection and its replayable state
///
/// Cloning yields another handle to the same manager.
pub struct ConnectionManager<F: TransportFactory> {
    inner: Arc<ManagerInner<F>>,
}

impl<F: TransportFactory> Clone for ConnectionManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TransportFactory> ConnectionManager<F> {
    pub fn new(
        factory: F,
        endpoint: Arc<dyn EndpointResolver>,
        tokens: TokenGateway,
        settings: ConnectionSettings,
    ) -> Self {
        let store = Arc::new(ConnectionStateStore::new());
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                endpoint,
                tokens,
                settings,
                store: Arc::clone(&store),
                core: Mutex::new(ManagerCore::new(store)),
            }),
        }
    }

    /// Build a manager whose endpoint and settings come from a config file
    pub fn from_config(factory: F, config: &RealtimeConfig, tokens: TokenGateway) -> Self {
        Self::new(
            factory,
            Arc::new(EnvironmentEndpointResolver::from_config(&config.endpoint)),
            tokens,
            ConnectionSettings::from_config(config),
        )
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Open the connection, pulling a token from the gateway if none is given
    ///
    /// A no-op while already connecting or authenticated. Only failures before a
    /// transport exists are returned; everything later is reported as state.
    pub fn connect(&self, token: Option<String>) -> BoxFuture<'static, ConnectionResult<()>> {
        self.inner.clone().connect_boxed(token)
    }

    /// Tear down the transport; rooms and handlers are kept for the next connect
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Disconnect and forget everything; the manager cannot be reused
    pub fn cleanup(&self) {
        self.inner.disconnect();
        {
            let mut core = self.inner.lock();
            core.rooms.clear();
            core.handlers.clear();
            core.attached.clear();
            core.closed = true;
        }
        self.inner.store.clear_listeners();
        info!("Connection manager cleaned up");
    }

    /// Send an event; returns false without buffering if not connected
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        let core = self.inner.lock();
        if !core.live {
            debug!(event, "Emit skipped: not connected");
            return false;
        }
        let Some(transport) = core.transport.as_ref() else {
            return false;
        };
        match transport.emit(event, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(event, error = %e, "Emit failed");
                false
            }
        }
    }

    /// Register a handler, attaching it to the live transport if there is one
    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerSubscription {
        {
            let mut core = self.inner.lock();
            core.handlers.add(event, handler.clone());
            if core.live {
                core.attached.add(event, handler.clone());
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let event = event.to_string();
        HandlerSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_handler(&event, &handler);
            }
        })
    }

    pub fn off(&self, event: &str, handler: &EventHandler) {
        self.inner.remove_handler(event, handler);
    }

    /// Remember the room and join it now if connected
    pub fn join_room(&self, room_type: &str, room_id: &str) {
        let room = Room::new(room_type, room_id);
        let mut core = self.inner.lock();
        if !core.rooms.insert(room.clone()) {
            debug!(room = %room, "Room already joined");
            return;
        }
        if !core.live {
            debug!(room = %room, "Room queued until connected");
            return;
        }
        if let Some(transport) = core.transport.as_ref() {
            let command = room.join_command();
            match transport.emit(command.event, command.payload) {
                Ok(()) => info!(room = %room, "Joined room"),
                Err(e) => warn!(room = %room, error = %e, "Failed to join room"),
            }
        }
    }

    /// Forget the room and leave it now if connected
    pub fn leave_room(&self, room_type: &str, room_id: &str) {
        let room = Room::new(room_type, room_id);
        let mut core = self.inner.lock();
        if !core.rooms.remove(&room) {
            debug!(room = %room, "Room was not joined");
            return;
        }
        if !core.live {
            return;
        }
        if let Some(transport) = core.transport.as_ref() {
            let command = room.leave_command();
            match transport.emit(command.event, command.payload) {
                Ok(()) => info!(room = %room, "Left room"),
                Err(e) => warn!(room = %room, error = %e, "Failed to leave room"),
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        let core = self.inner.lock();
        core.live && core.snapshot.status == ConnectionStatus::Authenticated
    }

    pub fn get_connection_state(&self) -> ConnectionInfo {
        let core = self.inner.lock();
        ConnectionInfo {
            is_connected: core.live && core.snapshot.status == ConnectionStatus::Authenticated,
            socket_id: core.socket_id.clone(),
            status: core.snapshot.status,
            error: core.snapshot.error.clone(),
            rooms: core.rooms.keys(),
            connected_at: core.connected_at,
            reconnect_count: core.reconnect_count,
        }
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.lock().rooms.keys()
    }

    /// Listen for state changes; listeners run synchronously in registration order
    pub fn subscribe(&self, listener: StateListener) -> StateSubscription {
        self.inner.store.subscribe(listener)
    }

    pub fn get_snapshot(&self) -> ConnectionSnapshot {
        self.inner.store.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.store.watch()
    }
}

impl<F: TransportFactory> ManagerInner<F> {
    fn lock(&self) -> MutexGuard<'_, ManagerCore<F::Transport>> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Boxed so the token-change task can call back into `connect`
    fn connect_boxed(
        self: Arc<Self>,
        token: Option<String>,
    ) -> BoxFuture<'static, ConnectionResult<()>> {
        async move { self.connect_inner(token).await }
            .instrument(connection_span!(operation = "connect"))
            .boxed()
    }

    async fn connect_inner(self: Arc<Self>, token: Option<String>) -> ConnectionResult<()> {
        let cycle = {
            let mut deferred = Deferred::default();
            let cycle = {
                let mut guard = self.lock();
                let core = &mut *guard;
                if core.closed {
                    return Err(ConnectionError::ShutDown);
                }
                if core.snapshot.status.is_active() {
                    debug!(status = %core.snapshot.status, "Connect ignored: already active");
                    return Ok(());
                }

                core.cycle += 1;
                if let Some(stale) = core.transport.take() {
                    debug!("Closing dormant transport before reconnecting");
                    stale.close();
                }
                core.drop_live();
                core.reset_refresh();
                core.reconnection_disabled = false;
                core.connected_once = false;
                core.reconnect_count = 0;
                core.pending_token = None;
                core.transition(LifecycleEvent::ConnectRequested, &mut deferred);
                core.cycle
            };
            deferred.run(&self.store);
            cycle
        };
        info!(cycle, "Connecting");

        let endpoint = match self.endpoint.resolve() {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Endpoint resolution failed");
                let message = sanitize_error_message(&e.to_string());
                self.fail_setup(cycle, LifecycleEvent::SetupFailed(message));
                return Err(e.into());
            }
        };

        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => Some(token),
            None => match self.tokens.current_token().await {
                Ok(token) => token,
                Err(e) => {
                    error!(error = %e, "Token acquisition failed");
                    let message = sanitize_error_message(&e.to_string());
                    self.fail_setup(cycle, LifecycleEvent::SetupFailed(message));
                    return Err(e.into());
                }
            },
        };
        let Some(token) = token else {
            warn!("No token available for connect");
            self.fail_setup(cycle, LifecycleEvent::TokenUnavailable);
            return Err(ConnectionError::MissingToken);
        };

        let transport = {
            let mut deferred = Deferred::default();
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.cycle != cycle || core.closed {
                debug!(cycle, "Connect superseded before transport creation");
                return Ok(());
            }

            let token = core.pending_token.take().unwrap_or(token);
            let auth = AuthContext::new(
                token.clone(),
                self.settings.client_type,
                self.settings.platform,
            );
            let options = TransportOptions::from_section(&self.settings.transport, auth);
            match self
                .factory
                .create(&endpoint, options, self.event_sink(cycle))
            {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    core.transport = Some(transport.clone());
                    core.last_token = Some(token);
                    if core.token_subscription.is_none() {
                        core.token_subscription = Some(self.subscribe_to_tokens());
                    }
                    transport
                }
                Err(e) => {
                    error!(error = %e, "Transport creation failed");
                    core.transition(
                        LifecycleEvent::SetupFailed(sanitize_error_message(&e.to_string())),
                        &mut deferred,
                    );
                    drop(guard);
                    deferred.run(&self.store);
                    return Err(e.into());
                }
            }
        };

        debug!(endpoint = %endpoint, "Opening transport");
        if let Err(e) = transport.open().await {
            self.handle_transport_event(
                cycle,
                TransportEvent::ConnectError {
                    message: e.to_string(),
                },
            );
        }
        Ok(())
    }

    fn fail_setup(&self, cycle: u64, event: LifecycleEvent) {
        let mut deferred = Deferred::default();
        {
            let mut core = self.lock();
            if core.cycle != cycle {
                return;
            }
            core.transition(event, &mut deferred);
        }
        deferred.run(&self.store);
    }

    fn event_sink(self: &Arc<Self>, cycle: u64) -> EventSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event: TransportEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_transport_event(cycle, event);
            }
        })
    }

    fn subscribe_to_tokens(self: &Arc<Self>) -> TokenSubscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.tokens.subscribe(move |state: TokenState| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_token_change(state).await;
                }
            }
        })
    }

    fn handle_transport_event(self: &Arc<Self>, cycle: u64, event: TransportEvent) {
        let mut deferred = Deferred::default();
        {
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.cycle != cycle {
                debug!(cycle, current = core.cycle, "Dropping event from superseded transport");
                return;
            }

            match event {
                TransportEvent::Connected { socket_id } => {
                    self.on_connected(core, socket_id, &mut deferred);
                }
                TransportEvent::Disconnected { reason } => {
                    info!(reason = %reason, "Transport disconnected");
                    core.drop_live();
                    core.transition(LifecycleEvent::TransportDisconnected, &mut deferred);
                    core.local_event(SOCKET_DISCONNECTED, json!({ "reason": reason }), &mut deferred);
                }
                TransportEvent::ConnectError { message } => {
                    self.on_connect_error(core, cycle, &message, &mut deferred);
                }
                TransportEvent::ReconnectFailed => {
                    error!("Transport gave up reconnecting");
                    if let Some(transport) = core.transport.take() {
                        transport.close();
                    }
                    core.drop_live();
                    core.transition(LifecycleEvent::ReconnectionExhausted, &mut deferred);
                    core.local_event(
                        SOCKET_ERROR,
                        json!({ "message": RECONNECTION_FAILED }),
                        &mut deferred,
                    );
                }
                TransportEvent::Message { event, payload } => {
                    let handlers = core.attached.handlers_for(&event);
                    if handlers.is_empty() {
                        debug!(event = %event, "No handlers for event");
                    } else {
                        deferred.dispatches.push((handlers, payload));
                    }
                }
            }
        }
        deferred.run(&self.store);
    }

    fn on_connected(
        &self,
        core: &mut ManagerCore<F::Transport>,
        socket_id: Option<String>,
        deferred: &mut Deferred,
    ) {
        let Some(transport) = core.transport.clone() else {
            return;
        };

        if core.connected_once {
            core.reconnect_count += 1;
        }
        core.connected_once = true;
        core.live = true;
        core.socket_id = socket_id.or_else(|| transport.socket_id());
        core.connected_at = Some(Utc::now());
        core.refresh_attempts = 0;

        let mut rejoined = 0usize;
        for room in core.rooms.iter() {
            let command = room.join_command();
            match transport.emit(command.event, command.payload) {
                Ok(()) => rejoined += 1,
                Err(e) => warn!(room = %room, error = %e, "Failed to rejoin room"),
            }
        }
        core.attached = core.handlers.clone();

        core.transition(LifecycleEvent::TransportConnected, deferred);
        core.local_event(
            SOCKET_CONNECTED,
            json!({ "socketId": core.socket_id }),
            deferred,
        );

        info!(
            socket_id = core.socket_id.as_deref().unwrap_or("unknown"),
            rooms = core.rooms.len(),
            rejoined,
            handlers = core.attached.handler_count(),
            reconnects = core.reconnect_count,
            "Transport connected, state restored"
        );
        if !core.rooms.is_empty() && rejoined == 0 {
            warn!(rooms = core.rooms.len(), "No rooms could be rejoined");
        }
    }

    fn on_connect_error(
        self: &Arc<Self>,
        core: &mut ManagerCore<F::Transport>,
        cycle: u64,
        message: &str,
        deferred: &mut Deferred,
    ) {
        if core.reconnection_disabled {
            debug!("Connect error ignored: reconnection disabled");
            return;
        }
        let message = sanitize_error_message(message);

        match ConnectErrorKind::classify(&message) {
            ConnectErrorKind::TokenExpired => {
                if core.refresh_in_flight {
                    debug!("Token refresh already in flight");
                    return;
                }
                match self.settings.refresh.decide(core.refresh_attempts) {
                    RetryDecision::Exhausted => {
                        self.fail_authentication(core, deferred);
                    }
                    RetryDecision::Proceed { attempt, delay } => {
                        info!(
                            attempt,
                            max_attempts = self.settings.refresh.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Token expired, scheduling refresh"
                        );
                        core.refresh_attempts = attempt;
                        core.refresh_in_flight = true;
                        if !self.schedule_refresh(cycle, attempt, delay) {
                            error!("No async runtime available for token refresh");
                            self.fail_authentication(core, deferred);
                        }
                    }
                }
            }
            ConnectErrorKind::Unauthorized => {
                error!(error = %message, "Credentials rejected, disabling reconnection");
                core.reconnection_disabled = true;
                core.reset_refresh();
                if let Some(transport) = core.transport.as_ref() {
                    transport.disable_reconnection();
                }
                core.transition(LifecycleEvent::AuthRejected(message.clone()), deferred);
                core.local_event(SOCKET_ERROR, json!({ "message": message }), deferred);
            }
            ConnectErrorKind::Network => {
                warn!(error = %message, "Connection error, transport will retry");
                core.transition(LifecycleEvent::NetworkError(message.clone()), deferred);
                core.local_event(SOCKET_ERROR, json!({ "message": message }), deferred);
            }
        }
    }

    fn fail_authentication(&self, core: &mut ManagerCore<F::Transport>, deferred: &mut Deferred) {
        error!(
            attempts = core.refresh_attempts,
            "Token refresh exhausted, disabling reconnection"
        );
        core.reconnection_disabled = true;
        core.reset_refresh();
        if let Some(transport) = core.transport.as_ref() {
            transport.disable_reconnection();
        }
        core.transition(LifecycleEvent::AuthenticationFailed, deferred);
        core.local_event(
            SOCKET_ERROR,
            json!({ "message": AUTHENTICATION_FAILED }),
            deferred,
        );
    }

    fn schedule_refresh(self: &Arc<Self>, cycle: u64, attempt: u32, delay: Duration) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            return false;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(
            async move {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.refresh_wanted(cycle) {
                    debug!("Refresh cancelled: connection torn down");
                    return;
                }
                let result = inner.tokens.refresh().await;
                inner.finish_refresh(cycle, result);
            }
            .instrument(token_span!(operation = "refresh", attempt)),
        );
        true
    }

    fn refresh_wanted(&self, cycle: u64) -> bool {
        let core = self.lock();
        core.cycle == cycle && !core.closed && !core.reconnection_disabled && core.refresh_in_flight
    }

    fn finish_refresh(&self, cycle: u64, result: Result<Option<String>, TokenError>) {
        let mut deferred = Deferred::default();
        {
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.cycle != cycle || !core.refresh_in_flight {
                debug!("Discarding refresh result for superseded connection");
                return;
            }
            core.refresh_in_flight = false;

            match result {
                Ok(Some(token)) => {
                    info!("Token refreshed, updating credentials in place");
                    self.swap_auth(core, token);
                    core.reset_refresh();
                }
                Ok(None) => {
                    warn!(
                        attempt = core.refresh_attempts,
                        max_attempts = self.settings.refresh.max_attempts,
                        "Token refresh produced no token"
                    );
                    if core.refresh_attempts >= self.settings.refresh.max_attempts {
                        self.fail_authentication(core, &mut deferred);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Token refresh failed");
                    self.fail_authentication(core, &mut deferred);
                }
            }
        }
        deferred.run(&self.store);
    }

    /// Hot-swap credentials on the current transport without reconnecting
    fn swap_auth(&self, core: &mut ManagerCore<F::Transport>, token: String) {
        let auth = AuthContext::new(token.clone(), self.settings.client_type, self.settings.platform);
        if let Some(transport) = core.transport.as_ref() {
            transport.set_auth(auth);
        }
        core.last_token = Some(token);
    }

    async fn handle_token_change(self: Arc<Self>, state: TokenState) {
        enum Action {
            Connect(String),
            Disconnect,
        }

        let action = {
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.closed {
                return;
            }

            let token = state.access_token.filter(|t| !t.is_empty());
            if token == core.last_token {
                debug!("Token change ignored: unchanged");
                return;
            }

            match token {
                Some(token) if state.is_authenticated => {
                    if core.transport.is_some() && !core.reconnection_disabled {
                        info!("Token changed, updating credentials in place");
                        self.swap_auth(core, token);
                        core.reset_refresh();
                        return;
                    }
                    if core.snapshot.status == ConnectionStatus::Connecting {
                        debug!("Token changed while acquiring token, using it for this connect");
                        core.pending_token = Some(token.clone());
                        core.last_token = Some(token);
                        return;
                    }
                    core.last_token = Some(token.clone());
                    Action::Connect(token)
                }
                _ => Action::Disconnect,
            }
        };

        match action {
            Action::Connect(token) => {
                info!("Token available, connecting");
                if let Err(e) = self.clone().connect_boxed(Some(token)).await {
                    warn!(error = %e, "Reconnect after token change failed");
                }
            }
            Action::Disconnect => {
                info!("Signed out, disconnecting");
                self.disconnect();
            }
        }
    }

    fn disconnect(&self) {
        let mut deferred = Deferred::default();
        let subscription = {
            let mut guard = self.lock();
            let core = &mut *guard;
            core.cycle += 1;
            let was_live = core.live;
            if let Some(transport) = core.transport.take() {
                transport.close();
            }
            core.drop_live();
            core.reset_refresh();
            core.reconnection_disabled = false;
            core.last_token = None;
            core.pending_token = None;
            core.connected_at = None;
            core.transition(LifecycleEvent::TeardownRequested, &mut deferred);
            if was_live {
                core.local_event(
                    SOCKET_DISCONNECTED,
                    json!({ "reason": CLIENT_DISCONNECT_REASON }),
                    &mut deferred,
                );
            }
            info!(rooms = core.rooms.len(), handlers = core.handlers.handler_count(), "Disconnected");
            core.token_subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        deferred.run(&self.store);
    }

    fn remove_handler(&self, event: &str, handler: &EventHandler) {
        let mut core = self.lock();
        let removed = core.handlers.remove(event, handler);
        core.attached.remove(event, handler);
        if removed {
            debug!(event, "Handler removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FixedEndpoint;
    use crate::testing::{MockTokenProvider, MockTransportFactory};
    use crate::transport::TransportEvent;

    fn manager(factory: &MockTransportFactory) -> ConnectionManager<MockTransportFactory> {
        let provider = Arc::new(MockTokenProvider::new(Some("tokA")));
        ConnectionManager::new(
            factory.clone(),
            Arc::new(FixedEndpoint::new("ws://localhost:3000")),
            TokenGateway::new(provider),
            ConnectionSettings::default(),
        )
    }

    #[test]
    fn test_settings_from_config() {
        let config = RealtimeConfig::test_config();
        let settings = ConnectionSettings::from_config(&config);
        assert_eq!(settings.platform, Platform::Android);
        assert_eq!(settings.refresh, ReconnectionPolicy::default());
    }

    #[tokio::test]
    async fn test_connect_pulls_token_from_gateway() {
        let factory = MockTransportFactory::new();
        let manager = manager(&factory);

        manager.connect(None).await.unwrap();

        let transport = factory.last().unwrap();
        assert_eq!(transport.auth().token, "tokA");
        assert_eq!(transport.endpoint(), "ws://localhost:3000");
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.get_snapshot(), ConnectionSnapshot::connecting());
    }

    #[tokio::test]
    async fn test_stale_transport_events_dropped() {
        let factory = MockTransportFactory::new();
        let manager = manager(&factory);

        manager.connect(None).await.unwrap();
        let first = factory.last().unwrap();
        manager.disconnect();
        manager.connect(None).await.unwrap();

        first.fire(TransportEvent::Connected {
            socket_id: Some("old".into()),
        });
        assert_eq!(manager.get_snapshot().status, ConnectionStatus::Connecting);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_local_events_dispatched_after_state_update() {
        let factory = MockTransportFactory::new();
        let manager = manager(&factory);
        let observed = Arc::new(Mutex::new(None));

        let observer = manager.clone();
        let sink = observed.clone();
        let _sub = manager.on(
            SOCKET_CONNECTED,
            crate::connection::handler(move |payload| {
                *sink.lock().unwrap() = Some((observer.get_snapshot().status, payload.clone()));
            }),
        );

        manager.connect(None).await.unwrap();
        factory.last().unwrap().fire(TransportEvent::Connected {
            socket_id: Some("abc".into()),
        });

        assert_eq!(
            *observed.lock().unwrap(),
            Some((ConnectionStatus::Authenticated, json!({"socketId": "abc"})))
        );
    }

    #[tokio::test]
    async fn test_connection_info_serializes_camel_case() {
        let factory = MockTransportFactory::new();
        let manager = manager(&factory);
        manager.join_room("order", "1");

        let info = serde_json::to_value(manager.get_connection_state()).unwrap();
        assert_eq!(info["isConnected"], json!(false));
        assert_eq!(info["status"], json!("DISCONNECTED"));
        assert_eq!(info["rooms"], json!(["order:1"]));
        assert_eq!(info["reconnectCount"], json!(0));
    }
}
