//! Socket.IO transport over `rust_socketio`'s async client
//!
//! Reconnection after network loss is left to the client. Credentials are read
//! through a shared cell on every reconnect handshake, so `set_auth` takes
//! effect on the next reconnect without tearing the client down. Outbound
//! emits are queued to a writer task so `emit` stays synchronous and ordered.
//!
//! The client stops reconnecting silently once its attempt limit is spent, so
//! the adapter counts reconnect handshakes itself and reports
//! [`TransportEvent::ReconnectFailed`] when the last allowed attempt has had
//! time to finish without a `Connect`.

use super::{
    AuthContext, EventSink, Transport, TransportError, TransportEvent, TransportFactory,
    TransportOptions,
};
use futures::FutureExt;
use rust_socketio::asynchronous::{Client, ClientBuilder, ReconnectSettings};
use rust_socketio::{Event, Payload, TransportType};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

type Outbound = (String, Value);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates [`SocketIoTransport`]s
#[derive(Debug, Clone, Default)]
pub struct SocketIoFactory;

impl SocketIoFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for SocketIoFactory {
    type Transport = SocketIoTransport;

    fn create(
        &self,
        endpoint: &str,
        options: TransportOptions,
        sink: EventSink,
    ) -> Result<SocketIoTransport, TransportError> {
        Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidConfig(format!("{endpoint}: {e}")))?;
        let transport_type = transport_type(&options.transports)?;
        let budget = ReconnectBudget::new(reconnect_limit(options.reconnection_attempts));

        Ok(SocketIoTransport {
            endpoint: endpoint.to_string(),
            transport_type,
            auth: Arc::new(RwLock::new(options.auth.clone())),
            options,
            sink,
            shared: Arc::new(Shared::default()),
            budget: Arc::new(budget),
            client: Mutex::new(None),
            outbound: Mutex::new(None),
        })
    }
}

fn transport_type(transports: &[String]) -> Result<TransportType, TransportError> {
    match transports {
        [only] if only == "websocket" => Ok(TransportType::Websocket),
        [only] if only == "polling" => Ok(TransportType::Polling),
        other => Err(TransportError::InvalidConfig(format!(
            "expected exactly one of websocket|polling, got {other:?}"
        ))),
    }
}

/// Flags read from client callbacks
#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    reconnection_disabled: AtomicBool,
}

impl Shared {
    fn forwarding(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

fn reconnect_limit(attempts: u32) -> u8 {
    u8::try_from(attempts).unwrap_or(u8::MAX)
}

/// Reconnect attempts made since the last successful handshake
///
/// Each successful `Connect` starts a new generation; a pending exhaustion
/// report from an older generation is discarded.
#[derive(Debug)]
struct ReconnectBudget {
    /// Zero means the client gets no reconnect attempts to count
    max: u32,
    attempts: AtomicU32,
    generation: AtomicU64,
    reported: AtomicBool,
}

impl ReconnectBudget {
    fn new(max: u8) -> Self {
        Self {
            max: u32::from(max),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            reported: AtomicBool::new(false),
        }
    }

    /// Count one reconnect attempt
    ///
    /// Returns the current generation when this is the last allowed attempt.
    fn record_attempt(&self) -> Option<u64> {
        if self.max == 0 {
            return None;
        }
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        (attempts == self.max).then(|| self.generation.load(Ordering::SeqCst))
    }

    fn record_connect(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reported.store(false, Ordering::SeqCst);
    }

    /// True once per generation, and only if no handshake succeeded since
    fn should_report(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && !self.reported.swap(true, Ordering::SeqCst)
    }
}

/// Report `ReconnectFailed` if the last attempt of `generation` never connects
fn spawn_exhaustion_watch(
    sink: EventSink,
    shared: Arc<Shared>,
    budget: Arc<ReconnectBudget>,
    generation: u64,
    grace: Duration,
) {
    let Ok(runtime) = Handle::try_current() else {
        warn!("No runtime available to watch Socket.IO reconnect attempts");
        return;
    };
    runtime.spawn(async move {
        tokio::time::sleep(grace).await;
        let disabled = shared.reconnection_disabled.load(Ordering::SeqCst);
        if shared.forwarding() && !disabled && budget.should_report(generation) {
            warn!(generation, "Socket.IO reconnect attempts exhausted");
            sink(TransportEvent::ReconnectFailed);
        }
    });
}

pub struct SocketIoTransport {
    endpoint: String,
    transport_type: TransportType,
    options: TransportOptions,
    auth: Arc<RwLock<AuthContext>>,
    sink: EventSink,
    shared: Arc<Shared>,
    budget: Arc<ReconnectBudget>,
    client: Mutex<Option<Client>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl SocketIoTransport {
    fn current_auth(auth: &RwLock<AuthContext>) -> Value {
        auth.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_payload()
    }

    fn builder(&self) -> ClientBuilder {
        let attempts = reconnect_limit(self.options.reconnection_attempts);
        let delay_min = self.options.reconnection_delay.as_millis() as u64;
        let delay_max = self.options.reconnection_delay_max.as_millis() as u64;

        let connect_sink = self.sink.clone();
        let connect_shared = self.shared.clone();
        let connect_budget = self.budget.clone();
        let close_sink = self.sink.clone();
        let close_shared = self.shared.clone();
        let error_sink = self.sink.clone();
        let error_shared = self.shared.clone();
        let any_sink = self.sink.clone();
        let any_shared = self.shared.clone();
        let reconnect_auth = self.auth.clone();
        let reconnect_sink = self.sink.clone();
        let reconnect_shared = self.shared.clone();
        let reconnect_budget = self.budget.clone();
        let grace = self.options.timeout + self.options.reconnection_delay_max;

        ClientBuilder::new(self.endpoint.clone())
            .transport_type(self.transport_type.clone())
            .auth(Self::current_auth(&self.auth))
            .reconnect(self.options.reconnection)
            .reconnect_on_disconnect(self.options.reconnection)
            .max_reconnect_attempts(attempts)
            .reconnect_delay(delay_min, delay_max)
            .on(Event::Connect, move |_payload: Payload, _client: Client| {
                connect_budget.record_connect();
                if connect_shared.forwarding() {
                    connect_sink(TransportEvent::Connected { socket_id: None });
                }
                async {}.boxed()
            })
            .on(Event::Close, move |payload: Payload, _client: Client| {
                let disabled = close_shared.reconnection_disabled.load(Ordering::SeqCst);
                if close_shared.forwarding() && !disabled {
                    close_sink(TransportEvent::Disconnected {
                        reason: message_of(payload_to_value(payload)),
                    });
                }
                async {}.boxed()
            })
            .on(Event::Error, move |payload: Payload, _client: Client| {
                if error_shared.forwarding() {
                    error_sink(TransportEvent::ConnectError {
                        message: message_of(payload_to_value(payload)),
                    });
                }
                async {}.boxed()
            })
            .on_any(move |event: Event, payload: Payload, _client: Client| {
                if any_shared.forwarding() {
                    let name = match event {
                        Event::Custom(name) => Some(name),
                        Event::Message => Some("message".to_string()),
                        _ => None,
                    };
                    if let Some(event) = name {
                        any_sink(TransportEvent::Message {
                            event,
                            payload: payload_to_value(payload),
                        });
                    }
                }
                async {}.boxed()
            })
            .on_reconnect(move || {
                if let Some(generation) = reconnect_budget.record_attempt() {
                    spawn_exhaustion_watch(
                        reconnect_sink.clone(),
                        reconnect_shared.clone(),
                        reconnect_budget.clone(),
                        generation,
                        grace,
                    );
                }
                let auth = Self::current_auth(&reconnect_auth);
                async move {
                    let mut settings = ReconnectSettings::new();
                    settings.auth(auth);
                    settings
                }
                .boxed()
            })
    }

    fn spawn_writer(client: Client) -> mpsc::UnboundedSender<Outbound> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(async move {
            while let Some((event, payload)) = rx.recv().await {
                if let Err(e) = client.emit(event.as_str(), Payload::Text(vec![payload])).await {
                    warn!(event = %event, error = %e, "Socket.IO emit failed");
                }
            }
            debug!("Socket.IO writer stopped");
        });
        tx
    }

    fn spawn_disconnect(client: Client) {
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = client.disconnect().await {
                        debug!(error = %e, "Socket.IO disconnect failed");
                    }
                });
            }
            Err(_) => warn!("No runtime available to disconnect Socket.IO client"),
        }
    }
}

#[async_trait::async_trait]
impl Transport for SocketIoTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let connect = self.builder().connect();
        let client = tokio::time::timeout(self.options.timeout, connect)
            .await
            .map_err(|_| TransportError::OpenFailed("connect timed out".to_string()))?
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        if !self.shared.forwarding() {
            Self::spawn_disconnect(client);
            return Ok(());
        }
        *lock(&self.outbound) = Some(Self::spawn_writer(client.clone()));
        *lock(&self.client) = Some(client);
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        tx.send((event.to_string(), payload))
            .map_err(|_| TransportError::EmitFailed {
                event: event.to_string(),
                reason: "writer stopped".to_string(),
            })
    }

    fn set_auth(&self, auth: AuthContext) {
        *self
            .auth
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = auth;
    }

    fn disable_reconnection(&self) {
        self.shared
            .reconnection_disabled
            .store(true, Ordering::SeqCst);
        lock(&self.outbound).take();
        if let Some(client) = lock(&self.client).take() {
            Self::spawn_disconnect(client);
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        lock(&self.outbound).take();
        if let Some(client) = lock(&self.client).take() {
            Self::spawn_disconnect(client);
        }
    }

    /// Always `None`: the async client keeps the engine.io session id private
    fn socket_id(&self) -> Option<String> {
        None
    }
}

#[allow(deprecated)]
fn payload_to_value(payload: Payload) -> Value {
    match payload {
        Payload::Text(mut values) => {
            if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            }
        }
        Payload::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Payload::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
    }
}

fn message_of(value: Value) -> String {
    match value {
        Value::String(message) => message,
        Value::Object(ref map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientType, Platform, TransportSection};
    use serde_json::json;

    fn options() -> TransportOptions {
        TransportOptions::from_section(
            &TransportSection::default(),
            AuthContext::new("tok", ClientType::Mobile, Platform::Android),
        )
    }

    #[test]
    fn test_create_rejects_bad_url() {
        let result = SocketIoFactory::new().create("not a url", options(), Arc::new(|_: TransportEvent| {}));
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_transport_type_requires_single_mechanism() {
        assert!(transport_type(&["websocket".to_string()]).is_ok());
        assert!(transport_type(&["polling".to_string()]).is_ok());
        assert!(transport_type(&[]).is_err());
        assert!(transport_type(&["websocket".to_string(), "polling".to_string()]).is_err());
    }

    #[test]
    fn test_emit_before_open_is_not_connected() {
        let transport = SocketIoFactory::new()
            .create("http://localhost:3000", options(), Arc::new(|_: TransportEvent| {}))
            .unwrap();
        assert_eq!(
            transport.emit("ping", Value::Null),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn test_set_auth_updates_reconnect_payload() {
        let transport = SocketIoFactory::new()
            .create("http://localhost:3000", options(), Arc::new(|_: TransportEvent| {}))
            .unwrap();
        transport.set_auth(AuthContext::new("fresh", ClientType::Mobile, Platform::Android));
        assert_eq!(
            SocketIoTransport::current_auth(&transport.auth)["token"],
            json!("fresh")
        );
    }

    #[test]
    fn test_payload_conversion() {
        assert_eq!(payload_to_value(Payload::Text(vec![json!({"a": 1})])), json!({"a": 1}));
        assert_eq!(
            payload_to_value(Payload::Text(vec![json!(1), json!(2)])),
            json!([1, 2])
        );
        assert_eq!(message_of(json!("jwt expired")), "jwt expired");
        assert_eq!(message_of(json!({"message": "invalid token"})), "invalid token");
    }

    #[test]
    fn test_reconnect_budget_flags_last_attempt_only() {
        let budget = ReconnectBudget::new(3);

        assert_eq!(budget.record_attempt(), None);
        assert_eq!(budget.record_attempt(), None);
        assert_eq!(budget.record_attempt(), Some(0));
        assert_eq!(budget.record_attempt(), None);

        assert!(budget.should_report(0));
        assert!(!budget.should_report(0));
    }

    #[test]
    fn test_reconnect_budget_resets_on_connect() {
        let budget = ReconnectBudget::new(2);
        budget.record_attempt();
        assert_eq!(budget.record_attempt(), Some(0));

        budget.record_connect();

        assert!(!budget.should_report(0));
        assert_eq!(budget.record_attempt(), None);
        assert_eq!(budget.record_attempt(), Some(1));
        assert!(budget.should_report(1));
    }

    #[test]
    fn test_reconnect_budget_without_attempts_never_reports() {
        let budget = ReconnectBudget::new(0);
        for _ in 0..5 {
            assert_eq!(budget.record_attempt(), None);
        }
    }

    #[test]
    fn test_reconnect_limit_saturates() {
        assert_eq!(reconnect_limit(5), 5);
        assert_eq!(reconnect_limit(1000), u8::MAX);
    }

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: EventSink = Arc::new(move |event: TransportEvent| {
            sink_events.lock().unwrap().push(event);
        });
        (sink, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_report_reconnect_failed() {
        let (sink, events) = recording_sink();
        let shared = Arc::new(Shared::default());
        let budget = Arc::new(ReconnectBudget::new(1));
        let generation = budget.record_attempt().unwrap();

        spawn_exhaustion_watch(sink, shared, budget, generation, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(*events.lock().unwrap(), vec![TransportEvent::ReconnectFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_last_attempt_suppresses_report() {
        let (sink, events) = recording_sink();
        let shared = Arc::new(Shared::default());
        let budget = Arc::new(ReconnectBudget::new(1));
        let generation = budget.record_attempt().unwrap();

        spawn_exhaustion_watch(sink, shared, budget.clone(), generation, Duration::from_secs(5));
        budget.record_connect();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_reconnection_suppresses_report() {
        let (sink, events) = recording_sink();
        let shared = Arc::new(Shared::default());
        shared.reconnection_disabled.store(true, Ordering::SeqCst);
        let budget = Arc::new(ReconnectBudget::new(1));
        let generation = budget.record_attempt().unwrap();

        spawn_exhaustion_watch(sink, shared, budget, generation, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(events.lock().unwrap().is_empty());
    }
}
