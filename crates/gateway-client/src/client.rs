//! Gateway client - one persistent WebSocket connection to one Gateway
//!
//! A connection goes through `Idle -> Connecting -> Connected`. It is only
//! usable once the Gateway has answered the `connect` frame with
//! `connected`. Every request gets a fresh id and waits on its own deadline,
//! so slow calls never hold up fast ones. Agent runs have two phases: the
//! `agent` request is acknowledged with a `requestId`, and a later frame
//! carrying that `requestId` reports the terminal status.
//!
//! Inbound frames are routed in a fixed order:
//!
//! 1. `id` matches an outstanding request: a response
//! 2. `requestId` matches a running agent and `status` is terminal: a completion
//! 3. `type` is present: a pushed event
//!
//! Anything else, including unparseable text, is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{GatewayClientOptions, CLOSE_GRACE_PERIOD};
use crate::error::{GatewayClientError, Result};
use crate::interceptor::{ErrorContext, Interceptor, InterceptorChain, Phase};
use crate::protocol::{
    error_codes, methods, AgentAck, AgentCompletion, AgentRequest, AgentResult, AgentStatus,
    ClientHandshake, ClientInfo, ConnectResult, ErrorCode, EventKind, GatewayEvent,
    InboundMessage, OutboundMessage, SendParams, ServerHandshake,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of a client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Never connected
    Idle = 0,
    /// Transport opening or handshake in progress
    Connecting = 1,
    /// Handshake completed and transport open
    Connected = 2,
    /// Closed on purpose or after the transport failed
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            _ => Self::Idle,
        }
    }
}

/// Notifications published by a client. See [`GatewayClient::subscribe`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    AgentOutput(GatewayEvent),
    Presence(GatewayEvent),
    Keepalive(GatewayEvent),
    Shutdown(GatewayEvent),
    /// Handshake completed (also after an automatic reconnect)
    Connected(ConnectResult),
    Disconnected { intentional: bool },
    /// A reconnect attempt has been scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted
    Error(GatewayClientError),
}

/// Waiter for an agent run's terminal frame
type CompletionTx = oneshot::Sender<Result<AgentCompletion>>;

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
    /// Set for `agent` calls; registered under the ack's `requestId`
    completion: Option<CompletionTx>,
}

/// A live transport and the tasks serving it
struct Transport {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientInner {
    options: GatewayClientOptions,
    chain: InterceptorChain,
    state: AtomicU8,
    intentional_close: AtomicBool,
    reconnect_attempt: AtomicU32,
    /// Bumped whenever a transport is installed or torn down on purpose;
    /// a reader whose generation is stale must not touch client state
    generation: AtomicU64,
    /// Generation whose writer task is still running, 0 when none is
    live_writer: AtomicU64,
    transport: Mutex<Option<Transport>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    agent_runs: Mutex<HashMap<String, CompletionTx>>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

/// Client for one Gateway. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.options.url())
            .field("state", &self.state())
            .finish()
    }
}

impl GatewayClient {
    pub fn new(options: GatewayClientOptions, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                options,
                chain: InterceptorChain::new(interceptors),
                state: AtomicU8::new(ConnectionState::Idle as u8),
                intentional_close: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                live_writer: AtomicU64::new(0),
                transport: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                agent_runs: Mutex::new(HashMap::new()),
                reconnect_task: std::sync::Mutex::new(None),
                events,
            }),
        }
    }

    pub fn options(&self) -> &GatewayClientOptions {
        &self.inner.options
    }

    /// The interceptor chain; interceptors can be added or removed at runtime
    pub fn interceptors(&self) -> &InterceptorChain {
        &self.inner.chain
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// True only after a successful handshake while the transport is open
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Receive events, lifecycle notifications, and reconnect progress
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Whether both handles refer to the same client
    pub fn same_client(&self, other: &GatewayClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Acknowledged agent runs still waiting for completion
    pub async fn pending_agent_runs(&self) -> usize {
        self.inner.agent_runs.lock().await.len()
    }

    /// Open the transport and perform the handshake.
    ///
    /// Calling this while connected opens a fresh transport and replaces
    /// the current one.
    pub async fn connect(&self) -> Result<ConnectResult> {
        self.inner.cancel_reconnect();
        self.inner.connect().await
    }

    /// Close the connection on purpose. Every outstanding request and agent
    /// run fails with a connection error and no reconnect is attempted.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Resolves to `null` without sending anything if an interceptor halts
    /// the request.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        Ok(self.inner.request(method, params, None).await?.unwrap_or(Value::Null))
    }

    pub async fn health(&self) -> Result<Value> {
        self.request(methods::HEALTH, None).await
    }

    pub async fn status(&self) -> Result<Value> {
        self.request(methods::STATUS, None).await
    }

    pub async fn config_get(&self) -> Result<Value> {
        self.request(methods::CONFIG_GET, None).await
    }

    /// Replace the Gateway configuration
    pub async fn config_apply(&self, params: Value) -> Result<Value> {
        self.request(methods::CONFIG_APPLY, Some(params)).await
    }

    /// Merge a partial configuration into the Gateway configuration
    pub async fn config_patch(&self, params: Value) -> Result<Value> {
        self.request(methods::CONFIG_PATCH, Some(params)).await
    }

    /// Deliver a message through one of the Gateway's channels
    pub async fn send(&self, params: SendParams) -> Result<Value> {
        let params = serde_json::to_value(&params)
            .map_err(|e| GatewayClientError::connection(format!("Failed to encode send params: {}", e)))?;
        self.request(methods::SEND, Some(params)).await
    }

    /// Start an agent run and wait for both its ack and its completion.
    ///
    /// The ack is bounded by the request deadline; the completion by
    /// `request.timeout_ms`, or the request deadline when unset.
    pub async fn agent(&self, request: AgentRequest) -> Result<AgentResult> {
        let completion_timeout_ms = request.timeout_ms.unwrap_or(self.inner.options.timeout_ms);
        let params = serde_json::to_value(&request)
            .map_err(|e| GatewayClientError::connection(format!("Failed to encode agent request: {}", e)))?;

        let (completion_tx, completion_rx) = oneshot::channel();
        let Some(ack) = self
            .inner
            .request(methods::AGENT, Some(params), Some(completion_tx))
            .await?
        else {
            return Err(GatewayClientError::gateway(
                error_codes::INTERNAL_ERROR,
                "Agent request was halted before it was sent",
            ));
        };
        let registered = ack.get("requestId").and_then(Value::as_str).map(str::to_string);
        let ack: AgentAck = match serde_json::from_value(ack) {
            Ok(ack) => ack,
            Err(e) => {
                let Some(request_id) = registered else {
                    return Err(GatewayClientError::gateway(
                        error_codes::INTERNAL_ERROR,
                        "Agent ack did not carry a requestId",
                    ));
                };
                self.inner.agent_runs.lock().await.remove(&request_id);
                return Err(GatewayClientError::gateway(
                    error_codes::INTERNAL_ERROR,
                    format!("Malformed agent ack: {}", e),
                ));
            }
        };
        debug!(request_id = %ack.request_id, "Agent run acknowledged");

        match tokio::time::timeout(Duration::from_millis(completion_timeout_ms), completion_rx).await {
            Ok(Ok(Ok(completion))) => Ok(AgentResult { ack, completion }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(GatewayClientError::connection_closed()),
            Err(_) => {
                self.inner.agent_runs.lock().await.remove(&ack.request_id);
                warn!(request_id = %ack.request_id, "Agent run did not complete in {}ms", completion_timeout_ms);
                Err(GatewayClientError::timeout("agent completion", completion_timeout_ms))
            }
        }
    }
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.live_writer.load(Ordering::SeqCst) != 0
    }

    fn notify(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn cancel_reconnect(&self) {
        let task = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<ConnectResult> {
        self.intentional_close.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let url = self.options.url();
        info!("Connecting to gateway at {}", url);

        let handshake = tokio::time::timeout(self.options.timeout(), self.open(&url)).await;
        let (sink, source, result) = match handshake {
            Ok(Ok(opened)) => opened,
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Disconnected);
                warn!("Gateway handshake with {} failed: {}", url, err);
                return Err(err);
            }
            Err(_) => {
                // Dropping the handshake future tears the transport down
                self.set_state(ConnectionState::Disconnected);
                warn!("Gateway handshake with {} timed out", url);
                return Err(GatewayClientError::timeout("handshake", self.options.timeout_ms));
            }
        };

        // Hold the slot while the tasks start so a reader that dies at once
        // cannot observe a half-installed transport.
        let mut slot = self.transport.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.live_writer.store(generation, Ordering::SeqCst);
        let writer = tokio::spawn(write_loop(Arc::downgrade(self), sink, outbound_rx, generation));
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), source, generation));
        if let Some(previous) = slot.replace(Transport {
            generation,
            outbound,
            reader,
            writer,
        }) {
            debug!("Replacing transport generation {}", previous.generation);
            previous.reader.abort();
            previous.writer.abort();
        }
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        drop(slot);

        info!(state_version = result.state_version, "Connected to gateway at {}", url);
        self.notify(ClientEvent::Connected(result.clone()));
        Ok(result)
    }

    /// Open the transport, send `connect`, and read exactly one reply
    async fn open(&self, url: &str) -> Result<(WsSink, WsSource, ConnectResult)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| GatewayClientError::connection(format!("Failed to connect to {}: {}", url, e)))?;
        let (mut sink, mut source) = ws.split();

        let hello = ClientHandshake::Connect {
            auth: self.options.auth.clone(),
            client: ClientInfo::default(),
        };
        let hello = serde_json::to_string(&hello)
            .map_err(|e| GatewayClientError::connection(format!("Failed to encode connect frame: {}", e)))?;
        sink.send(Message::Text(hello.into())).await?;

        let reply = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(GatewayClientError::connection("Connection closed during handshake"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        match serde_json::from_str::<ServerHandshake>(reply.as_str()) {
            Ok(ServerHandshake::Connected(result)) => Ok((sink, source, result)),
            Ok(ServerHandshake::Error { code, message }) => {
                let _ = sink.close().await;
                Err(handshake_rejected(code, message))
            }
            Err(e) => {
                let _ = sink.close().await;
                Err(GatewayClientError::connection(format!("Unexpected handshake reply: {}", e)))
            }
        }
    }

    async fn disconnect(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.fail_all(GatewayClientError::connection_closed()).await;

        let transport = {
            let mut slot = self.transport.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.live_writer.store(0, Ordering::SeqCst);
            slot.take()
        };
        if self.state() != ConnectionState::Idle {
            self.set_state(ConnectionState::Disconnected);
        }

        let Some(transport) = transport else {
            return;
        };
        info!("Disconnecting from gateway at {}", self.options.url());
        let _ = transport.outbound.send(Message::Close(None));
        let Transport {
            mut reader,
            mut writer,
            ..
        } = transport;
        let closed = tokio::time::timeout(CLOSE_GRACE_PERIOD, async {
            let _ = (&mut writer).await;
            let _ = (&mut reader).await;
        })
        .await;
        if closed.is_err() {
            warn!("Gateway did not acknowledge close; terminating transport");
            reader.abort();
            writer.abort();
        }
        self.notify(ClientEvent::Disconnected { intentional: true });
    }

    /// `None` when an interceptor halted the request
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        completion: Option<CompletionTx>,
    ) -> Result<Option<Value>> {
        if !self.is_connected() {
            return Err(GatewayClientError::not_connected());
        }

        let msg = OutboundMessage::new(Uuid::new_v4().to_string(), method, params);
        let Some(msg) = self.chain.process_outbound(msg).await else {
            return Ok(None);
        };
        let text = serde_json::to_string(&msg)
            .map_err(|e| GatewayClientError::connection(format!("Failed to encode request: {}", e)))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            msg.id.clone(),
            PendingRequest {
                method: msg.method.clone(),
                reply: reply_tx,
                completion,
            },
        );
        if let Err(err) = self.send_text(text).await {
            self.pending.lock().await.remove(&msg.id);
            return Err(err);
        }

        match tokio::time::timeout(self.options.timeout(), &mut reply_rx).await {
            Ok(Ok(reply)) => reply.map(Some),
            Ok(Err(_)) => Err(GatewayClientError::connection_closed()),
            Err(_) => {
                self.pending.lock().await.remove(&msg.id);
                // The reader may have claimed the request as the deadline fired.
                // Closing first means it either already replied or will see
                // the caller is gone.
                reply_rx.close();
                if let Ok(reply) = reply_rx.try_recv() {
                    return reply.map(Some);
                }
                let err = GatewayClientError::timeout(msg.method.clone(), self.options.timeout_ms);
                let ctx = ErrorContext::new(Phase::Request).with_request(msg.id.clone(), msg.method.clone());
                self.chain.process_error(&anyhow::Error::new(err.clone()), &ctx).await;
                Err(err)
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let slot = self.transport.lock().await;
        let transport = slot.as_ref().ok_or_else(GatewayClientError::not_connected)?;
        transport
            .outbound
            .send(Message::Text(text.into()))
            .map_err(|_| GatewayClientError::connection("Transport is closed"))
    }

    /// Reject every outstanding request and agent run with `error`.
    ///
    /// Each swept request is reported to the chain like a timed-out one, so
    /// stateful interceptors can close it out.
    async fn fail_all(&self, error: GatewayClientError) {
        let pending: Vec<(String, PendingRequest)> = self.pending.lock().await.drain().collect();
        let runs: Vec<CompletionTx> = self.agent_runs.lock().await.drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() || !runs.is_empty() {
            debug!(
                requests = pending.len(),
                agent_runs = runs.len(),
                "Rejecting outstanding calls: {}",
                error
            );
        }
        for (id, request) in pending {
            let _ = request.reply.send(Err(error.clone()));
            let ctx = ErrorContext::new(Phase::Request).with_request(id, request.method);
            self.chain.process_error(&anyhow::Error::new(error.clone()), &ctx).await;
        }
        for run in runs {
            let _ = run.send(Err(error.clone()));
        }
    }

    async fn dispatch(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping unparseable frame: {}", e);
                return;
            }
        };

        if let Some(id) = frame.get("id").and_then(Value::as_str) {
            let pending = self.pending.lock().await.remove(id);
            if let Some(pending) = pending {
                self.resolve_request(id, pending, &frame).await;
                return;
            }
        }

        if let (Some(request_id), Some(status)) = (
            frame.get("requestId").and_then(Value::as_str),
            AgentStatus::from_frame(&frame),
        ) {
            let run = self.agent_runs.lock().await.remove(request_id);
            if let Some(run) = run {
                debug!(request_id, ?status, "Agent run finished");
                let _ = run.send(completion_from_frame(&frame, status));
                return;
            }
        }

        if frame.get("type").and_then(Value::as_str).is_some() {
            match serde_json::from_value::<GatewayEvent>(frame) {
                Ok(event) => self.dispatch_event(event).await,
                Err(e) => debug!("Dropping malformed event: {}", e),
            }
        }
    }

    async fn resolve_request(&self, id: &str, pending: PendingRequest, frame: &Value) {
        let msg = self.chain.process_inbound(InboundMessage::from_frame(id, frame)).await;
        let mut registered_run = None;
        let reply = match msg.error {
            Some(error) => {
                debug!(id, method = %pending.method, "Request failed: {}", error.message);
                Err(GatewayClientError::Gateway {
                    code: error.code,
                    message: error.message,
                    original: error.original_error,
                })
            }
            None => {
                let result = msg.result.unwrap_or(Value::Null);
                // Register the run before anyone sees the ack, so a completion
                // that follows immediately finds its waiter.
                if let Some(completion) = pending.completion {
                    if let Some(request_id) = result.get("requestId").and_then(Value::as_str) {
                        self.agent_runs
                            .lock()
                            .await
                            .insert(request_id.to_string(), completion);
                        registered_run = Some(request_id.to_string());
                    }
                }
                Ok(result)
            }
        };
        if pending.reply.send(reply).is_err() {
            debug!(id, method = %pending.method, "Caller stopped waiting before the response arrived");
            if let Some(request_id) = registered_run {
                self.agent_runs.lock().await.remove(&request_id);
            }
        }
    }

    async fn dispatch_event(&self, event: GatewayEvent) {
        self.chain.process_event(&event).await;
        let notification = match event.kind() {
            Some(EventKind::AgentOutput) => ClientEvent::AgentOutput(event),
            Some(EventKind::Presence) => ClientEvent::Presence(event),
            Some(EventKind::Keepalive) => ClientEvent::Keepalive(event),
            Some(EventKind::Shutdown) => ClientEvent::Shutdown(event),
            None => {
                debug!(event_type = %event.event_type, "Ignoring unknown event type");
                return;
            }
        };
        self.notify(notification);
    }

    /// The reader for `generation` has stopped
    async fn handle_close(self: &Arc<Self>, generation: u64) {
        let transport = {
            let mut slot = self.transport.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            self.live_writer.store(0, Ordering::SeqCst);
            slot.take()
        };
        if let Some(transport) = transport {
            transport.writer.abort();
        }
        self.set_state(ConnectionState::Disconnected);

        let intentional = self.intentional_close.load(Ordering::SeqCst);
        self.notify(ClientEvent::Disconnected { intentional });
        if intentional {
            return;
        }

        warn!("Lost connection to gateway at {}", self.options.url());
        self.fail_all(GatewayClientError::connection("Connection lost")).await;
        if self.options.reconnect.enabled {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let policy = &self.options.reconnect;
        let previous = self.reconnect_attempt.load(Ordering::SeqCst);
        if previous >= policy.max_attempts {
            error!(
                "Giving up on gateway at {} after {} reconnect attempts",
                self.options.url(),
                previous
            );
            self.notify(ClientEvent::Error(GatewayClientError::connection(format!(
                "Reconnect failed after {} attempts",
                previous
            ))));
            return;
        }

        let delay = policy.delay_for_attempt(previous);
        let attempt = previous + 1;
        self.reconnect_attempt.store(attempt, Ordering::SeqCst);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling gateway reconnect");
        self.notify(ClientEvent::Reconnecting { attempt, delay });

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.intentional_close.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = inner.connect().await {
                warn!(attempt, "Reconnect attempt failed: {}", err);
                inner.notify(ClientEvent::Disconnected { intentional: false });
                inner.schedule_reconnect();
            }
        });
        *self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

async fn write_loop(
    inner: Weak<ClientInner>,
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    generation: u64,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("Gateway write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    if let Some(client) = inner.upgrade() {
        // Only clear the flag if no newer transport has taken over
        let _ = client
            .live_writer
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Weak<ClientInner>, mut source: WsSource, generation: u64) {
    while let Some(frame) = source.next().await {
        let Some(client) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => client.dispatch(text.as_str()).await,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Gateway closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Gateway read failed: {}", e);
                break;
            }
        }
    }
    if let Some(client) = inner.upgrade() {
        client.handle_close(generation).await;
    }
}

/// Classify a handshake rejection. The Gateway does not tag auth failures
/// distinctly, so the unavailable code or an "auth" mention in the message
/// counts as one.
fn handshake_rejected(code: ErrorCode, message: String) -> GatewayClientError {
    let is_auth = code.as_i64() == Some(error_codes::UNAVAILABLE)
        || message.to_lowercase().contains("auth");
    if is_auth {
        GatewayClientError::Auth {
            code: Some(code),
            message,
        }
    } else {
        GatewayClientError::connection(format!("Handshake rejected ({}): {}", code, message))
    }
}

fn completion_from_frame(frame: &Value, status: AgentStatus) -> Result<AgentCompletion> {
    if status == AgentStatus::Failed {
        return Err(agent_failure(frame));
    }
    serde_json::from_value(frame.clone()).map_err(|e| {
        GatewayClientError::gateway(error_codes::INTERNAL_ERROR, format!("Malformed agent completion: {}", e))
    })
}

fn agent_failure(frame: &Value) -> GatewayClientError {
    let error = frame.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(|c| serde_json::from_value::<ErrorCode>(c.clone()).ok())
        .unwrap_or_else(|| ErrorCode::from("AGENT_FAILED"));
    let message = error
        .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
        .unwrap_or("Agent run failed");
    GatewayClientError::gateway(code, message)
}
