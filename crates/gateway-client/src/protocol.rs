//! Gateway protocol types for Gateway communication
//!
//! All frames are JSON text messages over a single WebSocket. The client
//! speaks first with a `connect` frame; after the handshake the socket
//! carries correlated request/response pairs, agent completion frames keyed
//! by `requestId`, and server-pushed events discriminated by `type`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Method names understood by the Gateway
pub mod methods {
    pub const HEALTH: &str = "health";
    pub const STATUS: &str = "status";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_APPLY: &str = "config.apply";
    pub const CONFIG_PATCH: &str = "config.patch";
    pub const SEND: &str = "send";
    pub const AGENT: &str = "agent";
}

/// Numeric error codes used by the Gateway
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Returned by the Gateway when it refuses a handshake outright
    pub const UNAVAILABLE: i64 = -32000;
    pub const NOT_CONNECTED: i64 = -32001;
    pub const REQUEST_TIMEOUT: i64 = -32002;
    pub const UNAUTHORIZED: i64 = -32003;
    pub const FORBIDDEN: i64 = -32004;
    pub const RATE_LIMITED: i64 = -32005;
    pub const AGENT_BUSY: i64 = -32006;
    pub const CONFIG_CONFLICT: i64 = -32007;
}

// ── Error shapes ─────────────────────────────────────────────────────────────

/// Error code as sent on the wire: an integer or a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Int(i64),
    Text(String),
}

impl ErrorCode {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(code) => Some(*code),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(code) => write!(f, "{}", code),
            Self::Text(code) => f.write_str(code),
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        Self::Int(code)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::Text(code.to_string())
    }
}

/// The untranslated `{code, message}` kept when an error frame is rewritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalError {
    pub code: ErrorCode,
    pub message: String,
}

/// Error payload of a response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<OriginalError>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            original_error: None,
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Credentials presented in the connect frame
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Auth {
    Token { token: String },
    Password { password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { .. } => f.write_str("Auth::Token(<redacted>)"),
            Self::Password { .. } => f.write_str("Auth::Password(<redacted>)"),
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self::Token {
            token: String::new(),
        }
    }
}

/// Identifies this client to the Gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Client -> Gateway handshake frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientHandshake {
    Connect { auth: Auth, client: ClientInfo },
}

/// Snapshot returned by a successful handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    #[serde(default)]
    pub presence: Value,
    #[serde(default)]
    pub health: Value,
    #[serde(default)]
    pub state_version: u64,
}

/// Gateway -> client handshake reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerHandshake {
    Connected(ConnectResult),
    Error { code: ErrorCode, message: String },
}

// ── Request / response ───────────────────────────────────────────────────────

/// A request as it travels through the interceptor chain and onto the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutboundMessage {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A correlated response; exactly one of `result` and `error` is meaningful
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl InboundMessage {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Build from a raw response frame. An `error` field wins over `result`.
    pub fn from_frame(id: impl Into<String>, frame: &Value) -> Self {
        let id = id.into();
        if let Some(raw) = frame.get("error").filter(|v| !v.is_null()) {
            let error = serde_json::from_value::<ErrorPayload>(raw.clone()).unwrap_or_else(|_| {
                ErrorPayload::new(
                    error_codes::INTERNAL_ERROR,
                    raw.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Malformed error payload"),
                )
            });
            return Self::err(id, error);
        }
        Self::ok(id, frame.get("result").cloned().unwrap_or(Value::Null))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Agent runs ───────────────────────────────────────────────────────────────

/// Parameters of an `agent` invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Completion deadline; the client default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Immediate acknowledgement of an agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAck {
    pub request_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Terminal status of an agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn from_frame(frame: &Value) -> Option<Self> {
        match frame.get("status").and_then(Value::as_str) {
            Some("completed") => Some(Self::Completed),
            Some("failed") => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Terminal frame of an agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCompletion {
    pub request_id: String,
    pub status: AgentStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Both phases of a finished agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub ack: AgentAck,
    pub completion: AgentCompletion,
}

// ── Send ─────────────────────────────────────────────────────────────────────

/// Parameters of a `send` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub to: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Event types with a local notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AgentOutput,
    Presence,
    Keepalive,
    Shutdown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            "agentOutput" => Some(Self::AgentOutput),
            "presence" => Some(Self::Presence),
            "keepalive" => Some(Self::Keepalive),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Server-pushed event frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl GatewayEvent {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_type(&self.event_type)
    }
}
