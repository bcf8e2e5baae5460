//! Gateway client
//!
//! A persistent, multiplexed WebSocket client for remote agent Gateways.
//! One [`GatewayClient`] owns one connection: it performs the auth
//! handshake, correlates concurrent requests with their responses, tracks
//! two-phase agent runs, fans out server-pushed events, and reconnects with
//! exponential backoff. Traffic passes through an [`InterceptorChain`].
//! [`GatewayManager`] keeps one client per instance id.

pub mod client;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod manager;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use client::{ClientEvent, ConnectionState, GatewayClient};
pub use config::{GatewayClientOptions, ReconnectPolicy};
pub use error::{ErrorKind, GatewayClientError, Result};
pub use interceptor::{
    AuditInterceptor, ErrorContext, ErrorTransformerInterceptor, Interceptor, InterceptorChain,
    LoggerInterceptor, OutboundAction, Phase, TelemetryInterceptor,
};
pub use manager::GatewayManager;
pub use protocol::{
    AgentAck, AgentCompletion, AgentRequest, AgentResult, AgentStatus, Auth, ConnectResult,
    GatewayEvent, SendParams,
};
