//! Connection options for a Gateway client

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Auth;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Grace period `disconnect()` waits for a clean close before tearing down
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Automatic reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff before the retry that follows `attempt` earlier retries
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Options for one Gateway connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayClientOptions {
    pub host: String,
    pub port: u16,
    /// Use `wss://` instead of `ws://`
    pub tls: bool,
    pub path: String,
    pub auth: Auth,
    /// Handshake and request deadline
    pub timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for GatewayClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18789,
            tls: false,
            path: "/".to_string(),
            auth: Auth::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl GatewayClientOptions {
    pub fn new(host: impl Into<String>, port: u16, auth: Auth) -> Self {
        Self {
            host: host.into(),
            port,
            auth,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// WebSocket URL of the Gateway
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, host, self.port, path)
    }
}
