//! Interceptor pipeline
//!
//! Interceptors observe and transform traffic at four points: outbound
//! requests, inbound responses, pushed events, and errors. The chain runs
//! them in registration order and isolates their failures: a hook that
//! returns an error is reported to every `on_error` hook and the pipeline
//! continues with the last good message.

mod audit;
mod error_transformer;
mod logger;
mod telemetry;

pub use audit::{AuditInterceptor, AuditOutcome, AuditRecord, SENSITIVE_METHODS};
pub use error_transformer::ErrorTransformerInterceptor;
pub use logger::LoggerInterceptor;
pub use telemetry::{MethodMetrics, TelemetryInterceptor};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::{GatewayEvent, InboundMessage, OutboundMessage};

/// What an outbound hook wants done with the message
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Pass the message on unchanged
    Forward,
    /// Pass this message on instead
    Replace(OutboundMessage),
    /// Stop the pipeline; nothing is sent
    Halt,
}

/// Pipeline stage at which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Outbound,
    Inbound,
    Event,
    /// A request failed after it was sent (e.g. deadline elapsed)
    Request,
    /// An interceptor halted the request before it was sent
    Halted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
            Self::Event => "event",
            Self::Request => "request",
            Self::Halted => "halted",
        })
    }
}

/// Where an error reported to `on_error` came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub phase: Phase,
    /// Interceptor whose hook failed, if any
    pub interceptor: Option<String>,
    pub request_id: Option<String>,
    pub method: Option<String>,
}

impl ErrorContext {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            interceptor: None,
            request_id: None,
            method: None,
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>, method: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self.method = Some(method.into());
        self
    }

    fn with_interceptor(mut self, name: &str) -> Self {
        self.interceptor = Some(name.to_string());
        self
    }
}

/// A pipeline stage. Every hook is optional.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Stable identifier, used by [`InterceptorChain::remove`] and in logs
    fn name(&self) -> &str;

    async fn on_outbound(&self, _msg: &OutboundMessage) -> anyhow::Result<OutboundAction> {
        Ok(OutboundAction::Forward)
    }

    /// Return `Some` to replace the message, `None` to keep it
    async fn on_inbound(&self, _msg: &InboundMessage) -> anyhow::Result<Option<InboundMessage>> {
        Ok(None)
    }

    async fn on_event(&self, _event: &GatewayEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _error: &anyhow::Error, _ctx: &ErrorContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered, runtime-editable list of interceptors.
///
/// Each traversal works on a snapshot taken when it starts, so concurrent
/// `add`/`remove` calls are seen either entirely or not at all.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: RwLock::new(interceptors),
        }
    }

    /// Append an interceptor to the end of the chain
    pub async fn add(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.write().await.push(interceptor);
    }

    /// Remove the first interceptor with the given name
    pub async fn remove(&self, name: &str) -> bool {
        let mut interceptors = self.interceptors.write().await;
        match interceptors.iter().position(|i| i.name() == name) {
            Some(idx) => {
                interceptors.remove(idx);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.interceptors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.interceptors.read().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors.read().await.clone()
    }

    /// Run outbound hooks. `None` means an interceptor halted the message.
    ///
    /// A halt is reported to every `on_error` hook with [`Phase::Halted`],
    /// so interceptors that already saw the message can close it out.
    pub async fn process_outbound(&self, msg: OutboundMessage) -> Option<OutboundMessage> {
        let mut current = msg;
        for interceptor in self.snapshot().await {
            match interceptor.on_outbound(&current).await {
                Ok(OutboundAction::Forward) => {}
                Ok(OutboundAction::Replace(next)) => current = next,
                Ok(OutboundAction::Halt) => {
                    debug!(
                        interceptor = interceptor.name(),
                        id = %current.id,
                        method = %current.method,
                        "Outbound message halted"
                    );
                    let ctx = ErrorContext::new(Phase::Halted)
                        .with_request(current.id.clone(), current.method.clone())
                        .with_interceptor(interceptor.name());
                    let halted = anyhow::anyhow!("Halted by interceptor {}", interceptor.name());
                    self.process_error(&halted, &ctx).await;
                    return None;
                }
                Err(err) => {
                    let ctx = ErrorContext::new(Phase::Outbound)
                        .with_request(current.id.clone(), current.method.clone())
                        .with_interceptor(interceptor.name());
                    self.process_error(&err, &ctx).await;
                }
            }
        }
        Some(current)
    }

    /// Run inbound hooks; failing hooks leave the message as it was
    pub async fn process_inbound(&self, msg: InboundMessage) -> InboundMessage {
        let mut current = msg;
        for interceptor in self.snapshot().await {
            match interceptor.on_inbound(&current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {}
                Err(err) => {
                    let mut ctx = ErrorContext::new(Phase::Inbound).with_interceptor(interceptor.name());
                    ctx.request_id = Some(current.id.clone());
                    self.process_error(&err, &ctx).await;
                }
            }
        }
        current
    }

    /// Run every event hook, regardless of earlier failures
    pub async fn process_event(&self, event: &GatewayEvent) {
        for interceptor in self.snapshot().await {
            if let Err(err) = interceptor.on_event(event).await {
                let ctx = ErrorContext::new(Phase::Event).with_interceptor(interceptor.name());
                self.process_error(&err, &ctx).await;
            }
        }
    }

    /// Run every error hook. Failures inside error hooks are dropped.
    pub async fn process_error(&self, error: &anyhow::Error, ctx: &ErrorContext) {
        for interceptor in self.snapshot().await {
            if let Err(hook_err) = interceptor.on_error(error, ctx).await {
                warn!(
                    interceptor = interceptor.name(),
                    phase = %ctx.phase,
                    "Error hook failed: {}",
                    hook_err
                );
            }
        }
    }
}
