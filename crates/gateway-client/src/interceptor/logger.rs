//! Traffic logging interceptor

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{ErrorContext, Interceptor, OutboundAction, Phase};
use crate::protocol::{GatewayEvent, InboundMessage, OutboundMessage};

const DEFAULT_MAX_BODY_LEN: usize = 500;

/// Logs one line per outbound request, inbound response, event, and error
pub struct LoggerInterceptor {
    verbose: bool,
    max_body_len: usize,
}

impl Default for LoggerInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerInterceptor {
    pub fn new() -> Self {
        Self {
            verbose: false,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }

    /// Include a truncated JSON body in every line
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    fn body<T: Serialize>(&self, value: &T) -> Option<String> {
        if !self.verbose {
            return None;
        }
        let json = serde_json::to_string(value).ok()?;
        Some(truncate(&json, self.max_body_len))
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[async_trait]
impl Interceptor for LoggerInterceptor {
    fn name(&self) -> &str {
        "logger"
    }

    async fn on_outbound(&self, msg: &OutboundMessage) -> anyhow::Result<OutboundAction> {
        match self.body(msg) {
            Some(body) => info!(target: "gateway_client::wire", id = %msg.id, method = %msg.method, %body, "→ request"),
            None => info!(target: "gateway_client::wire", id = %msg.id, method = %msg.method, "→ request"),
        }
        Ok(OutboundAction::Forward)
    }

    async fn on_inbound(&self, msg: &InboundMessage) -> anyhow::Result<Option<InboundMessage>> {
        let body = self.body(msg);
        match (&msg.error, body) {
            (Some(error), _) => warn!(
                target: "gateway_client::wire",
                id = %msg.id,
                code = %error.code,
                "← error response: {}",
                error.message
            ),
            (None, Some(body)) => info!(target: "gateway_client::wire", id = %msg.id, %body, "← response"),
            (None, None) => info!(target: "gateway_client::wire", id = %msg.id, "← response"),
        }
        Ok(None)
    }

    async fn on_event(&self, event: &GatewayEvent) -> anyhow::Result<()> {
        match self.body(event) {
            Some(body) => info!(target: "gateway_client::wire", event_type = %event.event_type, %body, "← event"),
            None => info!(target: "gateway_client::wire", event_type = %event.event_type, "← event"),
        }
        Ok(())
    }

    async fn on_error(&self, error: &anyhow::Error, ctx: &ErrorContext) -> anyhow::Result<()> {
        if ctx.phase == Phase::Halted {
            info!(
                target: "gateway_client::wire",
                interceptor = ctx.interceptor.as_deref().unwrap_or("-"),
                id = ctx.request_id.as_deref().unwrap_or("-"),
                method = ctx.method.as_deref().unwrap_or("-"),
                "request halted"
            );
            return Ok(());
        }
        warn!(
            target: "gateway_client::wire",
            phase = %ctx.phase,
            interceptor = ctx.interceptor.as_deref().unwrap_or("-"),
            id = ctx.request_id.as_deref().unwrap_or("-"),
            method = ctx.method.as_deref().unwrap_or("-"),
            "pipeline error: {}",
            error
        );
        Ok(())
    }
}
