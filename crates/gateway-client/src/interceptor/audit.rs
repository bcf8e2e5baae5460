//! Audit trail for state-changing Gateway calls

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use uuid::Uuid;

use super::{ErrorContext, Interceptor, OutboundAction, Phase};
use crate::protocol::{methods, InboundMessage, OutboundMessage};

/// Methods that produce audit records
pub const SENSITIVE_METHODS: &[&str] = &[
    methods::CONFIG_APPLY,
    methods::CONFIG_PATCH,
    methods::SEND,
    methods::AGENT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Requested,
    Success,
    Error,
    /// Stopped by an interceptor before it was sent
    Halted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default)]
    pub detail: Value,
}

/// Emits a record when a sensitive call is sent and a correlated record
/// when its response arrives
pub struct AuditInterceptor {
    actor: Option<String>,
    sink: Option<mpsc::UnboundedSender<AuditRecord>>,
    in_flight: Mutex<HashMap<String, String>>,
}

impl Default for AuditInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditInterceptor {
    pub fn new() -> Self {
        Self {
            actor: None,
            sink: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Forward every record to `sink` in addition to the log
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<AuditRecord>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn is_sensitive(method: &str) -> bool {
        SENSITIVE_METHODS.contains(&method)
    }

    fn emit(&self, request_id: &str, method: &str, outcome: AuditOutcome, detail: Value) {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            method: method.to_string(),
            outcome,
            actor: self.actor.clone(),
            detail,
        };

        info!(
            target: "gateway_client::audit",
            request_id = %record.request_id,
            method = %record.method,
            outcome = ?record.outcome,
            actor = record.actor.as_deref().unwrap_or("-"),
            "audit"
        );

        if let Some(sink) = &self.sink {
            let _ = sink.send(record);
        }
    }
}

#[async_trait]
impl Interceptor for AuditInterceptor {
    fn name(&self) -> &str {
        "audit"
    }

    async fn on_outbound(&self, msg: &OutboundMessage) -> anyhow::Result<OutboundAction> {
        if Self::is_sensitive(&msg.method) {
            self.in_flight
                .lock()
                .await
                .insert(msg.id.clone(), msg.method.clone());
            let detail = json!({ "params": msg.params.clone().unwrap_or(Value::Null) });
            self.emit(&msg.id, &msg.method, AuditOutcome::Requested, detail);
        }
        Ok(OutboundAction::Forward)
    }

    async fn on_inbound(&self, msg: &InboundMessage) -> anyhow::Result<Option<InboundMessage>> {
        let Some(method) = self.in_flight.lock().await.remove(&msg.id) else {
            return Ok(None);
        };
        match &msg.error {
            Some(error) => self.emit(
                &msg.id,
                &method,
                AuditOutcome::Error,
                json!({ "code": error.code, "message": error.message }),
            ),
            None => self.emit(&msg.id, &method, AuditOutcome::Success, Value::Null),
        }
        Ok(None)
    }

    async fn on_error(&self, error: &anyhow::Error, ctx: &ErrorContext) -> anyhow::Result<()> {
        let outcome = match ctx.phase {
            Phase::Request => AuditOutcome::Error,
            Phase::Halted => AuditOutcome::Halted,
            Phase::Outbound | Phase::Inbound | Phase::Event => return Ok(()),
        };
        let Some(id) = &ctx.request_id else {
            return Ok(());
        };
        let Some(method) = self.in_flight.lock().await.remove(id) else {
            return Ok(());
        };
        let detail = match outcome {
            AuditOutcome::Halted => json!({ "haltedBy": ctx.interceptor }),
            _ => json!({ "message": error.to_string() }),
        };
        self.emit(id, &method, outcome, detail);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorPayload;

    fn audited() -> (AuditInterceptor, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AuditInterceptor::new().with_sink(tx).with_actor("ops@fleet"), rx)
    }

    #[tokio::test]
    async fn test_sensitive_call_is_audited_on_both_legs() {
        let (audit, mut rx) = audited();

        let msg = OutboundMessage::new("req-1", "config.apply", Some(json!({"raw": "{}"})));
        audit.on_outbound(&msg).await.unwrap();
        audit
            .on_inbound(&InboundMessage::ok("req-1", json!({"ok": true})))
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.outcome, AuditOutcome::Requested);
        assert_eq!(sent.method, "config.apply");
        assert_eq!(sent.actor.as_deref(), Some("ops@fleet"));
        assert_eq!(sent.detail["params"]["raw"], "{}");

        let done = rx.recv().await.unwrap();
        assert_eq!(done.outcome, AuditOutcome::Success);
        assert_eq!(done.request_id, "req-1");
        assert_eq!(done.method, "config.apply");
    }

    #[tokio::test]
    async fn test_error_response_is_correlated() {
        let (audit, mut rx) = audited();

        audit
            .on_outbound(&OutboundMessage::new("req-2", "send", None))
            .await
            .unwrap();
        audit
            .on_inbound(&InboundMessage::err("req-2", ErrorPayload::new(-32004, "denied")))
            .await
            .unwrap();

        rx.recv().await.unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(done.outcome, AuditOutcome::Error);
        assert_eq!(done.method, "send");
        assert_eq!(done.detail["code"], -32004);
    }

    #[tokio::test]
    async fn test_read_only_calls_are_ignored() {
        let (audit, mut rx) = audited();

        audit
            .on_outbound(&OutboundMessage::new("req-3", "health", None))
            .await
            .unwrap();
        audit
            .on_inbound(&InboundMessage::ok("req-3", json!({})))
            .await
            .unwrap();

        drop(audit);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timed_out_call_closes_the_record() {
        let (audit, mut rx) = audited();

        audit
            .on_outbound(&OutboundMessage::new("req-4", "agent", None))
            .await
            .unwrap();
        let ctx = ErrorContext::new(Phase::Request).with_request("req-4", "agent");
        audit
            .on_error(&anyhow::anyhow!("agent timed out"), &ctx)
            .await
            .unwrap();

        rx.recv().await.unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(done.outcome, AuditOutcome::Error);
        assert_eq!(done.detail["message"], "agent timed out");
    }

    #[tokio::test]
    async fn test_halted_call_closes_the_record() {
        let (audit, mut rx) = audited();

        audit
            .on_outbound(&OutboundMessage::new("req-5", "config.patch", None))
            .await
            .unwrap();
        let mut ctx = ErrorContext::new(Phase::Halted).with_request("req-5", "config.patch");
        ctx.interceptor = Some("rate-limit".to_string());
        audit
            .on_error(&anyhow::anyhow!("halted"), &ctx)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().outcome, AuditOutcome::Requested);
        let done = rx.recv().await.unwrap();
        assert_eq!(done.outcome, AuditOutcome::Halted);
        assert_eq!(done.detail["haltedBy"], "rate-limit");
        assert!(audit.in_flight.lock().await.is_empty());
    }
}
