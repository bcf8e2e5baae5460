//! Rewrites numeric Gateway error codes into readable messages

use std::collections::HashMap;

use async_trait::async_trait;

use super::Interceptor;
use crate::protocol::{error_codes, InboundMessage, OriginalError};

fn default_messages() -> HashMap<i64, String> {
    [
        (error_codes::PARSE_ERROR, "The Gateway could not parse the request"),
        (error_codes::INVALID_REQUEST, "The request was malformed"),
        (error_codes::METHOD_NOT_FOUND, "The Gateway does not support this method"),
        (error_codes::INVALID_PARAMS, "The request parameters were rejected"),
        (error_codes::INTERNAL_ERROR, "The Gateway hit an internal error"),
        (error_codes::UNAVAILABLE, "The Gateway is unavailable"),
        (error_codes::NOT_CONNECTED, "The Gateway is not connected"),
        (error_codes::REQUEST_TIMEOUT, "The Gateway timed out handling the request"),
        (error_codes::UNAUTHORIZED, "Authentication with the Gateway failed"),
        (error_codes::FORBIDDEN, "The operation is not permitted"),
        (error_codes::RATE_LIMITED, "Too many requests; try again later"),
        (error_codes::AGENT_BUSY, "The agent is busy with another run"),
        (error_codes::CONFIG_CONFLICT, "The configuration changed since it was read"),
    ]
    .into_iter()
    .map(|(code, message)| (code, message.to_string()))
    .collect()
}

/// Maps known error codes on inbound error frames to readable messages,
/// keeping the untranslated `{code, message}` under `originalError`
pub struct ErrorTransformerInterceptor {
    messages: HashMap<i64, String>,
}

impl Default for ErrorTransformerInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTransformerInterceptor {
    pub fn new() -> Self {
        Self {
            messages: default_messages(),
        }
    }

    /// Defaults plus overrides; an override replaces the default for its code
    pub fn with_overrides(overrides: HashMap<i64, String>) -> Self {
        let mut messages = default_messages();
        messages.extend(overrides);
        Self { messages }
    }

    pub fn message_for(&self, code: i64) -> Option<&str> {
        self.messages.get(&code).map(String::as_str)
    }
}

#[async_trait]
impl Interceptor for ErrorTransformerInterceptor {
    fn name(&self) -> &str {
        "error-transformer"
    }

    async fn on_inbound(&self, msg: &InboundMessage) -> anyhow::Result<Option<InboundMessage>> {
        let Some(error) = &msg.error else {
            return Ok(None);
        };
        let Some(readable) = error.code.as_i64().and_then(|code| self.message_for(code)) else {
            return Ok(None);
        };

        let mut next = msg.clone();
        if let Some(translated) = next.error.as_mut() {
            translated.original_error = Some(OriginalError {
                code: error.code.clone(),
                message: error.message.clone(),
            });
            translated.message = readable.to_string();
        }
        Ok(Some(next))
    }
}
