//! Error taxonomy for the gateway client.
//!
//! Connection problems are transient and retried by the session loop;
//! authentication and protocol failures during the handshake are fatal
//! and require operator intervention; timeouts always clean up after
//! themselves and never tear down the connection on their own.

use serde_json::Value;

#[derive(thiserror::Error, Debug, Clone)]
pub enum GatewayError {
    /// Transport unreachable, handshake timeout, or connection lost
    /// while waiting for a response.
    #[error("connection: {0}")]
    Connection(String),

    /// Credential or device proof rejected. Never retried.
    #[error("authentication: {0}")]
    Authentication(String),

    /// Malformed or version-incompatible exchange.
    #[error("protocol: {0}")]
    Protocol(String),

    /// An operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote agent run reported failure or an unrecognized
    /// terminal state.
    #[error("agent execution: {0}")]
    AgentExecution(String),

    /// Invalid client-side configuration.
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("serialization failed: {err}"))
    }
}

impl GatewayError {
    /// Whether the session retry loop must stop instead of reconnecting.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Authentication(_) | GatewayError::Protocol(_)
        )
    }
}

/// Extract human-readable text from a wire error value, which may be a
/// bare string or a `{code, message}` object.
fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(msg) => msg.to_owned(),
            None => error.to_string(),
        },
        Value::Null => "Unknown error".into(),
        other => other.to_string(),
    }
}

/// Classify a failed `connect` handshake response.
///
/// Heuristic substring matching on the gateway's error text; the
/// gateway has no structured error-code contract for the handshake yet,
/// so this mirrors what its current generations actually emit.
pub(crate) fn classify_handshake_error(error: &Value) -> GatewayError {
    let text = error_text(error);
    let lower = text.to_lowercase();
    if lower.contains("auth") || lower.contains("token") {
        GatewayError::Authentication(format!("authentication failed: {text}"))
    } else if lower.contains("nonce") || lower.contains("device") {
        GatewayError::Authentication(format!("device authentication failed: {text}"))
    } else {
        GatewayError::Protocol(format!("connection failed: {text}"))
    }
}

/// Classify a failed ordinary request/response exchange.
///
/// Newer gateways set a `code` on the error object; older ones only
/// provide free text, hence the substring fallbacks.
pub(crate) fn classify_request_error(error: &Value) -> GatewayError {
    let code = error.get("code").and_then(Value::as_str);
    let text = error_text(error);
    let lower = text.to_lowercase();

    let unauthorized = matches!(code, Some("UNAUTHORIZED" | "FORBIDDEN" | "AUTH_FAILED"))
        || lower.contains("missing scope")
        || lower.contains("invalid token")
        || lower.contains("authentication")
        || lower.contains("unauthorized");

    if unauthorized {
        GatewayError::Authentication(format!("request failed: {text}"))
    } else {
        GatewayError::Protocol(format!("request failed: {text}"))
    }
}
