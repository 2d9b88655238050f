//! Gateway wire protocol: message frames, connect/agent parameters, and
//! client identification constants.
//!
//! The gateway speaks JSON objects over a persistent WebSocket. Every
//! message carries a `type` discriminator: `req` and `res` form the
//! request/response pairs (correlated by `id`), `event` carries
//! server-pushed notifications, and `ping`/`pong` are application-level
//! heartbeats.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version bounds advertised in the `connect` handshake.
pub const PROTOCOL_MIN_VERSION: u32 = 3;
pub const PROTOCOL_MAX_VERSION: u32 = 3;

/// Client identification reported to the gateway.
pub const CLIENT_ID: &str = "gateway-client";
pub const CLIENT_DISPLAY_NAME: &str = "OpenClaw Gateway Client";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CLIENT_PLATFORM: &str = "rust";
pub const CLIENT_MODE: &str = "backend";
pub const CLIENT_LOCALE: &str = "en-US";

/// Role and scopes requested when presenting a device auth proof.
pub const DEVICE_ROLE: &str = "operator";
pub const DEVICE_SCOPES: [&str; 2] = ["operator.read", "operator.write"];

/// Event name of the unsolicited handshake challenge.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";

// ── Frames ───────────────────────────────────────────────────────────

/// Top-level wire frame.
///
/// Unknown `type` values fail to deserialize; the receive loop logs and
/// drops them rather than terminating the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Req(RequestFrame),
    #[serde(rename = "res")]
    Res(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl Frame {
    /// The wire `type` tag, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Req(_) => "req",
            Frame::Res(_) => "res",
            Frame::Event(_) => "event",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }
}

/// Client → Gateway request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestFrame {
    /// Build a request with a fresh UUID identifier.
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Gateway → Client response, correlated to a request by `id`.
///
/// `error` is either a bare string or an object with `code`/`message`,
/// depending on gateway generation, so it stays a raw JSON value here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub error: serde_json::Value,
}

/// Gateway → Client server-pushed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ── Connect handshake ────────────────────────────────────────────────

/// Parameters of the `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub caps: Vec<String>,
    pub locale: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

/// Client identity block inside the connect params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl ClientInfo {
    /// Identity block for this client build.
    pub fn this_client() -> Self {
        Self {
            id: CLIENT_ID.into(),
            display_name: CLIENT_DISPLAY_NAME.into(),
            version: CLIENT_VERSION.into(),
            platform: CLIENT_PLATFORM.into(),
            mode: CLIENT_MODE.into(),
        }
    }
}

/// Bearer credential block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

/// Signed device identity proof, answering a `connect.challenge` nonce.
///
/// `public_key` and `signature` are base64url without padding; `id` is
/// the hex SHA-256 of the raw public key; `signed_at` is wall-clock
/// epoch milliseconds at signing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    pub nonce: String,
}

// ── Agent runs ───────────────────────────────────────────────────────

/// Parameters of the `agent` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams {
    pub message: String,
    pub session_key: String,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<AgentOptions>,
}

/// Optional per-run overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl AgentOptions {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.thinking.is_none()
    }
}

/// Payload of an `agent` event. Text may arrive in `output` or in
/// `data.text`; completion is signalled by `status` (`ok`/`error`) or
/// by a terminal `data.phase` (`end`/`complete`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub data: AgentEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentEventData {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

impl AgentEventPayload {
    /// The text carried by this event, preferring `output` over `data.text`.
    pub fn text(&self) -> Option<&str> {
        self.output
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.data.text.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_is_bare() {
        let json = serde_json::to_string(&Frame::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        let back: Frame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(back, Frame::Pong));
    }

    #[test]
    fn response_error_can_be_string_or_object() {
        let s: Frame =
            serde_json::from_str(r#"{"type":"res","id":"1","ok":false,"error":"Invalid token"}"#)
                .unwrap();
        let Frame::Res(res) = s else { panic!("expected res") };
        assert_eq!(res.error, json!("Invalid token"));

        let o: Frame = serde_json::from_str(
            r#"{"type":"res","id":"2","ok":false,"error":{"code":"FORBIDDEN","message":"no"}}"#,
        )
        .unwrap();
        let Frame::Res(res) = o else { panic!("expected res") };
        assert_eq!(res.error["code"], "FORBIDDEN");
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        assert!(serde_json::from_str::<Frame>(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn connect_params_use_wire_field_names() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_MIN_VERSION,
            max_protocol: PROTOCOL_MAX_VERSION,
            client: ClientInfo::this_client(),
            caps: vec![],
            locale: CLIENT_LOCALE.into(),
            user_agent: format!("{CLIENT_DISPLAY_NAME}/{CLIENT_VERSION}"),
            auth: Some(AuthParams { token: "t".into() }),
            role: None,
            scopes: None,
            device: None,
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["minProtocol"], 3);
        assert_eq!(v["client"]["displayName"], CLIENT_DISPLAY_NAME);
        assert_eq!(v["auth"]["token"], "t");
        // Absent option fields must not appear on the wire.
        assert!(v.get("device").is_none());
        assert!(v.get("role").is_none());
        assert!(v.get("scopes").is_none());
    }

    #[test]
    fn agent_event_prefers_output_over_data_text() {
        let p: AgentEventPayload = serde_json::from_value(json!({
            "runId": "run-1",
            "output": "full",
            "data": {"text": "partial", "phase": "delta"}
        }))
        .unwrap();
        assert_eq!(p.text(), Some("full"));
        assert_eq!(p.data.phase.as_deref(), Some("delta"));

        let p: AgentEventPayload = serde_json::from_value(json!({
            "runId": "run-1",
            "data": {"text": "partial"}
        }))
        .unwrap();
        assert_eq!(p.text(), Some("partial"));
    }

    #[test]
    fn device_auth_serializes_camel_case() {
        let d = DeviceAuth {
            id: "a".repeat(64),
            public_key: "pk".into(),
            signature: "sig".into(),
            signed_at: 1_700_000_000_000,
            nonce: "n".into(),
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["publicKey"], "pk");
        assert_eq!(v["signedAt"], 1_700_000_000_000i64);
    }
}
