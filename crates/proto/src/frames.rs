//! Tunnel frame shapes and the inbound demultiplexer entry point.
//!
//! Frames are textual JSON. Outbound frames are typed structs serialized
//! with a literal `type` tag; inbound text is classified by
//! [`InboundFrame::parse`], which dispatches on the `type` key and falls
//! back to RPC-envelope detection (`id` + `path`, no `type` required).
//!
//! Inbound structs keep every field optional: the node must not drop the
//! connection over a missing key, it logs and ignores instead. Validation
//! of what is actually required (a correlation id, a direction tag) belongs
//! to the dispatch layer.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reason codes the Hub attaches to a refused tunnel registration.
pub mod reason {
    pub const MISSING_AUTH_TOKEN: &str = "MISSING_AUTH_TOKEN";
    pub const SLOT_ID_MISMATCH: &str = "SLOT_ID_MISMATCH";
    pub const SESSION_TOKEN_MISSING_SLOT_ID: &str = "SESSION_TOKEN_MISSING_SLOT_ID";
}

/// Segmented-stream transfer directions.
pub mod direction {
    /// Client-to-node: request bytes arriving from the Hub.
    pub const C2N: &str = "c2n";
    /// Node-to-client: response bytes leaving the node.
    pub const N2C: &str = "n2c";
}

/// Keepalive frame, sent verbatim.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encodes raw bytes for a `payload_base64` / proxy body field.
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a `payload_base64` / proxy body field.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, FrameError> {
    Ok(BASE64.decode(text.trim())?)
}

// ════════════════════════════════════════════════════════════════════════════
// OUTBOUND FRAMES
// ════════════════════════════════════════════════════════════════════════════

/// First frame on every tunnel connection; authenticates the node.
#[derive(Clone, Debug, Serialize)]
pub struct RegisterFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub slot_id: String,
    pub machine_id: String,
    pub mac: String,
    pub firmware: String,
    pub auth_token: String,
}

impl RegisterFrame {
    pub fn new(
        node_id: Option<String>,
        slot_id: String,
        machine_id: String,
        mac: String,
        firmware: String,
        auth_token: String,
    ) -> Self {
        Self {
            frame_type: "register",
            node_id,
            slot_id,
            machine_id,
            mac,
            firmware,
            auth_token,
        }
    }
}

/// Response to an `HTTP_REQ` frame. `stream_id` echoes the request verbatim.
#[derive(Clone, Debug, Serialize)]
pub struct HttpResFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub stream_id: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResFrame {
    pub fn new(stream_id: String, status: u16, content_type: &str, body: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        Self {
            frame_type: "HTTP_RES",
            stream_id,
            status,
            headers,
            body,
        }
    }
}

/// Response to a legacy `proxy_request` frame; body is base64.
#[derive(Clone, Debug, Serialize)]
pub struct ProxyResponseFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub request_id: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl ProxyResponseFrame {
    pub fn new(request_id: String, status_code: u16, content_type: &str, body: &[u8]) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        Self {
            frame_type: "proxy_response",
            request_id,
            status_code,
            headers,
            body: encode_payload(body),
        }
    }
}

/// Response to an RPC envelope. Carries no `type` tag, mirroring the request.
#[derive(Clone, Debug, Serialize)]
pub struct RpcResponseFrame {
    pub id: String,
    pub status: u16,
    pub body: Value,
}

/// Segmented-stream payload frame (node-to-client when `direction` is
/// [`direction::N2C`]).
#[derive(Clone, Debug, Serialize)]
pub struct DataFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub stream_id: String,
    pub direction: &'static str,
    pub payload_base64: String,
}

impl DataFrame {
    pub fn n2c(stream_id: String, payload: &[u8]) -> Self {
        Self {
            frame_type: "data",
            stream_id,
            direction: direction::N2C,
            payload_base64: encode_payload(payload),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// INBOUND FRAMES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegisterAck {
    pub status: Option<String>,
    pub reason: Option<String>,
    pub node_id: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_url: Option<String>,
}

impl RegisterAck {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HttpReq {
    pub stream_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProxyRequest {
    pub request_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    /// Base64-encoded request body.
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ControlCmd {
    pub cmd: Option<String>,
    pub stream_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DataIn {
    pub stream_id: Option<String>,
    pub direction: Option<String>,
    pub payload_base64: Option<String>,
}

/// Typeless RPC envelope: any object carrying both `id` and `path`.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcEnvelope {
    pub id: String,
    pub path: String,
    pub method: Option<String>,
    pub body: Option<Value>,
}

/// A classified inbound tunnel frame.
#[derive(Clone, Debug)]
pub enum InboundFrame {
    RegisterAck(RegisterAck),
    HttpReq(HttpReq),
    ProxyRequest(ProxyRequest),
    Control(ControlCmd),
    Data(DataIn),
    Rpc(RpcEnvelope),
    /// Unrecognized `type` tag (or an untyped object that is not an RPC
    /// envelope). Carries the tag for logging.
    Unknown(String),
}

impl InboundFrame {
    /// Classifies one inbound text frame.
    ///
    /// Known `type` tags win; an object without a recognized tag that
    /// carries both `id` and `path` is an RPC envelope; anything else is
    /// [`InboundFrame::Unknown`].
    pub fn parse(text: &str) -> Result<InboundFrame, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(FrameError::NotAnObject);
        }
        let tag = value.get("type").and_then(Value::as_str).map(str::to_owned);
        match tag.as_deref() {
            Some("register_ack") => Ok(InboundFrame::RegisterAck(serde_json::from_value(value)?)),
            Some("HTTP_REQ") => Ok(InboundFrame::HttpReq(serde_json::from_value(value)?)),
            Some("proxy_request") => Ok(InboundFrame::ProxyRequest(serde_json::from_value(value)?)),
            Some("control") => Ok(InboundFrame::Control(serde_json::from_value(value)?)),
            Some("data") => Ok(InboundFrame::Data(serde_json::from_value(value)?)),
            Some(other) => Ok(InboundFrame::Unknown(other.to_string())),
            None => {
                if value.get("id").is_some() && value.get("path").is_some() {
                    Ok(InboundFrame::Rpc(serde_json::from_value(value)?))
                } else {
                    Ok(InboundFrame::Unknown(String::new()))
                }
            }
        }
    }
}
