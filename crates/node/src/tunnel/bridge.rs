//! HTTP-over-tunnel handler bridge.
//!
//! Inbound tunnel requests — whatever framing they arrived in — are
//! flattened to one abstract [`TunnelRequest`] and offered to the
//! user-registered handler. When the handler declines (or none is
//! registered), the built-in routes answer: `/ping` and `/status` are
//! always available so operators can probe a node that ships no
//! application handlers, and everything else is a JSON 404.
//!
//! Handlers run synchronously in the frame-delivery path and must return
//! promptly; slow work belongs on the host side of the callback.

use std::collections::BTreeMap;

/// Serialized response frames above this size are replaced by a minimal
/// 500 so the peer always receives *something* for its correlation id.
pub const RESPONSE_FRAME_BUDGET: usize = 2_048;

/// Abstract inbound request delivered to the handler.
#[derive(Clone, Debug)]
pub struct TunnelRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Handler verdict: status, content type, body bytes.
#[derive(Clone, Debug)]
pub struct TunnelResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl TunnelResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/json".into(),
            body: body.into().into_bytes(),
        }
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// User handler for inbound tunnel HTTP requests. Returning `None` means
/// "not handled" and falls through to the built-in routes.
pub trait RequestHandler: Send {
    fn handle(&self, request: &TunnelRequest) -> Option<TunnelResponse>;
}

impl<F> RequestHandler for F
where
    F: Fn(&TunnelRequest) -> Option<TunnelResponse> + Send,
{
    fn handle(&self, request: &TunnelRequest) -> Option<TunnelResponse> {
        self(request)
    }
}

/// Routes a request through the user handler, then the built-ins.
#[derive(Default)]
pub struct Bridge {
    handler: Option<Box<dyn RequestHandler>>,
}

impl Bridge {
    pub fn set_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    pub fn dispatch(
        &self,
        request: &TunnelRequest,
        uptime_ms: u64,
        node_id: Option<&str>,
    ) -> TunnelResponse {
        if let Some(handler) = &self.handler {
            if let Some(response) = handler.handle(request) {
                return response;
            }
        }
        builtin_routes(request, uptime_ms, node_id)
    }
}

fn builtin_routes(request: &TunnelRequest, uptime_ms: u64, node_id: Option<&str>) -> TunnelResponse {
    let path = request.path.to_ascii_lowercase();
    let is_get = request.method.eq_ignore_ascii_case("GET");
    if is_get && (path == "/ping" || path == "/api/ping") {
        return TunnelResponse::json(200, r#"{"ok":true}"#);
    }
    if is_get && (path == "/status" || path == "/api/status") {
        let body = serde_json::json!({
            "ok": true,
            "uptime_ms": uptime_ms,
            "node_id": node_id.unwrap_or(""),
        });
        return TunnelResponse::json(200, body.to_string());
    }
    TunnelResponse::json(404, r#"{"ok":false,"error":"not_found"}"#)
}
