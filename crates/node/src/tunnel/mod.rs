//! WebSocket tunnel plumbing.
//!
//! The persistent tunnel is the node's inbound request path: the Hub pushes
//! framed HTTP requests down it and the node answers in place. This module
//! holds the connection seam ([`TunnelConnector`] / [`TunnelLink`]), the
//! production `tokio-tungstenite` implementation, tunnel URL normalization,
//! and the per-connection [`TunnelState`] flags.
//!
//! The `disconnect_pending` flag is load-bearing: socket teardown never
//! happens inside frame handling. Handlers only set the flag; the next
//! `tick()` performs the teardown from the main-loop path, so the link is
//! never destroyed while its own event is on the stack.

pub mod bridge;
pub mod stream;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Keepalive cadence while registered.
pub const KEEPALIVE_INTERVAL_MS: u64 = 25_000;
/// Reconnect delay after a register skip or `MISSING_AUTH_TOKEN` refusal.
pub const AUTH_RETRY_DELAY_MS: u64 = 3_000;

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel URL is not usable: {0}")]
    BadUrl(String),
    #[error("tunnel connect failed: {0}")]
    Connect(String),
    #[error("tunnel send failed: {0}")]
    Send(String),
}

/// One inbound occurrence drained from the link.
#[derive(Clone, Debug)]
pub enum TunnelEvent {
    Text(String),
    Closed,
    Error(String),
}

/// An open tunnel connection.
#[async_trait]
pub trait TunnelLink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError>;
    /// Drains one pending inbound event without blocking; `None` when the
    /// socket has nothing ready.
    async fn poll_event(&mut self) -> Option<TunnelEvent>;
    async fn close(&mut self);
}

/// Factory seam so tests can hand the agent scripted links.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, url: &str, bearer: &str) -> Result<Box<dyn TunnelLink>, TunnelError>;
}

/// Per-connection flags. Reset wholesale on teardown.
#[derive(Clone, Debug, Default)]
pub struct TunnelState {
    pub connected: bool,
    pub register_frame_sent: bool,
    pub register_acked: bool,
    pub last_ping_sent_ms: u64,
    /// Set inside event/frame handling; consumed by the next `tick()`.
    pub disconnect_pending: bool,
    /// Overrides the backoff-derived reconnect time when set (auth paths
    /// reconnect on a fixed short delay).
    pub pending_reconnect_at: Option<u64>,
}

impl TunnelState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Normalizes a Hub-provided tunnel URL and extracts the host.
///
/// Accepts `wss://`, `ws://`, the sloppy `wss:host` form some Hub builds
/// emit, and a bare host (treated as `ws://`).
pub fn normalize_tunnel_url(raw: &str) -> Result<(String, String), TunnelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TunnelError::BadUrl("empty".into()));
    }
    let candidate = if trimmed.starts_with("wss://") || trimmed.starts_with("ws://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("wss:") {
        format!("wss://{}", rest.trim_start_matches('/'))
    } else if let Some(rest) = trimmed.strip_prefix("ws:") {
        format!("ws://{}", rest.trim_start_matches('/'))
    } else {
        format!("ws://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| TunnelError::BadUrl(err.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::BadUrl("missing host".into()))?
        .to_string();
    Ok((candidate, host))
}

// ════════════════════════════════════════════════════════════════════════════
// PRODUCTION CONNECTOR (tokio-tungstenite)
// ════════════════════════════════════════════════════════════════════════════

/// TLS knobs mirrored from the control-plane policy.
pub struct WsConnector {
    allow_insecure_tls: bool,
    root_ca_pem: Option<String>,
}

impl WsConnector {
    pub fn new(allow_insecure_tls: bool, root_ca_pem: Option<String>) -> Self {
        Self {
            allow_insecure_tls,
            root_ca_pem,
        }
    }

    fn tls_connector(&self) -> Result<native_tls::TlsConnector, TunnelError> {
        let mut builder = native_tls::TlsConnector::builder();
        if self.allow_insecure_tls {
            builder.danger_accept_invalid_certs(true);
        } else if let Some(pem) = &self.root_ca_pem {
            let anchor = native_tls::Certificate::from_pem(pem.as_bytes())
                .map_err(|err| TunnelError::Connect(err.to_string()))?;
            builder.add_root_certificate(anchor);
            builder.disable_built_in_roots(true);
        }
        builder
            .build()
            .map_err(|err| TunnelError::Connect(err.to_string()))
    }
}

#[async_trait]
impl TunnelConnector for WsConnector {
    async fn connect(&self, url: &str, bearer: &str) -> Result<Box<dyn TunnelLink>, TunnelError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| TunnelError::BadUrl(err.to_string()))?;
        if !bearer.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {bearer}"))
                .map_err(|err| TunnelError::BadUrl(err.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let connector = if url.starts_with("wss://") {
            Some(Connector::NativeTls(self.tls_connector()?))
        } else {
            None
        };

        let attempt =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
        let (ws, _response) = tokio::time::timeout(WS_CONNECT_TIMEOUT, attempt)
            .await
            .map_err(|_| TunnelError::Connect("connect timed out".into()))?
            .map_err(|err| TunnelError::Connect(err.to_string()))?;
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TunnelLink for WsLink {
    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|err| TunnelError::Send(err.to_string()))
    }

    async fn poll_event(&mut self) -> Option<TunnelEvent> {
        loop {
            match tokio::time::timeout(Duration::ZERO, self.ws.next()).await {
                Err(_) => return None,
                Ok(None) => return Some(TunnelEvent::Closed),
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(TunnelEvent::Text(text.to_string()))
                }
                Ok(Some(Ok(Message::Close(_)))) => return Some(TunnelEvent::Closed),
                // Pings are answered by tungstenite itself; binary frames
                // are not part of the protocol.
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(err))) => return Some(TunnelEvent::Error(err.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
