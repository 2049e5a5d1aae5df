//! Control-plane HTTP transport.
//!
//! One POST at a time (the agent enforces the busy flag), `Connection:
//! close`, JSON bodies, bounded response reads. The transport is a trait so
//! the protocol logic can be driven by a mock in tests; the production
//! implementation is a thin `reqwest` client.
//!
//! ## TLS policy
//!
//! - `allow_insecure_tls` — certificate verification is skipped.
//! - `root_ca_pem` — the provided PEM becomes the *sole* trust anchor.
//! - neither, over `https` — construction fails with a configuration
//!   error. A client that silently weakens its own policy is worse than one
//!   that refuses to start.
//!
//! ## TLS downgrade
//!
//! After two consecutive TLS connect failures the transport retries the
//! request once over plain HTTP on port 80. A success on either path resets
//! the failure counter. This mirrors deployments where an interception
//! middlebox breaks TLS but the Hub remains reachable in the clear.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ConfigError, HubUrl, NodeConfig};

/// Hard connect deadline per request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
/// Overall deadline covering first-byte wait (3 s), header parse (15 s) and
/// body read (15 s).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(33);

/// Response body cap for most endpoints.
pub const DEFAULT_BODY_CAP: usize = 2_048;
/// Larger cap for pair/approve, whose responses carry several tokens.
pub const LARGE_BODY_CAP: usize = 4_096;

/// TLS failures tolerated before the plain-HTTP downgrade attempt.
const TLS_FAILURES_BEFORE_DOWNGRADE: u32 = 2;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// A single control-plane POST.
#[derive(Clone, Debug)]
pub struct ControlRequest {
    /// Endpoint path, e.g. `/api/device/hello`. The transport prepends the
    /// hub base path.
    pub path: String,
    /// Serialized JSON body.
    pub body: String,
    pub bearer: Option<String>,
    pub internal_key: Option<String>,
    /// Response body cap; bytes beyond it are dropped, which is not by
    /// itself a failure.
    pub body_cap: usize,
}

/// Status and (possibly truncated) body of a completed exchange.
#[derive(Clone, Debug)]
pub struct ControlReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub truncated: bool,
}

impl ControlReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport seam between the protocol logic and the network.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn execute(&self, request: ControlRequest) -> Result<ControlReply, TransportError>;
}

/// Production transport over `reqwest`.
pub struct HttpControlTransport {
    hub: HubUrl,
    client: reqwest::Client,
    /// Separate verification-free client for the port-80 downgrade path.
    plain_client: reqwest::Client,
    consecutive_tls_failures: Mutex<u32>,
}

impl HttpControlTransport {
    pub fn new(hub: HubUrl, config: &NodeConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if hub.is_tls() {
            if config.allow_insecure_tls {
                builder = builder.danger_accept_invalid_certs(true);
            } else if let Some(pem) = &config.root_ca_pem {
                let anchor = reqwest::Certificate::from_pem(pem.as_bytes())
                    .map_err(|err| ConfigError::InvalidHubUrl(err.to_string()))?;
                builder = builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(anchor);
            } else {
                return Err(ConfigError::TlsPolicy);
            }
        }

        let client = builder
            .build()
            .map_err(|err| ConfigError::InvalidHubUrl(err.to_string()))?;
        let plain_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ConfigError::InvalidHubUrl(err.to_string()))?;

        Ok(Self {
            hub,
            client,
            plain_client,
            consecutive_tls_failures: Mutex::new(0),
        })
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        url: &str,
        request: &ControlRequest,
    ) -> Result<ControlReply, TransportError> {
        let mut builder = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONNECTION, "close")
            .body(request.body.clone());
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(key) = &request.internal_key {
            builder = builder.header("X-Internal-Key", key);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(classify)?;
        let truncated = bytes.len() > request.body_cap;
        let mut body = bytes.to_vec();
        body.truncate(request.body_cap);
        if truncated {
            tracing::debug!(url, cap = request.body_cap, "response body truncated");
        }
        Ok(ControlReply {
            status,
            body,
            truncated,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl ControlTransport for HttpControlTransport {
    async fn execute(&self, request: ControlRequest) -> Result<ControlReply, TransportError> {
        let url = self.hub.endpoint(&request.path);
        match self.post(&self.client, &url, &request).await {
            Ok(reply) => {
                *self.consecutive_tls_failures.lock() = 0;
                Ok(reply)
            }
            Err(err) => {
                if !self.hub.is_tls() || !matches!(err, TransportError::Connect(_)) {
                    return Err(err);
                }
                let failures = {
                    let mut guard = self.consecutive_tls_failures.lock();
                    *guard += 1;
                    *guard
                };
                if failures < TLS_FAILURES_BEFORE_DOWNGRADE {
                    return Err(err);
                }
                let plain_url = self.hub.plain_endpoint(&request.path);
                tracing::warn!(url = %plain_url, "TLS failing repeatedly, retrying over plain HTTP");
                let reply = self.post(&self.plain_client, &plain_url, &request).await?;
                *self.consecutive_tls_failures.lock() = 0;
                Ok(reply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig::new("https://hub.example", "s1")
    }

    #[test]
    fn test_tls_without_anchor_or_insecure_is_refused() {
        let hub = HubUrl::parse("https://hub.example").unwrap();
        let err = HttpControlTransport::new(hub, &config()).err().unwrap();
        assert_eq!(err, ConfigError::TlsPolicy);
    }

    #[test]
    fn test_insecure_flag_permits_tls() {
        let hub = HubUrl::parse("https://hub.example").unwrap();
        let mut cfg = config();
        cfg.allow_insecure_tls = true;
        assert!(HttpControlTransport::new(hub, &cfg).is_ok());
    }

    #[test]
    fn test_plain_http_needs_no_tls_policy() {
        let hub = HubUrl::parse("http://hub.example").unwrap();
        assert!(HttpControlTransport::new(hub, &config()).is_ok());
    }

    #[test]
    fn test_reply_success_range() {
        let reply = ControlReply {
            status: 204,
            body: Vec::new(),
            truncated: false,
        };
        assert!(reply.is_success());
        let reply = ControlReply {
            status: 403,
            body: Vec::new(),
            truncated: false,
        };
        assert!(!reply.is_success());
    }
}
