//! RAM-only credential stores.
//!
//! Three small stores with one shared rule: nothing here ever touches
//! persistent storage. A reboot always starts from empty and re-earns its
//! credentials through the protocol.
//!
//! - [`SessionCredentials`] — the short-lived bearer token and its expiry.
//! - [`PairingMaterial`] — the one-time pairing code from the Hello
//!   response.
//! - [`RegisteredNode`] — the Hub-issued node identity and tunnel
//!   coordinates. `node_id` is canonical only when the Hub assigned it;
//!   the node never invents one locally.

/// Short-lived session bearer credential, RAM only.
#[derive(Clone, Debug, Default)]
pub struct SessionCredentials {
    pub session_token: Option<String>,
    /// Wall-clock expiry string as the Hub sent it, kept for reporting.
    pub expires_at_wall: Option<String>,
    /// Local monotonic deadline; `None` means "no local enforcement" (the
    /// Hub is authoritative either way).
    pub expires_at_ms: Option<u64>,
}

impl SessionCredentials {
    pub fn is_valid(&self, now_ms: u64) -> bool {
        match (&self.session_token, self.expires_at_ms) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(deadline)) => now_ms < deadline,
        }
    }

    pub fn set_token(&mut self, token: String) {
        self.session_token = Some(token);
    }

    /// Refreshes the local deadline from a Hub-provided TTL.
    pub fn refresh_ttl(&mut self, now_ms: u64, ttl_seconds: u64) {
        self.expires_at_ms = Some(now_ms.saturating_add(ttl_seconds.saturating_mul(1_000)));
    }

    pub fn clear(&mut self) {
        self.session_token = None;
        self.expires_at_wall = None;
        self.expires_at_ms = None;
    }
}

/// One-time pairing code bridging an unauthenticated node to approval.
#[derive(Clone, Debug, Default)]
pub struct PairingMaterial {
    pub pairing_code: Option<String>,
    pub expires_at: Option<String>,
}

impl PairingMaterial {
    pub fn is_valid(&self) -> bool {
        self.pairing_code.is_some()
    }

    pub fn set(&mut self, code: String, expires_at: Option<String>) {
        self.pairing_code = Some(code);
        self.expires_at = expires_at;
    }

    pub fn clear(&mut self) {
        self.pairing_code = None;
        self.expires_at = None;
    }
}

/// Hub-issued node registration and tunnel coordinates.
#[derive(Clone, Debug, Default)]
pub struct RegisteredNode {
    pub node_id: Option<String>,
    pub node_auth_token: Option<String>,
    pub tunnel_url: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_host: Option<String>,
}
