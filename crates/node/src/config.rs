//! Node configuration.
//!
//! [`NodeConfig`] is immutable after construction: the agent copies it and
//! never mutates a field. Every string is owned — callers may drop or
//! reassign whatever backing storage they built the config from.
//!
//! Validation is deliberately thin. Only the two fields nothing can work
//! without (hub URL, slot id) are fatal; everything else has a usable
//! default from the table in the crate docs.

use thiserror::Error;
use url::Url;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("hub base URL is required")]
    MissingHubUrl,
    #[error("slot id is required")]
    MissingSlotId,
    #[error("hub base URL is not parseable: {0}")]
    InvalidHubUrl(String),
    #[error("TLS verification required but no root CA configured (set root_ca_pem or allow_insecure_tls)")]
    TlsPolicy,
}

/// Immutable node configuration. See the field table in `NodeConfig::new`
/// for defaults.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub hub_base_url: String,
    pub slot_id: String,
    pub firmware_version: String,
    /// Ordered capability list; hashed into the Hub-facing fingerprint.
    pub capabilities: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub allow_insecure_tls: bool,
    pub root_ca_pem: Option<String>,
    pub enable_tunnel: bool,
    /// When false, `is_registered` starts true and no registration path runs.
    pub enable_node_registration: bool,
    pub enable_command_polling: bool,
    /// Defaults to the heartbeat interval when unset.
    pub command_poll_interval_ms: Option<u64>,
    pub prefer_register_by_slot: bool,
    pub enable_self_approve: bool,
    pub approve_endpoint_path: String,
    pub session_endpoint_path: String,
    pub max_tunnel_body_bytes: usize,
    pub tunnel_reconnect_ms: u64,
    pub machine_id_prefix: String,
    pub node_name_prefix: String,
    pub append_unique_suffix: bool,
    pub use_mac_for_unique_id: bool,
    pub send_reconnect_hint_in_hello: bool,
    pub boot_reason: String,
    pub login_token: Option<String>,
    pub pairing_code: Option<String>,
    /// Sent as `X-Internal-Key` on the pairing exchange when present.
    pub internal_key: Option<String>,
    pub register_retry_ms: u64,
    pub approve_retry_ms: u64,
}

impl NodeConfig {
    /// A config with the two required fields and defaults for the rest.
    pub fn new(hub_base_url: impl Into<String>, slot_id: impl Into<String>) -> Self {
        Self {
            hub_base_url: hub_base_url.into(),
            slot_id: slot_id.into(),
            firmware_version: "1.0.0".into(),
            capabilities: Vec::new(),
            heartbeat_interval_ms: 5_000,
            allow_insecure_tls: false,
            root_ca_pem: None,
            enable_tunnel: false,
            enable_node_registration: false,
            enable_command_polling: false,
            command_poll_interval_ms: None,
            prefer_register_by_slot: false,
            enable_self_approve: false,
            approve_endpoint_path: "/api/device/approve".into(),
            session_endpoint_path: "/api/device/session".into(),
            max_tunnel_body_bytes: 4_096,
            tunnel_reconnect_ms: 5_000,
            machine_id_prefix: "node-".into(),
            node_name_prefix: "Node-".into(),
            append_unique_suffix: true,
            use_mac_for_unique_id: true,
            send_reconnect_hint_in_hello: false,
            boot_reason: "power_on".into(),
            login_token: None,
            pairing_code: None,
            internal_key: None,
            register_retry_ms: 2_000,
            approve_retry_ms: 5_000,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub_base_url.trim().is_empty() {
            return Err(ConfigError::MissingHubUrl);
        }
        if self.slot_id.trim().is_empty() {
            return Err(ConfigError::MissingSlotId);
        }
        Ok(())
    }

    pub fn command_poll_interval(&self) -> u64 {
        self.command_poll_interval_ms
            .unwrap_or(self.heartbeat_interval_ms)
    }
}

/// Parsed hub base URL: scheme, host, port and an optional path prefix that
/// is prepended to every endpoint path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl HubUrl {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|err| ConfigError::InvalidHubUrl(err.to_string()))?;
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::InvalidHubUrl(format!(
                "unsupported scheme `{scheme}`"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidHubUrl("missing host".into()))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let base_path = match url.path() {
            "/" => String::new(),
            path => path.trim_end_matches('/').to_string(),
        };
        Ok(Self {
            scheme,
            host,
            port,
            base_path,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Absolute URL for an endpoint path, honoring the base path prefix.
    pub fn endpoint(&self, path: &str) -> String {
        let default_port = if self.is_tls() { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}{}{}", self.scheme, self.host, self.base_path, path)
        } else {
            format!(
                "{}://{}:{}{}{}",
                self.scheme, self.host, self.port, self.base_path, path
            )
        }
    }

    /// Plain-HTTP variant of an endpoint, used by the TLS downgrade path.
    pub fn plain_endpoint(&self, path: &str) -> String {
        format!("http://{}{}{}", self.host, self.base_path, path)
    }

    /// Tunnel URL derived from the hub host when the Hub does not provide
    /// one: `wss://<host>/ws/tunnel`.
    pub fn derived_tunnel_url(&self) -> String {
        format!("wss://{}/ws/tunnel", self.host)
    }
}
