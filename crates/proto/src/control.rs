//! Control-plane request and response bodies.
//!
//! Every exchange is a JSON POST. The Hub has grown alternative spellings
//! for several response keys (`pairing_code`/`pairing`/`code`,
//! `node_id`/`canonical_node_id`/`resolved_node_id`, ...); those are folded
//! into one field each with `#[serde(alias)]` so callers never see the
//! variance.
//!
//! Response types deserialize leniently: unknown keys are ignored and most
//! fields are optional, because the node must keep running against older and
//! newer Hub builds alike. Request types serialize only the fields that are
//! set (`skip_serializing_if`), keeping bodies small.

use serde::{Deserialize, Serialize};

/// Hello / session / heartbeat status strings returned by the Hub.
pub mod status {
    pub const PENDING: &str = "PENDING";
    pub const APPROVED: &str = "APPROVED";
    pub const DENIED: &str = "DENIED";
    pub const GRANTED: &str = "GRANTED";
}

/// Default retry cadence the Hub implies when `retry_after_ms` is absent.
pub const DEFAULT_RETRY_AFTER_MS: u64 = 3000;

/// Device descriptor embedded in hello and pair requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mac: String,
    pub platform: String,
}

// ── /api/device/hello ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct HelloRequest {
    pub slot_id: String,
    pub nonce: String,
    pub firmware: String,
    pub capabilities_hash: String,
    pub device_info: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HelloResponse {
    pub status: Option<String>,
    pub retry_after_ms: Option<u64>,
    /// Pairing code; the Hub has shipped this as `pairing_code`, `pairing`
    /// and bare `code`.
    #[serde(alias = "pairing", alias = "code")]
    pub pairing_code: Option<String>,
    #[serde(alias = "expires_at")]
    pub pairing_expires_at: Option<String>,
}

// ── /api/device/pair ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct PairRequest {
    pub slot_id: String,
    pub pairing_code: String,
    pub firmware: String,
    pub device_info: DeviceInfo,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PairResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(alias = "canonical_node_id", alias = "resolved_node_id")]
    pub node_id: Option<String>,
    pub session_token: Option<String>,
    pub node_token: Option<String>,
    pub tunnel_url: Option<String>,
}

// ── /api/device/approve ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct ApproveRequest {
    pub slot_id: String,
    pub pairing_code: String,
    pub mac: String,
    pub machine_id: String,
    pub firmware: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApproveResponse {
    pub status: Option<String>,
    pub session_token: Option<String>,
    pub expires_at: Option<String>,
    #[serde(alias = "node_token")]
    pub register_token: Option<String>,
    pub tunnel_url: Option<String>,
    #[serde(alias = "canonical_node_id")]
    pub node_id: Option<String>,
}

// ── /api/device/session ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct SessionRequest {
    pub slot_id: String,
    pub nonce: String,
    /// Present only on a session-refresh attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionResponse {
    pub status: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub session_token: Option<String>,
    pub tunnel_url: Option<String>,
    #[serde(alias = "session_expires_at")]
    pub expires_at: Option<String>,
    pub ttl_seconds: Option<u64>,
}

// ── /api/device/heartbeat ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct HeartbeatRequest {
    pub slot_id: String,
    pub nonce: String,
    pub firmware: String,
    pub uptime_ms: u64,
    pub rssi: i32,
    pub free_heap: u64,
    pub capabilities_hash: String,
    pub led_state: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HeartbeatResponse {
    pub ttl_seconds: Option<u64>,
}

// ── /api/device/commands/* ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct CommandsPullRequest {
    pub slot_id: String,
    pub nonce: String,
}

/// A single queued command. Action-specific payload keys are collected in
/// `extra` untouched; interpretation is the application's concern.
#[derive(Clone, Debug, Deserialize)]
pub struct Command {
    pub id: String,
    pub action: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CommandsPullResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandAckRequest {
    pub slot_id: String,
    pub command_id: String,
    pub nonce: String,
    pub status: String,
}

// ── /api/nodes/register_by_slot ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct RegisterBySlotRequest {
    pub slot_id: String,
    pub login_token: String,
    pub machine_id: String,
    pub node_name: String,
    pub platform: String,
    pub agent_version: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegisterBySlotResponse {
    pub node_id: Option<String>,
    pub node_auth_token: Option<String>,
    pub tunnel_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_response_accepts_all_pairing_keys() {
        for key in ["pairing_code", "pairing", "code"] {
            let raw = format!(r#"{{"status":"PENDING","{key}":"ABC"}}"#);
            let resp: HelloResponse = serde_json::from_str(&raw).unwrap();
            assert_eq!(resp.pairing_code.as_deref(), Some("ABC"), "key {key}");
        }
    }

    #[test]
    fn test_hello_response_expiry_alias() {
        let resp: HelloResponse =
            serde_json::from_str(r#"{"status":"PENDING","expires_at":"2026-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(
            resp.pairing_expires_at.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_pair_response_node_id_aliases() {
        for key in ["node_id", "canonical_node_id", "resolved_node_id"] {
            let raw = format!(r#"{{"ok":true,"{key}":"n1"}}"#);
            let resp: PairResponse = serde_json::from_str(&raw).unwrap();
            assert!(resp.ok);
            assert_eq!(resp.node_id.as_deref(), Some("n1"), "key {key}");
        }
    }

    #[test]
    fn test_pair_response_ok_defaults_false() {
        let resp: PairResponse = serde_json::from_str("{}").unwrap();
        assert!(!resp.ok);
    }

    #[test]
    fn test_hello_request_omits_unset_hints() {
        let req = HelloRequest {
            slot_id: "s1".into(),
            nonce: "0a1b2c3d".into(),
            firmware: "1.0.0".into(),
            capabilities_hash: "00000000".into(),
            device_info: DeviceInfo {
                mac: "aa:bb".into(),
                platform: "linux".into(),
            },
            reconnect: None,
            boot_reason: None,
        };
        let raw = serde_json::to_string(&req).unwrap();
        assert!(!raw.contains("reconnect"));
        assert!(!raw.contains("boot_reason"));
    }

    #[test]
    fn test_commands_pull_collects_extra_keys() {
        let resp: CommandsPullResponse = serde_json::from_str(
            r#"{"commands":[{"id":"c1","action":"reboot","delay_ms":250}]}"#,
        )
        .unwrap();
        assert_eq!(resp.commands.len(), 1);
        let cmd = &resp.commands[0];
        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.action, "reboot");
        assert_eq!(cmd.extra.get("delay_ms").and_then(|v| v.as_u64()), Some(250));
    }

    #[test]
    fn test_approve_response_register_token_alias() {
        let resp: ApproveResponse =
            serde_json::from_str(r#"{"status":"granted","node_token":"nt"}"#).unwrap();
        assert_eq!(resp.register_token.as_deref(), Some("nt"));
    }
}
