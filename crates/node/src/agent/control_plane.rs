//! Control-plane exchanges: hello, pair, approve, session poll,
//! register-by-slot, heartbeat and command polling.
//!
//! Every method here fires at most one POST (command polling additionally
//! acks what it pulled, per the pull-then-ack contract), interprets the
//! response, and reschedules itself — success on the natural cadence,
//! failure on the owning backoff. Auth rejections (401/403/410) always
//! drop the session and fall back to Hello.

use hublink_proto::control::{
    status, ApproveRequest, ApproveResponse, CommandAckRequest, CommandsPullRequest,
    CommandsPullResponse, DeviceInfo, HeartbeatRequest, HeartbeatResponse, HelloRequest,
    HelloResponse, PairRequest, PairResponse, RegisterBySlotRequest, RegisterBySlotResponse,
    SessionRequest, SessionResponse, DEFAULT_RETRY_AFTER_MS,
};

use super::{encode_json, NodeAgent};
use crate::control::{ControlReply, ControlRequest, TransportError, DEFAULT_BODY_CAP, LARGE_BODY_CAP};
use crate::identity::capabilities_hash;
use crate::state::SessionState;

/// Eight random hex digits; unique per call with overwhelming probability.
pub(crate) fn create_nonce() -> String {
    format!("{:08x}", rand::random::<u32>())
}

impl NodeAgent {
    /// Single-flight POST. Returns `None` when another exchange is already
    /// in flight (the busy flag is authoritative; callers back off to the
    /// next tick).
    async fn post_control(
        &mut self,
        path: &str,
        body: String,
        bearer: Option<String>,
        internal_key: Option<String>,
        body_cap: usize,
    ) -> Option<Result<ControlReply, TransportError>> {
        if self.http_busy {
            return None;
        }
        self.http_busy = true;
        let result = self
            .transport
            .execute(ControlRequest {
                path: path.to_string(),
                body,
                bearer,
                internal_key,
                body_cap,
            })
            .await;
        self.http_busy = false;
        Some(result)
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            mac: self.identity.mac.clone(),
            platform: self.identity.platform.clone(),
        }
    }

    fn parse_body<T: serde::de::DeserializeOwned>(reply: &ControlReply) -> Option<T> {
        serde_json::from_slice(&reply.body).ok()
    }

    // ── hello ───────────────────────────────────────────────────────────

    pub(crate) async fn send_hello(&mut self, now: u64) {
        let hint = self.config.send_reconnect_hint_in_hello;
        let request = HelloRequest {
            slot_id: self.config.slot_id.clone(),
            nonce: create_nonce(),
            firmware: self.config.firmware_version.clone(),
            capabilities_hash: capabilities_hash(&self.config.capabilities),
            device_info: self.device_info(),
            reconnect: hint.then_some(true),
            boot_reason: hint.then(|| self.config.boot_reason.clone()),
        };
        let Some(result) = self
            .post_control(
                "/api/device/hello",
                encode_json(&request),
                None,
                None,
                DEFAULT_BODY_CAP,
            )
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("hello transport failure: {err}"));
                self.schedule_net_retry(now);
                return;
            }
        };

        match reply.status {
            200..=299 => self.handle_hello_ok(now, &reply),
            401 => {
                self.last_error.set("hello unauthorized");
                self.schedule_net_retry(now);
            }
            403 => {
                // Web-auth failure; backed off like any other rejection, no
                // tight retry loop.
                self.last_error.set("hello rejected by web auth");
                self.schedule_net_retry(now);
            }
            410 => {
                self.pairing.clear();
                self.invalidate_session();
                self.last_error.set("hello says pairing is gone");
                self.schedule_net_retry(now);
            }
            code => {
                self.last_error.set(format!("hello HTTP {code}"));
                self.schedule_net_retry(now);
            }
        }
    }

    fn handle_hello_ok(&mut self, now: u64, reply: &ControlReply) {
        let Some(response) = Self::parse_body::<HelloResponse>(reply) else {
            self.last_error.set("hello response unparsable");
            self.schedule_net_retry(now);
            return;
        };
        match response.status.as_deref() {
            Some(status::DENIED) => {
                self.last_error.set("hub denied hello");
                self.state.set(SessionState::Error);
                self.schedule_net_retry(now);
            }
            Some(status::PENDING) | Some(status::APPROVED) => {
                if let Some(code) = response.pairing_code.clone() {
                    self.pairing.set(code, response.pairing_expires_at.clone());
                }
                let retry = response.retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS);
                if self.pairing.is_valid() && !self.config.enable_self_approve {
                    self.state.set(SessionState::PairSubmit);
                    self.next_net_action_ms = now;
                } else {
                    self.state.set(SessionState::PendingPoll);
                    self.next_net_action_ms = now + retry;
                    self.next_approve_action_ms = now;
                }
                self.net_backoff.reset();
                self.last_error.clear();
            }
            _ => {
                self.last_error.set("hello status missing or unknown");
                self.schedule_net_retry(now);
            }
        }
    }

    // ── pair submission ─────────────────────────────────────────────────

    pub(crate) async fn submit_pair(&mut self, now: u64) {
        let Some(code) = self.pairing.pairing_code.clone() else {
            self.pair_failure(now, "pairing code missing for pair submit");
            return;
        };
        let request = PairRequest {
            slot_id: self.config.slot_id.clone(),
            pairing_code: code,
            firmware: self.config.firmware_version.clone(),
            device_info: self.device_info(),
        };
        let Some(result) = self
            .post_control(
                "/api/device/pair",
                encode_json(&request),
                None,
                self.config.internal_key.clone(),
                LARGE_BODY_CAP,
            )
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.pair_failure(now, &format!("pair transport failure: {err}"));
                return;
            }
        };
        if !reply.is_success() {
            self.pair_failure(now, &format!("pair HTTP {}", reply.status));
            return;
        }
        let Some(response) = Self::parse_body::<PairResponse>(&reply) else {
            self.pair_failure(now, "pair response unparsable");
            return;
        };
        let has_token = response.session_token.is_some() || response.node_token.is_some();
        if !response.ok || response.node_id.is_none() || !has_token {
            self.pair_failure(now, "pair refused or incomplete");
            return;
        }

        if let Some(token) = response.session_token {
            self.session.set_token(token);
        }
        self.record_registration(response.node_id, response.node_token, response.tunnel_url);
        self.pairing.clear();
        self.pair_backoff.reset();
        tracing::info!(node_id = ?self.node.node_id, "paired with hub");
        self.go_active(now);
    }

    fn pair_failure(&mut self, now: u64, message: &str) {
        self.last_error.set(message);
        self.pairing.clear();
        let delay = self.pair_backoff.advance();
        self.enter_hello(now, delay);
    }

    // ── self-approve ────────────────────────────────────────────────────

    pub(crate) async fn self_approve(&mut self, now: u64) {
        let Some(code) = self.pairing.pairing_code.clone() else {
            self.next_approve_action_ms = now + self.config.approve_retry_ms;
            return;
        };
        let request = ApproveRequest {
            slot_id: self.config.slot_id.clone(),
            pairing_code: code,
            mac: self.identity.mac.clone(),
            machine_id: self.identity.machine_id.clone(),
            firmware: self.config.firmware_version.clone(),
        };
        let path = self.config.approve_endpoint_path.clone();
        let Some(result) = self
            .post_control(&path, encode_json(&request), None, None, LARGE_BODY_CAP)
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("approve transport failure: {err}"));
                self.next_approve_action_ms = now + self.config.approve_retry_ms;
                return;
            }
        };

        match reply.status {
            200..=299 => self.handle_approve_ok(now, &reply),
            400 => {
                let body = String::from_utf8_lossy(&reply.body);
                if body.contains("missing_mac") {
                    // Permanent for this process: the platform cannot
                    // produce a MAC the Hub will accept.
                    self.approve_missing_mac_failed = true;
                    self.last_error.set("approve requires a MAC this device cannot provide");
                } else {
                    self.last_error.set("approve HTTP 400");
                    self.next_approve_action_ms = now + self.config.approve_retry_ms;
                }
            }
            401 | 403 | 410 => {
                self.last_error.set(format!("approve auth rejected ({})", reply.status));
                self.invalidate_session();
                self.pairing.clear();
                let delay = self.net_backoff.advance();
                self.enter_hello(now, delay);
            }
            code => {
                self.last_error.set(format!("approve HTTP {code}"));
                self.next_approve_action_ms = now + self.config.approve_retry_ms;
            }
        }
    }

    fn handle_approve_ok(&mut self, now: u64, reply: &ControlReply) {
        let Some(response) = Self::parse_body::<ApproveResponse>(reply) else {
            self.last_error.set("approve response unparsable");
            self.next_approve_action_ms = now + self.config.approve_retry_ms;
            return;
        };
        if response.session_token.is_none() && response.register_token.is_none() {
            self.last_error.set("approve response carried no tokens");
            self.next_approve_action_ms = now + self.config.approve_retry_ms;
            return;
        }
        if let Some(token) = response.session_token {
            self.session.set_token(token);
        }
        self.session.expires_at_wall = response.expires_at;
        self.record_registration(response.node_id, response.register_token, response.tunnel_url);
        self.pairing.clear();
        tracing::info!(node_id = ?self.node.node_id, "self-approve granted");
        self.go_active(now);
    }

    // ── session poll / refresh ──────────────────────────────────────────

    pub(crate) async fn poll_session(&mut self, now: u64, refresh: bool) {
        let request = SessionRequest {
            slot_id: self.config.slot_id.clone(),
            nonce: create_nonce(),
            session_token: if refresh {
                self.session.session_token.clone()
            } else {
                None
            },
        };
        let path = self.config.session_endpoint_path.clone();
        let Some(result) = self
            .post_control(&path, encode_json(&request), None, None, DEFAULT_BODY_CAP)
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("session transport failure: {err}"));
                self.schedule_net_retry(now);
                return;
            }
        };

        match reply.status {
            200..=299 => self.handle_session_ok(now, &reply),
            401 | 403 | 410 => {
                self.last_error.set(format!("session auth rejected ({})", reply.status));
                self.invalidate_session();
                self.pairing.clear();
                let delay = self.net_backoff.advance();
                self.enter_hello(now, delay);
            }
            code => {
                self.last_error.set(format!("session HTTP {code}"));
                self.schedule_net_retry(now);
            }
        }
    }

    fn handle_session_ok(&mut self, now: u64, reply: &ControlReply) {
        let Some(response) = Self::parse_body::<SessionResponse>(reply) else {
            self.last_error.set("session response unparsable");
            self.schedule_net_retry(now);
            return;
        };
        match response.status.as_deref() {
            Some(status::GRANTED) => {
                if let Some(token) = response.session_token {
                    self.session.set_token(token);
                }
                if self.session.session_token.is_none() {
                    self.last_error.set("session granted without a token");
                    self.schedule_net_retry(now);
                    return;
                }
                self.session.expires_at_wall = response.expires_at;
                if let Some(ttl) = response.ttl_seconds {
                    self.session.refresh_ttl(now, ttl);
                }
                if let Some(url) = response.tunnel_url {
                    self.node.tunnel_url = Some(url);
                }
                tracing::info!("session granted");
                self.go_active(now);
            }
            Some(status::PENDING) => {
                self.state.set(SessionState::PendingPoll);
                self.next_net_action_ms =
                    now + response.retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS);
            }
            Some(status::DENIED) => {
                self.last_error.set("hub denied session");
                self.invalidate_session();
                self.state.set(SessionState::Error);
                self.schedule_net_retry(now);
            }
            _ => {
                self.last_error.set("session status missing or unknown");
                self.schedule_net_retry(now);
            }
        }
    }

    // ── register-by-slot ────────────────────────────────────────────────

    pub(crate) async fn register_by_slot(&mut self, now: u64) {
        let Some(login_token) = self.config.login_token.clone() else {
            self.schedule_net_retry(now);
            return;
        };
        let request = RegisterBySlotRequest {
            slot_id: self.config.slot_id.clone(),
            login_token,
            machine_id: self.identity.machine_id.clone(),
            node_name: self.identity.node_name.clone(),
            platform: self.identity.platform.clone(),
            agent_version: self.config.firmware_version.clone(),
        };
        let Some(result) = self
            .post_control(
                "/api/nodes/register_by_slot",
                encode_json(&request),
                None,
                None,
                DEFAULT_BODY_CAP,
            )
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("register_by_slot transport failure: {err}"));
                self.schedule_net_retry(now);
                return;
            }
        };
        if !reply.is_success() {
            self.last_error.set(format!("register_by_slot HTTP {}", reply.status));
            self.schedule_net_retry(now);
            return;
        }
        let Some(response) = Self::parse_body::<RegisterBySlotResponse>(&reply) else {
            self.last_error.set("register_by_slot response unparsable");
            self.schedule_net_retry(now);
            return;
        };
        if response.node_id.is_none() || response.node_auth_token.is_none() {
            self.last_error.set("register_by_slot response missing tokens");
            self.schedule_net_retry(now);
            return;
        }

        self.record_registration(
            response.node_id,
            response.node_auth_token,
            response.tunnel_url,
        );
        tracing::info!(node_id = ?self.node.node_id, "registered by slot");
        self.go_active(now);
    }

    // ── heartbeat ───────────────────────────────────────────────────────

    pub(crate) async fn send_heartbeat(&mut self, now: u64) {
        let Some(bearer) = self.session.session_token.clone() else {
            // Node-token-only deployments have nothing to keep alive on the
            // control plane; hold the cadence.
            self.next_net_action_ms = now + self.config.heartbeat_interval_ms;
            return;
        };
        let request = HeartbeatRequest {
            slot_id: self.config.slot_id.clone(),
            nonce: create_nonce(),
            firmware: self.config.firmware_version.clone(),
            uptime_ms: now.saturating_sub(self.start_ms),
            rssi: self.telemetry.rssi(),
            free_heap: self.telemetry.free_heap(),
            capabilities_hash: capabilities_hash(&self.config.capabilities),
            led_state: self.led_state,
        };
        let Some(result) = self
            .post_control(
                "/api/device/heartbeat",
                encode_json(&request),
                Some(bearer),
                None,
                DEFAULT_BODY_CAP,
            )
            .await
        else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("heartbeat transport failure: {err}"));
                self.schedule_net_retry(now);
                return;
            }
        };

        match reply.status {
            200..=299 => {
                if let Some(response) = Self::parse_body::<HeartbeatResponse>(&reply) {
                    if let Some(ttl) = response.ttl_seconds {
                        self.session.refresh_ttl(now, ttl);
                    }
                }
                self.net_backoff.reset();
                self.next_net_action_ms = now + self.config.heartbeat_interval_ms;
                self.last_error.clear();
            }
            401 | 403 | 410 => {
                self.last_error.set(format!("heartbeat auth rejected ({})", reply.status));
                self.invalidate_session();
                let delay = self.net_backoff.advance();
                self.enter_hello(now, delay);
            }
            code => {
                self.last_error.set(format!("heartbeat HTTP {code}"));
                self.schedule_net_retry(now);
            }
        }
    }

    // ── command polling ─────────────────────────────────────────────────

    pub(crate) async fn pull_commands(&mut self, now: u64) {
        let Some(bearer) = self.session.session_token.clone() else {
            self.next_command_action_ms = now + self.config.command_poll_interval();
            return;
        };
        let request = CommandsPullRequest {
            slot_id: self.config.slot_id.clone(),
            nonce: create_nonce(),
        };
        let Some(result) = self
            .post_control(
                "/api/device/commands/pull",
                encode_json(&request),
                Some(bearer.clone()),
                None,
                DEFAULT_BODY_CAP,
            )
            .await
        else {
            return;
        };
        self.next_command_action_ms = now + self.config.command_poll_interval();

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.last_error.set(format!("command pull transport failure: {err}"));
                self.schedule_net_retry(now);
                return;
            }
        };

        match reply.status {
            200..=299 => {
                let response =
                    Self::parse_body::<CommandsPullResponse>(&reply).unwrap_or_default();
                // Acks fire before anything else gets scheduled; one
                // failing ack does not abort its siblings.
                for command in &response.commands {
                    tracing::info!(id = %command.id, action = %command.action, "command received");
                    self.ack_command(&bearer, &command.id).await;
                }
                self.net_backoff.reset();
            }
            401 | 403 | 410 => {
                self.last_error.set(format!("command pull auth rejected ({})", reply.status));
                self.invalidate_session();
                let delay = self.net_backoff.advance();
                self.enter_hello(now, delay);
            }
            code => {
                self.last_error.set(format!("command pull HTTP {code}"));
                self.schedule_net_retry(now);
            }
        }
    }

    async fn ack_command(&mut self, bearer: &str, command_id: &str) {
        let request = CommandAckRequest {
            slot_id: self.config.slot_id.clone(),
            command_id: command_id.to_string(),
            nonce: create_nonce(),
            status: "handled".into(),
        };
        let Some(result) = self
            .post_control(
                "/api/device/commands/ack",
                encode_json(&request),
                Some(bearer.to_string()),
                None,
                DEFAULT_BODY_CAP,
            )
            .await
        else {
            return;
        };
        match result {
            Ok(reply) if reply.is_success() => {}
            Ok(reply) => {
                self.last_error.set(format!("command ack HTTP {}", reply.status));
            }
            Err(err) => {
                self.last_error.set(format!("command ack transport failure: {err}"));
            }
        }
    }
}
