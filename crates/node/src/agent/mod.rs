//! The node agent: one cooperative state machine over all subsystems.
//!
//! [`NodeAgent`] owns the session state machine, the control-plane HTTP
//! schedule, the WebSocket tunnel and every RAM-only credential store. The
//! host drives it by calling [`NodeAgent::tick`] in a loop; each call does
//! a bounded amount of work and returns, so the host can interleave its own
//! duties (watchdog feeds, application work) between ticks.
//!
//! ## Intra-tick order (deterministic)
//!
//! 1. Link check — no link, no progress.
//! 2. Deferred tunnel teardown (`disconnect_pending` set by frame/event
//!    handling on a *previous* step; the socket is only ever destroyed
//!    here, never inside its own callback path).
//! 3. Drain inbound tunnel frames (bounded batch).
//! 4. Re-evaluate session validity after frame handling.
//! 5. Fire at most one due control-plane HTTP action.
//! 6. Tunnel connect attempt / keepalive if due.
//!
//! Observers are called synchronously from `tick()` and must not reenter
//! the agent beyond accessors.

mod control_plane;
mod tunnel_loop;

use std::sync::Arc;

use crate::backoff::{BackoffCounter, StepBackoff, NET_BACKOFF_MAX_MS, NET_BACKOFF_MIN_MS};
use crate::clock::{Clock, SystemClock};
use crate::config::{HubUrl, NodeConfig};
use crate::control::{ControlTransport, HttpControlTransport};
use crate::error::{ErrorObserver, LastError, NodeError};
use crate::host::{AlwaysUp, LinkMonitor, NoTelemetry, Telemetry};
use crate::identity::{DeviceIdentitySource, NodeIdentity};
use crate::session::{PairingMaterial, RegisteredNode, SessionCredentials};
use crate::state::{SessionState, StateObserver, StateTracker};
use crate::tunnel::bridge::{Bridge, RequestHandler};
use crate::tunnel::stream::StreamContext;
use crate::tunnel::{TunnelConnector, TunnelLink, TunnelState, WsConnector};

/// Frames handled per tick before yielding back to the host.
const MAX_FRAMES_PER_TICK: usize = 32;

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("{}"))
}

/// Observer for registration: fires with the Hub-assigned node id.
pub type RegisteredObserver = Box<dyn Fn(&str) + Send>;
/// Observer for tunnel availability changes.
pub type TunnelObserver = Box<dyn Fn(bool) + Send>;
/// Observer for session invalidation (auth expiry, Hub revocation).
pub type SessionInvalidObserver = Box<dyn Fn() + Send>;

/// The edge-node client core. See the module docs for the tick contract.
pub struct NodeAgent {
    pub(crate) config: NodeConfig,
    pub(crate) hub: HubUrl,
    pub(crate) identity: NodeIdentity,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) link_monitor: Arc<dyn LinkMonitor>,
    pub(crate) telemetry: Arc<dyn Telemetry>,
    pub(crate) transport: Arc<dyn ControlTransport>,
    pub(crate) connector: Arc<dyn TunnelConnector>,

    pub(crate) state: StateTracker,
    pub(crate) session: SessionCredentials,
    pub(crate) pairing: PairingMaterial,
    pub(crate) node: RegisteredNode,
    pub(crate) is_registered: bool,

    pub(crate) net_backoff: BackoffCounter,
    pub(crate) pair_backoff: BackoffCounter,
    pub(crate) tunnel_backoff: StepBackoff,

    pub(crate) next_net_action_ms: u64,
    pub(crate) next_command_action_ms: u64,
    pub(crate) next_approve_action_ms: u64,
    pub(crate) next_tunnel_connect_ms: u64,

    pub(crate) http_busy: bool,
    pub(crate) approve_missing_mac_failed: bool,

    pub(crate) tunnel: TunnelState,
    pub(crate) link: Option<Box<dyn TunnelLink>>,
    pub(crate) stream: StreamContext,
    pub(crate) bridge: Bridge,

    pub(crate) led_state: bool,
    pub(crate) start_ms: u64,

    pub(crate) last_error: LastError,
    pub(crate) on_registered: Option<RegisteredObserver>,
    pub(crate) on_tunnel: Option<TunnelObserver>,
    pub(crate) on_session_invalid: Option<SessionInvalidObserver>,
}

impl NodeAgent {
    /// Builds an agent with production collaborators (system clock, reqwest
    /// control transport, tungstenite tunnel connector).
    ///
    /// Configuration problems are fatal here: a missing hub URL or slot id,
    /// or a TLS policy that would have to be silently weakened, refuse
    /// construction. Only a fresh instance with fixed configuration
    /// recovers.
    pub fn new(
        config: NodeConfig,
        identity_source: &dyn DeviceIdentitySource,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let hub = HubUrl::parse(&config.hub_base_url)?;
        let transport = Arc::new(HttpControlTransport::new(hub.clone(), &config)?);
        let connector = Arc::new(WsConnector::new(
            config.allow_insecure_tls,
            config.root_ca_pem.clone(),
        ));
        Self::with_collaborators(
            config,
            identity_source,
            Arc::new(SystemClock::new()),
            transport,
            connector,
            Arc::new(AlwaysUp),
            Arc::new(NoTelemetry),
        )
    }

    /// Fully injected constructor; what the tests use.
    pub fn with_collaborators(
        config: NodeConfig,
        identity_source: &dyn DeviceIdentitySource,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn ControlTransport>,
        connector: Arc<dyn TunnelConnector>,
        link_monitor: Arc<dyn LinkMonitor>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let hub = HubUrl::parse(&config.hub_base_url)?;
        let identity = NodeIdentity::derive(&config, identity_source);
        let start_ms = clock.now_ms();
        let is_registered = !config.enable_node_registration;

        let mut pairing = PairingMaterial::default();
        if let Some(code) = &config.pairing_code {
            pairing.set(code.clone(), None);
        }

        Ok(Self {
            hub,
            identity,
            clock,
            link_monitor,
            telemetry,
            transport,
            connector,
            state: StateTracker::new(),
            session: SessionCredentials::default(),
            pairing,
            node: RegisteredNode::default(),
            is_registered,
            net_backoff: BackoffCounter::new(NET_BACKOFF_MIN_MS, NET_BACKOFF_MAX_MS),
            pair_backoff: BackoffCounter::new(
                config.register_retry_ms.max(1),
                NET_BACKOFF_MAX_MS,
            ),
            tunnel_backoff: StepBackoff::tunnel(),
            next_net_action_ms: 0,
            next_command_action_ms: 0,
            next_approve_action_ms: 0,
            next_tunnel_connect_ms: 0,
            http_busy: false,
            approve_missing_mac_failed: false,
            tunnel: TunnelState::default(),
            link: None,
            stream: StreamContext::default(),
            bridge: Bridge::default(),
            led_state: false,
            start_ms,
            last_error: LastError::default(),
            on_registered: None,
            on_tunnel: None,
            on_session_invalid: None,
            config,
        })
    }

    // ── observers ───────────────────────────────────────────────────────

    pub fn on_state_change(&mut self, observer: StateObserver) {
        self.state.set_observer(observer);
    }

    pub fn on_error(&mut self, observer: ErrorObserver) {
        self.last_error.set_observer(observer);
    }

    pub fn on_registered(&mut self, observer: RegisteredObserver) {
        self.on_registered = Some(observer);
    }

    pub fn on_tunnel_change(&mut self, observer: TunnelObserver) {
        self.on_tunnel = Some(observer);
    }

    pub fn on_session_invalid(&mut self, observer: SessionInvalidObserver) {
        self.on_session_invalid = Some(observer);
    }

    /// Registers the handler for HTTP requests arriving over the tunnel.
    pub fn set_request_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.bridge.set_handler(handler);
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.message()
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node.node_id.as_deref()
    }

    pub fn node_auth_token(&self) -> Option<&str> {
        self.node.node_auth_token.as_deref()
    }

    pub fn tunnel_url(&self) -> Option<&str> {
        self.node.tunnel_url.as_deref()
    }

    pub fn is_tunnel_connected(&self) -> bool {
        self.tunnel.register_acked
    }

    pub fn is_session_valid(&self) -> bool {
        self.session.is_valid(self.clock.now_ms())
    }

    pub fn led_state(&self) -> bool {
        self.led_state
    }

    /// Host-settable indicator flag, echoed in heartbeats.
    pub fn set_led_state(&mut self, on: bool) {
        self.led_state = on;
    }

    /// Drops the RAM session credentials without touching the state
    /// machine; the next tick re-earns them through the protocol.
    pub fn clear_session(&mut self) {
        self.session.clear();
    }

    // ── main loop ───────────────────────────────────────────────────────

    /// One cooperative pass. See the module docs for ordering.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();

        if !self.link_monitor.is_up() {
            if self.state.current().is_authed() {
                self.session.clear();
                self.enter_hello(now, 0);
            }
            return;
        }

        if self.state.current() == SessionState::Boot {
            // The Hello step refreshes an existing session token when one
            // survives; a cold boot always starts with a plain hello.
            self.state.set(SessionState::Hello);
            self.next_net_action_ms = now;
        }

        if self.state.current() == SessionState::Error {
            if now < self.next_net_action_ms {
                return;
            }
            self.state.set(SessionState::Hello);
        }

        if self.tunnel.disconnect_pending {
            self.teardown_tunnel(now).await;
        }

        self.drain_tunnel().await;

        // Frame handling may have taken time or invalidated things.
        let now = self.clock.now_ms();
        if self.tunnel.disconnect_pending {
            self.teardown_tunnel(now).await;
        }
        if self.state.current().is_authed()
            && self.session.session_token.is_some()
            && !self.session.is_valid(now)
        {
            self.session.clear();
            self.enter_hello(now, 0);
        }

        self.step_control_plane(now).await;

        let now = self.clock.now_ms();
        self.step_tunnel(now).await;
    }

    /// Fires at most one due control-plane HTTP action.
    async fn step_control_plane(&mut self, now: u64) {
        if self.http_busy {
            return;
        }
        match self.state.current() {
            SessionState::Hello => {
                if now >= self.next_net_action_ms {
                    if self.session.session_token.is_some() {
                        self.poll_session(now, true).await;
                    } else {
                        self.send_hello(now).await;
                    }
                }
            }
            SessionState::PairSubmit => {
                if now >= self.next_net_action_ms {
                    self.submit_pair(now).await;
                }
            }
            SessionState::PendingPoll => {
                let register_due = self.config.prefer_register_by_slot
                    && self.config.enable_node_registration
                    && !self.is_registered
                    && self.config.login_token.is_some()
                    && now >= self.next_net_action_ms;
                let approve_due = self.config.enable_self_approve
                    && self.pairing.is_valid()
                    && !self.approve_missing_mac_failed
                    && now >= self.next_approve_action_ms;
                if register_due {
                    self.register_by_slot(now).await;
                } else if approve_due {
                    self.self_approve(now).await;
                } else if now >= self.next_net_action_ms {
                    self.poll_session(now, false).await;
                }
            }
            SessionState::Active
            | SessionState::TunnelConnecting
            | SessionState::TunnelConnected => {
                if now >= self.next_net_action_ms {
                    self.send_heartbeat(now).await;
                } else if self.config.enable_command_polling
                    && now >= self.next_command_action_ms
                {
                    self.pull_commands(now).await;
                }
            }
            SessionState::Boot | SessionState::Granted | SessionState::Error => {}
        }
    }

    /// Tunnel connect attempt and keepalive.
    async fn step_tunnel(&mut self, now: u64) {
        if !self.config.enable_tunnel {
            return;
        }

        if self.link.is_some() {
            self.keepalive(now).await;
            return;
        }

        if self.state.current() != SessionState::Active {
            return;
        }
        if now < self.next_tunnel_connect_ms {
            return;
        }
        if self.session.session_token.is_none() && self.node.node_auth_token.is_none() {
            return;
        }
        let Some(raw_url) = self.node.tunnel_url.clone() else {
            return;
        };

        let (url, host) = match crate::tunnel::normalize_tunnel_url(&raw_url) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.last_error.set(format!("tunnel URL rejected: {err}"));
                self.schedule_tunnel_retry(now);
                return;
            }
        };
        self.node.tunnel_host = Some(host);

        self.state.set(SessionState::TunnelConnecting);
        let bearer = self
            .session
            .session_token
            .clone()
            .or_else(|| self.node.node_auth_token.clone())
            .unwrap_or_default();
        tracing::info!(%url, "connecting tunnel");
        match self.connector.connect(&url, &bearer).await {
            Ok(link) => {
                self.link = Some(link);
                self.tunnel.reset();
                self.tunnel.connected = true;
                self.tunnel.last_ping_sent_ms = self.clock.now_ms();
                self.send_register_frame().await;
            }
            Err(err) => {
                self.last_error.set(format!("tunnel connect failed: {err}"));
                self.state.set(SessionState::Active);
                self.schedule_tunnel_retry(now);
            }
        }
    }

    async fn keepalive(&mut self, now: u64) {
        if !self.tunnel.register_acked {
            return;
        }
        if now.saturating_sub(self.tunnel.last_ping_sent_ms)
            < crate::tunnel::KEEPALIVE_INTERVAL_MS
        {
            return;
        }
        if self.send_frame(hublink_proto::frames::PING_FRAME).await {
            self.tunnel.last_ping_sent_ms = now;
        }
    }

    /// Drains a bounded batch of inbound tunnel frames.
    async fn drain_tunnel(&mut self) {
        for _ in 0..MAX_FRAMES_PER_TICK {
            if self.tunnel.disconnect_pending {
                return;
            }
            let event = match self.link.as_mut() {
                Some(link) => link.poll_event().await,
                None => return,
            };
            match event {
                None => return,
                Some(crate::tunnel::TunnelEvent::Text(text)) => {
                    self.handle_frame(&text).await;
                }
                Some(crate::tunnel::TunnelEvent::Closed) => {
                    tracing::info!("tunnel closed by peer");
                    self.tunnel.disconnect_pending = true;
                    return;
                }
                Some(crate::tunnel::TunnelEvent::Error(err)) => {
                    self.last_error.set(format!("tunnel error: {err}"));
                    self.tunnel.disconnect_pending = true;
                    return;
                }
            }
        }
    }

    /// Deferred socket teardown; the only place the link is destroyed.
    async fn teardown_tunnel(&mut self, now: u64) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        let was_up = self.tunnel.register_acked;
        let reconnect_override = self.tunnel.pending_reconnect_at;
        self.tunnel.reset();
        if matches!(
            self.state.current(),
            SessionState::TunnelConnecting | SessionState::TunnelConnected
        ) {
            self.state.set(SessionState::Active);
        }
        if was_up {
            if let Some(observer) = &self.on_tunnel {
                observer(false);
            }
        }
        match reconnect_override {
            Some(at) => self.next_tunnel_connect_ms = at,
            None => self.schedule_tunnel_retry(now),
        }
    }

    pub(crate) fn schedule_tunnel_retry(&mut self, now: u64) {
        let delay = self.tunnel_backoff.advance();
        self.next_tunnel_connect_ms = now + delay;
        tracing::debug!(delay_ms = delay, "tunnel reconnect scheduled");
    }

    pub(crate) fn schedule_net_retry(&mut self, now: u64) {
        self.next_net_action_ms = now + self.net_backoff.advance();
    }

    pub(crate) fn enter_hello(&mut self, now: u64, delay_ms: u64) {
        self.state.set(SessionState::Hello);
        self.next_net_action_ms = now + delay_ms;
    }

    /// Clears the session and notifies the session-invalid observer.
    pub(crate) fn invalidate_session(&mut self) {
        self.session.clear();
        if let Some(observer) = &self.on_session_invalid {
            observer();
        }
    }

    /// Shared entry into Active after tokens arrive from any path.
    pub(crate) fn go_active(&mut self, now: u64) {
        self.state.set(SessionState::Granted);
        self.state.set(SessionState::Active);
        self.net_backoff.reset();
        self.next_net_action_ms = now;
        self.next_command_action_ms = now + self.config.command_poll_interval();
        self.last_error.clear();
    }

    /// Records Hub-issued registration material and fires the observer.
    pub(crate) fn record_registration(
        &mut self,
        node_id: Option<String>,
        node_auth_token: Option<String>,
        tunnel_url: Option<String>,
    ) {
        if let Some(token) = node_auth_token {
            self.node.node_auth_token = Some(token);
        }
        match tunnel_url {
            Some(url) => self.node.tunnel_url = Some(url),
            None => {
                if self.node.tunnel_url.is_none() {
                    self.node.tunnel_url = Some(self.hub.derived_tunnel_url());
                }
            }
        }
        if let Some(id) = node_id {
            self.node.node_id = Some(id.clone());
            self.is_registered = true;
            if let Some(observer) = &self.on_registered {
                observer(&id);
            }
        }
    }

    pub(crate) async fn send_frame(&mut self, text: &str) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.send_text(text).await {
            Ok(()) => true,
            Err(err) => {
                self.last_error.set(format!("tunnel send failed: {err}"));
                self.tunnel.disconnect_pending = true;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use hublink_proto::frames::decode_payload;

    use crate::clock::ManualClock;
    use crate::test_support::{identity_source, MockConnector, MockControl, MockReply};
    use crate::tunnel::bridge::{TunnelRequest, TunnelResponse};

    struct Harness {
        agent: NodeAgent,
        clock: Arc<ManualClock>,
        control: Arc<MockControl>,
        connector: Arc<MockConnector>,
    }

    fn harness(config: NodeConfig) -> Harness {
        harness_with_link(config, Arc::new(AlwaysUp))
    }

    fn harness_with_link(config: NodeConfig, link: Arc<dyn LinkMonitor>) -> Harness {
        let clock = ManualClock::new(0);
        let control = MockControl::new();
        let connector = MockConnector::new();
        let agent = NodeAgent::with_collaborators(
            config,
            &identity_source(),
            clock.clone(),
            control.clone(),
            connector.clone(),
            link,
            Arc::new(NoTelemetry),
        )
        .expect("agent construction");
        Harness {
            agent,
            clock,
            control,
            connector,
        }
    }

    fn self_approve_config() -> NodeConfig {
        let mut config = NodeConfig::new("https://h", "s1");
        config.enable_self_approve = true;
        config.enable_node_registration = true;
        config
    }

    const HELLO_PENDING: &str = r#"{"status":"PENDING","retry_after_ms":1000,"pairing_code":"ABC","pairing_expires_at":"2026-01-01T00:00:00Z"}"#;
    const APPROVE_GRANTED: &str = r#"{"status":"granted","session_token":"tok","tunnel_url":"wss://h/ws/tunnel","node_id":"n1"}"#;

    /// Drives a fresh agent through hello + approve into Active.
    async fn drive_to_active(h: &mut Harness) {
        h.control.push(MockReply::ok(HELLO_PENDING));
        h.control.push(MockReply::ok(APPROVE_GRANTED));
        h.agent.tick().await;
        h.clock.advance(550);
        h.agent.tick().await;
        assert!(matches!(
            h.agent.state(),
            SessionState::Active | SessionState::TunnelConnecting
        ));
    }

    // ── S1: cold boot to Active via self-approve ────────────────────────

    #[tokio::test]
    async fn test_cold_boot_to_active_via_self_approve() {
        let mut h = harness(self_approve_config());
        let registered = Arc::new(parking_lot::Mutex::new(None::<String>));
        let sink = registered.clone();
        h.agent
            .on_registered(Box::new(move |id| *sink.lock() = Some(id.to_string())));

        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::PendingPoll);
        assert_eq!(h.agent.pairing.pairing_code.as_deref(), Some("ABC"));
        assert_eq!(h.agent.next_net_action_ms, 1_000);

        h.control.push(MockReply::ok(APPROVE_GRANTED));
        h.clock.advance(550);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Active);
        assert_eq!(h.agent.session.session_token.as_deref(), Some("tok"));
        assert_eq!(h.agent.tunnel_url(), Some("wss://h/ws/tunnel"));
        assert_eq!(registered.lock().as_deref(), Some("n1"));
        assert!(h.agent.is_registered());

        assert_eq!(
            h.control.request_paths(),
            vec!["/api/device/hello", "/api/device/approve"]
        );
        let approve = h.control.last_request().unwrap();
        assert_eq!(approve.body["pairing_code"], "ABC");
        assert_eq!(approve.body["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(approve.body["machine_id"], "node-aabbccddeeff");
    }

    // ── pairing path without self-approve ───────────────────────────────

    #[tokio::test]
    async fn test_hello_with_pairing_goes_to_pair_submit() {
        let mut config = NodeConfig::new("https://h", "s1");
        config.enable_node_registration = true;
        config.internal_key = Some("ik".into());
        let mut h = harness(config);

        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::PairSubmit);

        h.control.push(MockReply::ok(
            r#"{"ok":true,"node_id":"n2","node_token":"nt2","session_token":"st2"}"#,
        ));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Active);
        assert_eq!(h.agent.node_id(), Some("n2"));
        assert_eq!(h.agent.node_auth_token(), Some("nt2"));
        // Absent tunnel_url falls back to the hub-derived one.
        assert_eq!(h.agent.tunnel_url(), Some("wss://h/ws/tunnel"));
        // Pairing material is consumed by a successful pair.
        assert!(!h.agent.pairing.is_valid());

        let pair = h.control.last_request().unwrap();
        assert_eq!(pair.path, "/api/device/pair");
        assert_eq!(pair.internal_key.as_deref(), Some("ik"));
    }

    #[tokio::test]
    async fn test_pair_failure_clears_pairing_and_backs_off_to_hello() {
        let mut config = NodeConfig::new("https://h", "s1");
        config.enable_node_registration = true;
        let mut h = harness(config);

        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        h.control.push(MockReply::status(500, "{}"));
        h.agent.tick().await;

        assert_eq!(h.agent.state(), SessionState::Hello);
        assert!(!h.agent.pairing.is_valid());
        assert_eq!(h.agent.next_net_action_ms, 2_000);
        assert!(h.agent.last_error().is_some());
    }

    // ── hello edge handling ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_hello_denied_enters_error_then_recovers() {
        let mut h = harness(self_approve_config());
        h.control.push(MockReply::ok(r#"{"status":"DENIED"}"#));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Error);
        assert_eq!(h.agent.next_net_action_ms, 2_000);

        // Still inside the backoff window: nothing happens.
        h.clock.advance(1_000);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Error);

        // After the backoff the machine re-enters Hello and retries.
        h.clock.advance(1_000);
        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::PendingPoll);
    }

    #[tokio::test]
    async fn test_hello_410_clears_pairing_and_stays_hello() {
        let mut config = self_approve_config();
        config.pairing_code = Some("SEEDED".into());
        let mut h = harness(config);
        let invalidated = Arc::new(AtomicBool::new(false));
        let flag = invalidated.clone();
        h.agent
            .on_session_invalid(Box::new(move || flag.store(true, Ordering::SeqCst)));

        h.control.push(MockReply::status(410, "{}"));
        h.agent.tick().await;

        assert_eq!(h.agent.state(), SessionState::Hello);
        assert!(!h.agent.pairing.is_valid());
        assert!(invalidated.load(Ordering::SeqCst));
        assert_eq!(h.agent.next_net_action_ms, 2_000);
    }

    #[tokio::test]
    async fn test_hello_403_backs_off_instead_of_tight_looping() {
        let mut h = harness(self_approve_config());
        h.control.push(MockReply::status(403, "{}"));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Hello);
        assert_eq!(h.agent.next_net_action_ms, 2_000);

        h.control.push(MockReply::status(403, "{}"));
        h.clock.advance(2_000);
        h.agent.tick().await;
        // Doubled, not pinned at the minimum.
        assert_eq!(h.agent.next_net_action_ms, 2_000 + 4_000);
    }

    // ── S3: session invalidation mid-Active ─────────────────────────────

    #[tokio::test]
    async fn test_heartbeat_403_invalidates_session() {
        let mut h = harness(self_approve_config());
        let errors = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = errors.clone();
        h.agent
            .on_error(Box::new(move |message| sink.lock().push(message.to_string())));
        drive_to_active(&mut h).await;

        h.control.push(MockReply::status(403, "{}"));
        h.clock.advance(2_000);
        h.agent.tick().await;

        assert_eq!(h.agent.state(), SessionState::Hello);
        assert!(h.agent.session.session_token.is_none());
        let now = h.clock.now_ms();
        assert_eq!(h.agent.next_net_action_ms, now + 2_000);
        assert!(errors
            .lock()
            .iter()
            .any(|message| message.contains("heartbeat auth rejected")));

        // Invariant: the next fired HTTP action is hello.
        h.clock.advance(2_000);
        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        assert_eq!(
            h.control.last_request().unwrap().path,
            "/api/device/hello"
        );
    }

    #[tokio::test]
    async fn test_heartbeat_carries_bearer_and_refreshes_ttl() {
        let mut h = harness(self_approve_config());
        drive_to_active(&mut h).await;

        h.control.push(MockReply::ok(r#"{"ttl_seconds":2}"#));
        h.agent.tick().await;
        let heartbeat = h.control.last_request().unwrap();
        assert_eq!(heartbeat.path, "/api/device/heartbeat");
        assert_eq!(heartbeat.bearer.as_deref(), Some("tok"));
        assert_eq!(heartbeat.body["slot_id"], "s1");
        let now = h.clock.now_ms();
        assert_eq!(h.agent.session.expires_at_ms, Some(now + 2_000));

        // Local TTL expiry without a refreshing heartbeat drops to Hello.
        h.clock.advance(2_500);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Hello);
    }

    // ── register-by-slot ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_register_by_slot_preferred_path() {
        let mut config = NodeConfig::new("https://h", "s1");
        config.enable_node_registration = true;
        config.prefer_register_by_slot = true;
        config.login_token = Some("login".into());
        let mut h = harness(config);

        h.control
            .push(MockReply::ok(r#"{"status":"PENDING","retry_after_ms":500}"#));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::PendingPoll);

        h.control.push(MockReply::ok(
            r#"{"node_id":"n3","node_auth_token":"nat3","tunnel_url":"wss://h/ws/tunnel"}"#,
        ));
        h.clock.advance(500);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Active);
        assert!(h.agent.is_registered());
        assert_eq!(h.agent.node_auth_token(), Some("nat3"));

        let register = h.control.last_request().unwrap();
        assert_eq!(register.path, "/api/nodes/register_by_slot");
        assert_eq!(register.body["login_token"], "login");
        assert_eq!(register.body["machine_id"], "node-aabbccddeeff");
    }

    // ── approve missing_mac latch ───────────────────────────────────────

    #[tokio::test]
    async fn test_approve_missing_mac_latches_permanently() {
        let mut h = harness(self_approve_config());
        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;

        h.control
            .push(MockReply::status(400, r#"{"error":"missing_mac"}"#));
        h.clock.advance(100);
        h.agent.tick().await;
        assert!(h.agent.approve_missing_mac_failed);
        let approves_before = h
            .control
            .request_paths()
            .iter()
            .filter(|path| path.as_str() == "/api/device/approve")
            .count();

        // Approve never fires again; the pending poll takes over instead.
        h.control
            .push(MockReply::ok(r#"{"status":"PENDING","retry_after_ms":500}"#));
        h.clock.advance(1_000);
        h.agent.tick().await;
        let approves_after = h
            .control
            .request_paths()
            .iter()
            .filter(|path| path.as_str() == "/api/device/approve")
            .count();
        assert_eq!(approves_before, approves_after);
        assert_eq!(
            h.control.last_request().unwrap().path,
            "/api/device/session"
        );
    }

    // ── one HTTP action per tick ────────────────────────────────────────

    #[tokio::test]
    async fn test_at_most_one_control_request_per_tick() {
        let mut h = harness(self_approve_config());
        drive_to_active(&mut h).await;

        // Heartbeat is due; exactly one request leaves this tick.
        let before = h.control.request_paths().len();
        h.control.push(MockReply::ok("{}"));
        h.clock.advance(10_000);
        h.agent.tick().await;
        assert_eq!(h.control.request_paths().len(), before + 1);
    }

    // ── session refresh from Hello ──────────────────────────────────────

    #[tokio::test]
    async fn test_hello_with_surviving_token_refreshes_session() {
        let mut h = harness(self_approve_config());
        h.agent.session.set_token("old-tok".into());

        h.control.push(MockReply::ok(
            r#"{"status":"GRANTED","session_token":"new-tok","ttl_seconds":60}"#,
        ));
        h.agent.tick().await;

        // The refresh jumped straight to Active, skipping hello.
        assert_eq!(h.agent.state(), SessionState::Active);
        assert_eq!(h.agent.session.session_token.as_deref(), Some("new-tok"));
        let request = h.control.last_request().unwrap();
        assert_eq!(request.path, "/api/device/session");
        assert_eq!(request.body["session_token"], "old-tok");
    }

    // ── reconnect hint ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_hello_reconnect_hint_fields() {
        let mut config = self_approve_config();
        config.send_reconnect_hint_in_hello = true;
        config.boot_reason = "watchdog".into();
        let mut h = harness(config);

        h.control.push(MockReply::ok(HELLO_PENDING));
        h.agent.tick().await;
        let hello = h.control.last_request().unwrap();
        assert_eq!(hello.body["reconnect"], true);
        assert_eq!(hello.body["boot_reason"], "watchdog");
        assert_eq!(hello.body["device_info"]["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(hello.body["device_info"]["platform"], "linux-x86_64");
    }

    // ── hello replay law ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_hello_replay_identical_except_nonce() {
        let mut h = harness(self_approve_config());
        h.control.push(MockReply::connect_failure());
        h.agent.tick().await;
        h.control.push(MockReply::connect_failure());
        h.clock.advance(2_000);
        h.agent.tick().await;

        let requests = h.control.requests.lock();
        assert_eq!(requests.len(), 2);
        let (mut a, mut b) = (requests[0].body.clone(), requests[1].body.clone());
        let nonce_a = a["nonce"].as_str().unwrap().to_string();
        let nonce_b = b["nonce"].as_str().unwrap().to_string();
        assert_eq!(nonce_a.len(), 8);
        assert_ne!(nonce_a, nonce_b);
        a["nonce"] = serde_json::Value::Null;
        b["nonce"] = serde_json::Value::Null;
        assert_eq!(a, b);
    }

    // ── net backoff growth (S5) ─────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_failure_backoff_growth_then_reset() {
        let mut h = harness(self_approve_config());
        let mut deltas = Vec::new();
        for _ in 0..6 {
            h.control.push(MockReply::connect_failure());
            let now = h.agent.next_net_action_ms;
            h.clock.set(now);
            h.agent.tick().await;
            deltas.push(h.agent.next_net_action_ms - now);
        }
        assert_eq!(deltas, vec![2_000, 4_000, 8_000, 16_000, 32_000, 60_000]);

        // A success resets the counter to the minimum.
        h.control.push(MockReply::ok(HELLO_PENDING));
        h.clock.set(h.agent.next_net_action_ms);
        h.agent.tick().await;
        assert_eq!(h.agent.net_backoff.current_ms(), 2_000);
    }

    // ── tunnel lifecycle ────────────────────────────────────────────────

    fn tunnel_config() -> NodeConfig {
        let mut config = self_approve_config();
        config.enable_tunnel = true;
        config
    }

    #[tokio::test]
    async fn test_tunnel_register_and_ack_to_connected() {
        let mut h = harness(tunnel_config());
        let tunnel_ups = Arc::new(AtomicU64::new(0));
        let counter = tunnel_ups.clone();
        h.agent.on_tunnel_change(Box::new(move |up| {
            if up {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        drive_to_active(&mut h).await;

        // The connect fired in the Active tick; register frame is out.
        assert_eq!(h.agent.state(), SessionState::TunnelConnecting);
        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "register");
        assert_eq!(frames[0]["auth_token"], "tok");
        assert_eq!(frames[0]["slot_id"], "s1");
        assert_eq!(frames[0]["machine_id"], "node-aabbccddeeff");
        assert_eq!(h.connector.bearers.lock().last().map(String::as_str), Some("tok"));

        h.connector
            .shared
            .push_text(r#"{"type":"register_ack","status":"ok","tunnel_id":"t1"}"#);
        h.control.push(MockReply::ok("{}")); // heartbeat rides the same tick
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::TunnelConnected);
        assert!(h.agent.is_tunnel_connected());
        assert_eq!(tunnel_ups.load(Ordering::SeqCst), 1);
        assert_eq!(h.agent.node.tunnel_id.as_deref(), Some("t1"));
    }

    // ── S2: register refused MISSING_AUTH_TOKEN ─────────────────────────

    #[tokio::test]
    async fn test_register_refused_missing_auth_token() {
        let mut h = harness(tunnel_config());
        h.control.push(MockReply::ok(HELLO_PENDING));
        // Approve grants only a node token; the session stays empty.
        h.control.push(MockReply::ok(
            r#"{"status":"granted","register_token":"nt","tunnel_url":"wss://h/ws/tunnel","node_id":"n1"}"#,
        ));
        h.agent.tick().await;
        h.clock.advance(550);
        h.agent.tick().await;

        // Register frame went out with an empty auth token.
        let frames = h.connector.shared.sent_json();
        assert_eq!(frames[0]["type"], "register");
        assert_eq!(frames[0]["auth_token"], "");

        h.connector.shared.push_text(
            r#"{"type":"register_ack","status":"error","reason":"MISSING_AUTH_TOKEN"}"#,
        );
        h.agent.tick().await;

        let now = h.clock.now_ms();
        assert!(h.agent.session.session_token.is_none());
        assert_eq!(h.agent.next_approve_action_ms, now);
        assert_eq!(h.agent.next_tunnel_connect_ms, now + 3_000);
        assert_eq!(h.agent.state(), SessionState::Active);
        assert!(h.agent.link.is_none());
    }

    #[tokio::test]
    async fn test_register_refused_unknown_reason_uses_backoff() {
        let mut h = harness(tunnel_config());
        drive_to_active(&mut h).await;
        h.connector
            .shared
            .push_text(r#"{"type":"register_ack","status":"error","reason":"WHO_KNOWS"}"#);
        h.control.push(MockReply::ok("{}"));
        h.agent.tick().await;

        let now = h.clock.now_ms();
        // First entry of the step table.
        assert_eq!(h.agent.next_tunnel_connect_ms, now + 2_000);
        assert_eq!(h.agent.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_tunnel_connect_failures_walk_step_table() {
        let mut h = harness(tunnel_config());
        h.connector.fail_connects.store(true, Ordering::SeqCst);
        drive_to_active(&mut h).await;

        let mut deltas = Vec::new();
        deltas.push(h.agent.next_tunnel_connect_ms - h.clock.now_ms());
        for _ in 0..3 {
            h.clock.set(h.agent.next_tunnel_connect_ms);
            h.control.push(MockReply::ok("{}"));
            let now = h.clock.now_ms();
            h.agent.tick().await;
            deltas.push(h.agent.next_tunnel_connect_ms - now);
        }
        assert_eq!(deltas, vec![2_000, 4_000, 8_000, 15_000]);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_and_reschedules() {
        let mut h = harness(tunnel_config());
        drive_to_active(&mut h).await;
        h.connector
            .shared
            .push_text(r#"{"type":"register_ack","status":"ok"}"#);
        h.control.push(MockReply::ok("{}"));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::TunnelConnected);

        h.connector
            .shared
            .push_event(crate::tunnel::TunnelEvent::Closed);
        h.control.push(MockReply::ok("{}"));
        h.clock.advance(100);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Active);
        assert!(h.agent.link.is_none());
        assert!(h.connector.shared.closed.load(Ordering::SeqCst));
        assert!(h.agent.next_tunnel_connect_ms > h.clock.now_ms());
    }

    // ── inbound HTTP framings ───────────────────────────────────────────

    /// Brings the agent to TunnelConnected with a clean frame log.
    async fn connected_harness() -> Harness {
        let mut h = harness(tunnel_config());
        drive_to_active(&mut h).await;
        h.connector
            .shared
            .push_text(r#"{"type":"register_ack","status":"ok"}"#);
        h.control.push(MockReply::ok("{}"));
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::TunnelConnected);
        h.connector.shared.sent.lock().clear();
        h
    }

    #[tokio::test]
    async fn test_http_req_echoes_stream_id() {
        let mut h = connected_harness().await;
        h.connector.shared.push_text(
            r#"{"type":"HTTP_REQ","stream_id":"xyz-1","method":"GET","path":"/ping"}"#,
        );
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "HTTP_RES");
        assert_eq!(frames[0]["stream_id"], "xyz-1");
        assert_eq!(frames[0]["status"], 200);
        assert_eq!(frames[0]["body"], r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_http_req_without_stream_id_gets_no_response() {
        let mut h = connected_harness().await;
        h.connector
            .shared
            .push_text(r#"{"type":"HTTP_REQ","method":"GET","path":"/ping"}"#);
        h.agent.tick().await;
        assert!(h.connector.shared.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_envelope_round_trip() {
        let mut h = connected_harness().await;
        h.connector
            .shared
            .push_text(r#"{"id":"7","path":"/api/ping"}"#);
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], "7");
        assert_eq!(frames[0]["status"], 200);
        assert_eq!(frames[0]["body"]["ok"], true);
        assert!(frames[0].get("type").is_none());
    }

    #[tokio::test]
    async fn test_proxy_request_round_trip_via_handler() {
        let mut h = connected_harness().await;
        h.agent.set_request_handler(Box::new(|request: &TunnelRequest| {
            if request.path.starts_with("/echo") {
                Some(TunnelResponse::json(
                    200,
                    String::from_utf8_lossy(&request.body).into_owned(),
                ))
            } else {
                None
            }
        }));

        let body = hublink_proto::frames::encode_payload(b"payload-bytes");
        h.connector.shared.push_text(&format!(
            r#"{{"type":"proxy_request","request_id":"r9","method":"POST","path":"/echo","query":"a=1","body":"{body}"}}"#
        ));
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "proxy_response");
        assert_eq!(frames[0]["request_id"], "r9");
        assert_eq!(frames[0]["status_code"], 200);
        let decoded = decode_payload(frames[0]["body"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, b"payload-bytes");
    }

    #[tokio::test]
    async fn test_proxy_request_body_over_cap_is_413() {
        let mut h = connected_harness().await;
        let body = hublink_proto::frames::encode_payload(&vec![b'x'; 4_097]);
        h.connector.shared.push_text(&format!(
            r#"{{"type":"proxy_request","request_id":"big","method":"POST","path":"/x","body":"{body}"}}"#
        ));
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["status_code"], 413);
        assert_eq!(frames[0]["request_id"], "big");
    }

    // ── S4: segmented stream reassembly ─────────────────────────────────

    #[tokio::test]
    async fn test_segmented_request_reassembly() {
        let mut h = connected_harness().await;
        let raw = b"GET /ping HTTP/1.1\r\nHost:x\r\nContent-Length:0\r\n\r\n";
        let (first, second) = raw.split_at(20);

        h.connector
            .shared
            .push_text(r#"{"type":"control","cmd":"open_stream","stream_id":"s"}"#);
        h.connector.shared.push_text(&format!(
            r#"{{"type":"data","stream_id":"s","direction":"c2n","payload_base64":"{}"}}"#,
            hublink_proto::frames::encode_payload(first)
        ));
        h.connector.shared.push_text(&format!(
            r#"{{"type":"data","stream_id":"s","direction":"c2n","payload_base64":"{}"}}"#,
            hublink_proto::frames::encode_payload(second)
        ));
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "data");
        assert_eq!(frames[0]["stream_id"], "s");
        assert_eq!(frames[0]["direction"], "n2c");
        let payload = decode_payload(frames[0]["payload_base64"].as_str().unwrap()).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with(r#"{"ok":true}"#));
        assert!(!h.agent.stream.is_open());
    }

    #[tokio::test]
    async fn test_segmented_overflow_answers_413() {
        let mut h = connected_harness().await;
        h.connector
            .shared
            .push_text(r#"{"type":"control","cmd":"open_stream","stream_id":"s"}"#);
        let oversized = b"POST /x HTTP/1.1\r\nContent-Length: 4097\r\n\r\n";
        h.connector.shared.push_text(&format!(
            r#"{{"type":"data","stream_id":"s","direction":"c2n","payload_base64":"{}"}}"#,
            hublink_proto::frames::encode_payload(oversized)
        ));
        h.agent.tick().await;

        let frames = h.connector.shared.sent_json();
        assert_eq!(frames.len(), 1);
        let payload = decode_payload(frames[0]["payload_base64"].as_str().unwrap()).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("HTTP/1.1 413"));
        assert!(text.contains("payload_too_large"));
        assert!(!h.agent.stream.is_open());
    }

    // ── keepalive ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_keepalive_ping_every_interval() {
        let mut h = connected_harness().await;
        h.clock.advance(25_000);
        h.control.push(MockReply::ok("{}"));
        h.agent.tick().await;
        let frames = h.connector.shared.sent_frames();
        assert!(frames.iter().any(|frame| frame == r#"{"type":"ping"}"#));
    }

    // ── link loss ───────────────────────────────────────────────────────

    struct FlakyLink {
        up: AtomicBool,
    }

    impl LinkMonitor for FlakyLink {
        fn is_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_link_drop_in_active_returns_to_hello() {
        let link = Arc::new(FlakyLink {
            up: AtomicBool::new(true),
        });
        let mut h = harness_with_link(self_approve_config(), link.clone());
        drive_to_active(&mut h).await;

        link.up.store(false, Ordering::SeqCst);
        h.agent.tick().await;
        assert_eq!(h.agent.state(), SessionState::Hello);
        assert!(h.agent.session.session_token.is_none());

        // While the link is down nothing fires.
        let before = h.control.request_paths().len();
        h.clock.advance(60_000);
        h.agent.tick().await;
        assert_eq!(h.control.request_paths().len(), before);
    }

    // ── command polling ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_command_pull_acks_each_command() {
        let mut config = self_approve_config();
        config.enable_command_polling = true;
        config.command_poll_interval_ms = Some(1_000);
        let mut h = harness(config);
        drive_to_active(&mut h).await;

        // Heartbeat takes the first due tick.
        h.control.push(MockReply::ok("{}"));
        h.clock.advance(5_000);
        h.agent.tick().await;

        // Command poll rides the next tick; one ack fails, the other lands.
        h.control.push(MockReply::ok(
            r#"{"commands":[{"id":"c1","action":"blink"},{"id":"c2","action":"reboot"}]}"#,
        ));
        h.control.push(MockReply::status(500, "{}"));
        h.control.push(MockReply::ok("{}"));
        h.clock.advance(1_000);
        h.agent.tick().await;

        let paths = h.control.request_paths();
        let tail: Vec<&str> = paths.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "/api/device/commands/ack",
                "/api/device/commands/ack",
                "/api/device/commands/pull",
            ]
        );
        let requests = h.control.requests.lock();
        let acks: Vec<&serde_json::Value> = requests
            .iter()
            .filter(|request| request.path == "/api/device/commands/ack")
            .map(|request| &request.body)
            .collect();
        assert_eq!(acks[0]["command_id"], "c1");
        assert_eq!(acks[1]["command_id"], "c2");
        assert_eq!(acks[0]["status"], "handled");
    }
}
