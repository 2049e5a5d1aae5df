//! Shared mocks for agent-level tests: a scripted control transport and a
//! scripted tunnel connector/link. Compiled for tests only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::control::{ControlReply, ControlRequest, ControlTransport, TransportError};
use crate::identity::StaticIdentitySource;
use crate::tunnel::{TunnelConnector, TunnelError, TunnelEvent, TunnelLink};

pub fn identity_source() -> StaticIdentitySource {
    StaticIdentitySource {
        mac: Some("AA:BB:CC:DD:EE:FF".into()),
        chip_id: 0xdead_beef,
        platform: "linux-x86_64".into(),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTROL TRANSPORT MOCK
// ════════════════════════════════════════════════════════════════════════════

/// One scripted reply for the control transport.
pub enum MockReply {
    Status(u16, String),
    Transport(String),
}

impl MockReply {
    pub fn ok(body: &str) -> Self {
        MockReply::Status(200, body.to_string())
    }

    pub fn status(status: u16, body: &str) -> Self {
        MockReply::Status(status, body.to_string())
    }

    pub fn connect_failure() -> Self {
        MockReply::Transport("connection refused".into())
    }
}

/// A control request as the mock recorded it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub body: serde_json::Value,
    pub bearer: Option<String>,
    pub internal_key: Option<String>,
}

/// Replays a script of [`MockReply`]s and records every request.
#[derive(Default)]
pub struct MockControl {
    script: Mutex<VecDeque<MockReply>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    pub fn request_paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl ControlTransport for MockControl {
    async fn execute(&self, request: ControlRequest) -> Result<ControlReply, TransportError> {
        self.requests.lock().push(RecordedRequest {
            path: request.path.clone(),
            body: serde_json::from_str(&request.body)
                .unwrap_or(serde_json::Value::Null),
            bearer: request.bearer.clone(),
            internal_key: request.internal_key.clone(),
        });
        match self.script.lock().pop_front() {
            Some(MockReply::Status(status, body)) => {
                let mut bytes = body.into_bytes();
                let truncated = bytes.len() > request.body_cap;
                bytes.truncate(request.body_cap);
                Ok(ControlReply {
                    status,
                    body: bytes,
                    truncated,
                })
            }
            Some(MockReply::Transport(message)) => Err(TransportError::Connect(message)),
            None => Err(TransportError::Connect("no scripted reply".into())),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TUNNEL MOCK
// ════════════════════════════════════════════════════════════════════════════

/// State shared between a [`MockConnector`], the links it hands out, and
/// the test body.
#[derive(Default)]
pub struct MockTunnelShared {
    pub inbound: Mutex<VecDeque<TunnelEvent>>,
    pub sent: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub fail_sends: AtomicBool,
}

impl MockTunnelShared {
    pub fn push_text(&self, frame: &str) {
        self.inbound
            .lock()
            .push_back(TunnelEvent::Text(frame.to_string()));
    }

    pub fn push_event(&self, event: TunnelEvent) {
        self.inbound.lock().push_back(event);
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }
}

pub struct MockConnector {
    pub shared: Arc<MockTunnelShared>,
    pub connect_count: AtomicU32,
    pub fail_connects: AtomicBool,
    pub bearers: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(MockTunnelShared::default()),
            connect_count: AtomicU32::new(0),
            fail_connects: AtomicBool::new(false),
            bearers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TunnelConnector for MockConnector {
    async fn connect(&self, _url: &str, bearer: &str) -> Result<Box<dyn TunnelLink>, TunnelError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.bearers.lock().push(bearer.to_string());
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(TunnelError::Connect("scripted failure".into()));
        }
        Ok(Box::new(MockLink {
            shared: self.shared.clone(),
        }))
    }
}

struct MockLink {
    shared: Arc<MockTunnelShared>,
}

#[async_trait]
impl TunnelLink for MockLink {
    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TunnelError::Send("scripted send failure".into()));
        }
        self.shared.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn poll_event(&mut self) -> Option<TunnelEvent> {
        self.shared.inbound.lock().pop_front()
    }

    async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
