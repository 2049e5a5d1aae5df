//! Inbound tunnel frame handling.
//!
//! One entry point, [`NodeAgent::handle_frame`], dispatches on the frame
//! classification from `hublink-proto` and routes each shape to its
//! handler: register acks update the tunnel lifecycle, the three HTTP
//! framings (single-frame `HTTP_REQ`, typeless RPC envelope, legacy
//! `proxy_request`) go through the bridge, and `control`/`data` frames
//! feed the segmented stream reassembler.
//!
//! Every response frame echoes the inbound correlation id verbatim. A
//! frame missing its correlation id gets no response at all — answering
//! with a guessed id would corrupt the peer's mux table.

use std::collections::BTreeMap;

use hublink_proto::frames::{
    decode_payload, direction, reason, ControlCmd, DataFrame, DataIn, HttpReq, HttpResFrame,
    InboundFrame, ProxyRequest, ProxyResponseFrame, RegisterAck, RegisterFrame, RpcEnvelope,
    RpcResponseFrame,
};
use hublink_proto::http::build_raw_response;

use super::{encode_json, NodeAgent};
use crate::state::SessionState;
use crate::tunnel::bridge::{TunnelRequest, TunnelResponse, RESPONSE_FRAME_BUDGET};
use crate::tunnel::stream::AppendOutcome;
use crate::tunnel::AUTH_RETRY_DELAY_MS;

impl NodeAgent {
    /// Sends the register frame on a freshly opened tunnel.
    ///
    /// With neither a session token nor a node auth token there is nothing
    /// to authenticate with: the register is skipped, the socket is
    /// recycled on a short fixed delay, and the approve path is rescheduled
    /// to run immediately so credentials can be re-earned.
    pub(crate) async fn send_register_frame(&mut self) {
        let now = self.clock.now_ms();
        if self.session.session_token.is_none() && self.node.node_auth_token.is_none() {
            tracing::warn!("tunnel open without credentials; skipping register");
            self.next_approve_action_ms = now;
            self.tunnel.pending_reconnect_at = Some(now + AUTH_RETRY_DELAY_MS);
            self.tunnel.disconnect_pending = true;
            return;
        }
        let frame = RegisterFrame::new(
            self.node.node_id.clone(),
            self.config.slot_id.clone(),
            self.identity.machine_id.clone(),
            self.identity.mac.clone(),
            self.config.firmware_version.clone(),
            self.session.session_token.clone().unwrap_or_default(),
        );
        if self.send_frame(&encode_json(&frame)).await {
            self.tunnel.register_frame_sent = true;
            tracing::debug!("tunnel register frame sent");
        }
    }

    pub(crate) async fn handle_frame(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.last_error.set(format!("tunnel frame unparsable: {err}"));
                return;
            }
        };
        match frame {
            InboundFrame::RegisterAck(ack) => self.handle_register_ack(ack),
            InboundFrame::HttpReq(request) => self.handle_http_req(request).await,
            InboundFrame::Rpc(envelope) => self.handle_rpc(envelope).await,
            InboundFrame::ProxyRequest(request) => self.handle_proxy_request(request).await,
            InboundFrame::Control(cmd) => self.handle_control(cmd),
            InboundFrame::Data(data) => self.handle_data(data).await,
            InboundFrame::Unknown(tag) => {
                tracing::warn!(%tag, "ignoring unknown tunnel frame type");
            }
        }
    }

    // ── register ack ────────────────────────────────────────────────────

    fn handle_register_ack(&mut self, ack: RegisterAck) {
        let acked = ack.is_ok();
        if let Some(id) = ack.node_id {
            self.node.node_id = Some(id);
        }
        if let Some(id) = ack.tunnel_id {
            self.node.tunnel_id = Some(id);
        }
        if let Some(url) = ack.tunnel_url {
            self.node.tunnel_url = Some(url);
        }

        if acked {
            self.tunnel.register_acked = true;
            self.tunnel_backoff.reset();
            self.state.set(SessionState::TunnelConnected);
            self.last_error.clear();
            tracing::info!("tunnel registered");
            if let Some(observer) = &self.on_tunnel {
                observer(true);
            }
            return;
        }

        let now = self.clock.now_ms();
        let why = ack.reason.unwrap_or_default();
        match why.as_str() {
            reason::MISSING_AUTH_TOKEN => {
                // The session token the Hub sees is gone; drop ours, re-earn
                // through approve, and come back on a short fixed delay.
                self.session.clear();
                self.next_approve_action_ms = now;
                self.tunnel.pending_reconnect_at = Some(now + AUTH_RETRY_DELAY_MS);
            }
            reason::SLOT_ID_MISMATCH => {
                // Operator action needed; the schedulers are left alone.
            }
            reason::SESSION_TOKEN_MISSING_SLOT_ID => {
                // Approve cannot fix this; park it until pairing changes.
                self.next_approve_action_ms = u64::MAX;
            }
            _ => {}
        }
        self.last_error.set(format!("tunnel register refused: {why}"));
        self.tunnel.disconnect_pending = true;
    }

    // ── single-frame HTTP ───────────────────────────────────────────────

    fn dispatch_bridge(&self, request: &TunnelRequest) -> TunnelResponse {
        let uptime_ms = self.clock.now_ms().saturating_sub(self.start_ms);
        self.bridge
            .dispatch(request, uptime_ms, self.node.node_id.as_deref())
    }

    async fn handle_http_req(&mut self, frame: HttpReq) {
        let Some(stream_id) = frame.stream_id.filter(|id| !id.is_empty()) else {
            tracing::warn!("HTTP_REQ without stream_id; no response sent");
            return;
        };
        let request = TunnelRequest {
            method: frame.method.unwrap_or_else(|| "GET".into()),
            path: frame.path.unwrap_or_else(|| "/".into()),
            headers: frame.headers.unwrap_or_default(),
            body: frame.body.map(String::into_bytes).unwrap_or_default(),
        };
        let response = self.dispatch_bridge(&request);
        let serialized = encode_json(&HttpResFrame::new(
            stream_id.clone(),
            response.status,
            &response.content_type,
            response.body_str(),
        ));
        let serialized = if serialized.len() > RESPONSE_FRAME_BUDGET {
            encode_json(&HttpResFrame::new(
                stream_id,
                500,
                "application/json",
                r#"{"error":"buffer_overflow"}"#.to_string(),
            ))
        } else {
            serialized
        };
        self.send_frame(&serialized).await;
    }

    async fn handle_rpc(&mut self, envelope: RpcEnvelope) {
        if envelope.id.is_empty() {
            tracing::warn!("RPC envelope with empty id; no response sent");
            return;
        }
        let request = TunnelRequest {
            method: envelope.method.clone().unwrap_or_else(|| "GET".into()),
            path: envelope.path.clone(),
            headers: BTreeMap::new(),
            body: envelope
                .body
                .as_ref()
                .map(|value| value.to_string().into_bytes())
                .unwrap_or_default(),
        };
        let response = self.dispatch_bridge(&request);
        let body = serde_json::from_slice(&response.body)
            .unwrap_or_else(|_| serde_json::Value::String(response.body_str()));
        let serialized = encode_json(&RpcResponseFrame {
            id: envelope.id.clone(),
            status: response.status,
            body,
        });
        let serialized = if serialized.len() > RESPONSE_FRAME_BUDGET {
            encode_json(&RpcResponseFrame {
                id: envelope.id,
                status: 500,
                body: serde_json::json!({"error": "buffer_overflow"}),
            })
        } else {
            serialized
        };
        self.send_frame(&serialized).await;
    }

    // ── legacy proxy framing ────────────────────────────────────────────

    async fn handle_proxy_request(&mut self, frame: ProxyRequest) {
        let Some(request_id) = frame.request_id.filter(|id| !id.is_empty()) else {
            tracing::warn!("proxy_request without request_id; no response sent");
            return;
        };
        let body = match &frame.body {
            Some(encoded) => match decode_payload(encoded) {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.last_error.set("proxy_request body base64 decode failed");
                    let frame = ProxyResponseFrame::new(
                        request_id,
                        400,
                        "application/json",
                        br#"{"ok":false,"error":"bad_base64"}"#,
                    );
                    self.send_frame(&encode_json(&frame)).await;
                    return;
                }
            },
            None => Vec::new(),
        };
        if body.len() > self.config.max_tunnel_body_bytes {
            let frame = ProxyResponseFrame::new(
                request_id,
                413,
                "application/json",
                br#"{"ok":false,"error":"payload_too_large"}"#,
            );
            self.send_frame(&encode_json(&frame)).await;
            return;
        }

        let path = frame.path.unwrap_or_else(|| "/".into());
        let path = match frame.query.filter(|q| !q.is_empty()) {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        let request = TunnelRequest {
            method: frame.method.unwrap_or_else(|| "GET".into()),
            path,
            headers: frame.headers.unwrap_or_default(),
            body,
        };
        let response = self.dispatch_bridge(&request);
        let frame = ProxyResponseFrame::new(
            request_id,
            response.status,
            &response.content_type,
            &response.body,
        );
        self.send_frame(&encode_json(&frame)).await;
    }

    // ── segmented streams ───────────────────────────────────────────────

    fn handle_control(&mut self, frame: ControlCmd) {
        let (Some(cmd), Some(stream_id)) = (frame.cmd, frame.stream_id) else {
            return;
        };
        match cmd.as_str() {
            "open_stream" => {
                tracing::debug!(%stream_id, "stream opened");
                self.stream.open(&stream_id);
            }
            "close_stream" => {
                tracing::debug!(%stream_id, "stream closed");
                self.stream.close(&stream_id);
            }
            other => tracing::warn!(cmd = other, "unknown stream control command"),
        }
    }

    async fn handle_data(&mut self, frame: DataIn) {
        if frame.direction.as_deref() != Some(direction::C2N) {
            return;
        }
        if !self.stream.is_open() {
            return;
        }
        let Some(encoded) = frame.payload_base64 else {
            return;
        };
        let bytes = match decode_payload(&encoded) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.last_error.set("stream data base64 decode failed");
                return;
            }
        };

        match self.stream.append(&bytes) {
            AppendOutcome::Incomplete => {}
            AppendOutcome::Overflow => {
                let stream_id = self
                    .stream
                    .active_stream_id()
                    .unwrap_or_default()
                    .to_string();
                let raw = build_raw_response(413, r#"{"ok":false,"error":"payload_too_large"}"#);
                let frame = DataFrame::n2c(stream_id, raw.as_bytes());
                self.send_frame(&encode_json(&frame)).await;
                self.stream.discard();
            }
            AppendOutcome::Complete(raw_request) => {
                let stream_id = self
                    .stream
                    .active_stream_id()
                    .unwrap_or_default()
                    .to_string();
                let request = TunnelRequest {
                    method: raw_request.method,
                    path: raw_request.path,
                    headers: BTreeMap::new(),
                    body: raw_request.body,
                };
                let response = self.dispatch_bridge(&request);
                let raw = build_raw_response(response.status, &response.body_str());
                let frame = DataFrame::n2c(stream_id, raw.as_bytes());
                self.send_frame(&encode_json(&frame)).await;
                self.stream.discard();
            }
        }
    }
}
