//! # Hublink Wire Types
//!
//! Shared wire-format definitions for the Hublink edge node:
//!
//! - [`control`] — JSON request/response bodies for the Hub's control-plane
//!   HTTP endpoints (`/api/device/hello`, `/api/device/pair`, ...).
//! - [`frames`] — the textual JSON frames exchanged over the WebSocket
//!   tunnel, including the inbound demultiplexer entry point
//!   [`frames::InboundFrame::parse`].
//! - [`http`] — minimal raw HTTP/1.1 request parsing and response building
//!   used for segmented request streams carried over the tunnel.
//!
//! This crate holds no I/O and no state. Everything here is plain data with
//! `serde` derives, so both the node core and its tests share one source of
//! truth for the protocol.

pub mod control;
pub mod frames;
pub mod http;
