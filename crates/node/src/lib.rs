//! # Hublink Node
//!
//! Client core for coupling a constrained edge device to a central Hub:
//! HTTPS for control-plane exchanges (hello, pairing, approval, session,
//! heartbeat, command polling) and one persistent WebSocket tunnel for
//! bidirectional, multiplexed request/response traffic.
//!
//! The host constructs a [`NodeAgent`] from a [`NodeConfig`] and drives it
//! with [`NodeAgent::tick`] in a loop:
//!
//! ```no_run
//! use hublink_node::{NodeAgent, NodeConfig, StaticIdentitySource};
//!
//! # async fn run() -> Result<(), hublink_node::NodeError> {
//! let mut config = NodeConfig::new("https://hub.example", "slot-1");
//! config.allow_insecure_tls = true;
//! config.enable_tunnel = true;
//! config.enable_self_approve = true;
//!
//! let identity = StaticIdentitySource {
//!     mac: Some("aa:bb:cc:dd:ee:ff".into()),
//!     chip_id: 0x1234_5678,
//!     platform: "linux-x86_64".into(),
//! };
//! let mut agent = NodeAgent::new(config, &identity)?;
//! loop {
//!     agent.tick().await;
//!     tokio::time::sleep(std::time::Duration::from_millis(250)).await;
//! }
//! # }
//! ```
//!
//! Credentials live in RAM only; a reboot re-earns them through the
//! protocol. See the module docs of [`agent`] for the tick contract and of
//! [`tunnel`] for the frame handling rules.

pub mod agent;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod host;
pub mod identity;
pub mod session;
pub mod state;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{NodeAgent, RegisteredObserver, SessionInvalidObserver, TunnelObserver};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, NodeConfig};
pub use error::NodeError;
pub use host::{LinkMonitor, Telemetry};
pub use identity::{capabilities_hash, DeviceIdentitySource, NodeIdentity, StaticIdentitySource};
pub use state::SessionState;
pub use tunnel::bridge::{RequestHandler, TunnelRequest, TunnelResponse};
