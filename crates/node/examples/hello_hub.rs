//! Minimal host loop: pair a node with a Hub and serve tunnel pings.
//!
//! ```text
//! HUB_URL=https://hub.example SLOT_ID=slot-1 cargo run --example hello_hub
//! ```

use std::time::Duration;

use hublink_node::{
    NodeAgent, NodeConfig, StaticIdentitySource, TunnelRequest, TunnelResponse,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let hub_url = std::env::var("HUB_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into());
    let slot_id = std::env::var("SLOT_ID").unwrap_or_else(|_| "slot-1".into());

    let mut config = NodeConfig::new(hub_url, slot_id);
    config.firmware_version = env!("CARGO_PKG_VERSION").into();
    config.capabilities = vec!["ping".into(), "status".into()];
    config.enable_self_approve = true;
    config.enable_node_registration = true;
    config.enable_tunnel = true;
    config.allow_insecure_tls = std::env::var("ALLOW_INSECURE_TLS").is_ok();

    let identity = StaticIdentitySource {
        mac: std::env::var("NODE_MAC").ok(),
        chip_id: 0x0042_1337,
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    };

    let mut agent = NodeAgent::new(config, &identity)?;
    agent.on_state_change(Box::new(|from, to| {
        tracing::info!(%from, %to, "state changed");
    }));
    agent.on_registered(Box::new(|node_id| {
        tracing::info!(node_id, "registered with hub");
    }));
    agent.set_request_handler(Box::new(|request: &TunnelRequest| {
        if request.method == "GET" && request.path == "/hello" {
            Some(TunnelResponse::json(200, r#"{"hello":"from the edge"}"#))
        } else {
            None
        }
    }));

    loop {
        agent.tick().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
