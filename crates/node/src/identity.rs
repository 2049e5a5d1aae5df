//! Node identity derivation.
//!
//! The machine id and node name are derived once at construction from a
//! platform unique id and the configured prefixes, and are deterministic
//! across reboots for a given device. Nothing here is ever persisted — the
//! identity is recomputed the same way every boot.
//!
//! ## Derivation
//!
//! | Field | Source |
//! |-------|--------|
//! | `mac` | Platform MAC as reported (may be empty) |
//! | `machine_id` | `machine_id_prefix` + suffix |
//! | `node_name` | `node_name_prefix` + suffix |
//!
//! The suffix is the MAC in lowercase hex with colons stripped when
//! `use_mac_for_unique_id` is set and a MAC is available, otherwise the
//! platform chip id in hex. With `append_unique_suffix` unset the prefixes
//! are used verbatim (multi-device fleets then need distinct prefixes).

use crate::config::NodeConfig;

/// Platform identity primitives the host supplies.
///
/// Wi-Fi/MAC/chip-id access is platform glue and stays outside the core;
/// the host hands in whatever its board or OS can produce. Values must be
/// stable across reboots for identity derivation to hold.
pub trait DeviceIdentitySource: Send + Sync {
    /// Hardware MAC in `aa:bb:cc:dd:ee:ff` form, if the platform has one.
    fn mac(&self) -> Option<String>;
    /// Platform chip / machine unique id.
    fn chip_id(&self) -> u64;
    /// Platform name reported to the Hub (e.g. `"linux-x86_64"`).
    fn platform(&self) -> String;
}

/// Fixed identity values, for hosts that resolve them up front (and for
/// tests).
#[derive(Clone, Debug)]
pub struct StaticIdentitySource {
    pub mac: Option<String>,
    pub chip_id: u64,
    pub platform: String,
}

impl DeviceIdentitySource for StaticIdentitySource {
    fn mac(&self) -> Option<String> {
        self.mac.clone()
    }

    fn chip_id(&self) -> u64 {
        self.chip_id
    }

    fn platform(&self) -> String {
        self.platform.clone()
    }
}

/// Derived, cached node identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub mac: String,
    pub machine_id: String,
    pub node_name: String,
    pub platform: String,
}

impl NodeIdentity {
    /// Derives the identity once from config prefixes and platform values.
    pub fn derive(config: &NodeConfig, source: &dyn DeviceIdentitySource) -> Self {
        let mac = source.mac().unwrap_or_default();
        let suffix = if config.use_mac_for_unique_id && !mac.is_empty() {
            mac.to_ascii_lowercase().replace(':', "")
        } else {
            format!("{:08x}", source.chip_id())
        };

        let (machine_id, node_name) = if config.append_unique_suffix {
            (
                format!("{}{}", config.machine_id_prefix, suffix),
                format!("{}{}", config.node_name_prefix, suffix),
            )
        } else {
            (
                config.machine_id_prefix.clone(),
                config.node_name_prefix.clone(),
            )
        };

        Self {
            mac,
            machine_id,
            node_name,
            platform: source.platform(),
        }
    }
}

/// Stable fingerprint of the capability list: the Hub compares it across
/// heartbeats to detect inventory drift. Rolling `h = h*31 + byte` over the
/// concatenated capability strings, rendered as eight uppercase hex digits.
pub fn capabilities_hash(capabilities: &[String]) -> String {
    let mut hash: u32 = 0;
    for capability in capabilities {
        for byte in capability.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
        }
    }
    format!("{hash:08X}")
}
