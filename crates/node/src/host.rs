//! Host-supplied collaborator seams.
//!
//! Link bring-up and board telemetry are platform glue the core never
//! touches directly. The host passes implementations in at construction;
//! the defaults suit a plain always-connected process.

/// Reports whether the uplink (Wi-Fi, Ethernet, whatever the host rides)
/// is currently usable. Checked at the top of every tick.
pub trait LinkMonitor: Send + Sync {
    fn is_up(&self) -> bool;
}

/// Default link monitor for hosts whose connectivity is managed elsewhere.
pub struct AlwaysUp;

impl LinkMonitor for AlwaysUp {
    fn is_up(&self) -> bool {
        true
    }
}

/// Board telemetry reported in heartbeats. Defaults are zeros; hosts with
/// a radio or a meaningful allocator override what they can measure.
pub trait Telemetry: Send + Sync {
    fn rssi(&self) -> i32 {
        0
    }

    fn free_heap(&self) -> u64 {
        0
    }
}

/// Telemetry stub for hosts with nothing to report.
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {}
