//! Prometheus metrics for the relay.
//!
//! All metric name constants live here. Call sites use these constants
//! rather than raw strings to prevent typos and keep renaming centralized.
//! The exporter handle is installed at boot and rendered by `GET /metrics`.

use metrics::{counter, gauge};

use super::event::DispatchStatus;
use super::session::SessionRegistry;

// ---------------------------------------------------------------------------
// Dispatch metrics
// ---------------------------------------------------------------------------

/// Relay requests delivered to a live session (local or via fan-out).
pub const RELAY_DELIVERED: &str = "skerry_relay_delivered_total";
/// Relay requests parked in the offline queue.
pub const RELAY_QUEUED: &str = "skerry_relay_queued_total";
/// Relay requests shed on queue overflow.
pub const RELAY_DROPPED: &str = "skerry_relay_dropped_total";
/// Requests rejected before dispatch (label `kind`: error kind).
pub const RELAY_REJECTED: &str = "skerry_relay_rejected_total";
/// Envelopes handed back to reconnecting sessions via queue flush.
pub const QUEUE_FLUSHED: &str = "skerry_queue_flushed_envelopes_total";

// ---------------------------------------------------------------------------
// Fan-out metrics
// ---------------------------------------------------------------------------

/// Messages published onto the cross-instance bus.
pub const FANOUT_PUBLISHED: &str = "skerry_fanout_published_total";
/// Messages received from the cross-instance bus.
pub const FANOUT_RECEIVED: &str = "skerry_fanout_received_total";

// ---------------------------------------------------------------------------
// Session metrics
// ---------------------------------------------------------------------------

/// Currently connected transport sessions (gauge).
pub const SESSIONS_CONNECTED: &str = "skerry_sessions_connected";
/// Distinct identities with a local session (gauge).
pub const IDENTITIES_LOCAL: &str = "skerry_identities_online_local";

// ---------------------------------------------------------------------------
// Inline helpers used at call sites
// ---------------------------------------------------------------------------

/// Count one dispatch outcome.
#[inline]
pub fn dispatch_outcome(status: DispatchStatus) {
    let name = match status {
        DispatchStatus::Delivered => RELAY_DELIVERED,
        DispatchStatus::Queued => RELAY_QUEUED,
        DispatchStatus::Dropped => RELAY_DROPPED,
    };
    counter!(name).increment(1);
}

/// Count one rejected request by error kind label.
#[inline]
pub fn rejected(kind: &'static str) {
    counter!(RELAY_REJECTED, "kind" => kind).increment(1);
}

/// Count a fan-out publish.
#[inline]
pub fn fanout_published() {
    counter!(FANOUT_PUBLISHED).increment(1);
}

/// Count a fan-out receive.
#[inline]
pub fn fanout_received() {
    counter!(FANOUT_RECEIVED).increment(1);
}

/// Count envelopes returned by a queue flush.
#[inline]
pub fn queue_flushed(n: usize) {
    counter!(QUEUE_FLUSHED).increment(n as u64);
}

/// Refresh the session gauges from the registry.
#[inline]
pub fn refresh_session_gauges(registry: &SessionRegistry) {
    gauge!(SESSIONS_CONNECTED).set(registry.session_count() as f64);
    gauge!(IDENTITIES_LOCAL).set(registry.identity_count() as f64);
}
