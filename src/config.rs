//! Tunable constants for the mesh overlay.
//!
//! Same shape as `service.rs`'s own block of `pub const` timing constants
//! (`IDLE_INTERVAL`, `GOSSIP_INTERVAL`, `STALE_CONNECTION_TIMEOUT`, ...):
//! one file, one `LocalDuration` constant per tunable, no configuration
//! struct needed since none of these are meant to vary at runtime.
use localtime::LocalDuration;

/// Hop budget handed to a freshly originated route discovery request.
pub const DEFAULT_HOPS: i32 = 10;

/// Time-to-live handed to a freshly originated route discovery request.
pub const DEFAULT_TTL: LocalDuration = LocalDuration::from_mins(5);

/// A route is no longer usable once this much time has passed since its
/// last recorded use.
pub const ROUTE_MAX_INACTIVITY: LocalDuration = LocalDuration::from_mins(12 * 60);

/// An outbound prekey bundle is not resent within this window of the last
/// one we sent, as long as a session still exists.
pub const DEBOUNCE_WINDOW: LocalDuration = LocalDuration::from_mins(90 * 24 * 60);

/// Period of the maintenance sweep that reaps stale route rows.
pub const PRUNE_INTERVAL: LocalDuration = LocalDuration::from_mins(30);
