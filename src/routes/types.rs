use crate::ids::{LocalNodeId, RequestUuid};

/// Created when this node originates or relays a discovery request;
/// destroyed when the discovery concludes (positive or terminal negative).
/// `previous_hop_local_id = None` marks the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequestEntry {
    pub request_uuid: RequestUuid,
    pub destination_local_id: LocalNodeId,
    pub previous_hop_local_id: Option<LocalNodeId>,
    /// `remaining_hops` as sent out for *this* node's broadcast of the
    /// request, recorded so the hop-count formula can be computed when a
    /// `RouteFound` response comes back.
    pub remaining_hops_at_send: i32,
    /// The request's own `max_ttl_epoch_ms`, carried over from the wire
    /// message so the `RequestAlreadyInProgress` wait bound can be enforced
    /// without a second lookup.
    pub max_ttl_epoch_ms: u64,
}

/// Composite-keyed on `(request_uuid, neighbor_local_id)`; tracks whether a
/// given neighbor's last response was `RequestAlreadyInProgress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStatusEntry {
    pub request_uuid: RequestUuid,
    pub neighbor_local_id: LocalNodeId,
    pub is_progress_pending: bool,
}

/// A route is *open* iff `next_hop_local_id` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub discovery_uuid: RequestUuid,
    pub destination_local_id: LocalNodeId,
    pub next_hop_local_id: Option<LocalNodeId>,
    pub previous_hop_local_id: Option<LocalNodeId>,
    pub hop_count: i32,
    /// Epoch milliseconds of the most recent use recorded against this
    /// route, or `None` if it has never been used.
    pub last_use_timestamp: Option<i64>,
}

impl RouteEntry {
    pub fn is_open(&self) -> bool {
        self.next_hop_local_id.is_some()
    }
}

/// One per application-level send using a route; cascade-deleted with the
/// route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUsage {
    pub usage_request_uuid: RequestUuid,
    pub route_entry_discovery_uuid: RequestUuid,
    pub previous_hop_local_id: Option<LocalNodeId>,
    pub last_used_timestamp: Option<i64>,
}

/// Records the *original* destination of a usage when the usage reuses an
/// already-open route for a different application-level destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUsageBacktracking {
    pub usage_uuid: RequestUuid,
    pub destination_local_id: LocalNodeId,
}
