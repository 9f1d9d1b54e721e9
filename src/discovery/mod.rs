//! Route Discovery Engine.
//!
//! The request/response state machine for flooding-based, on-demand
//! multi-hop routing. Grounded on `service::reactor::{Io, Reactor}` for the
//! "never perform state mutation inline" shape: every public entry point
//! mutates `routes` (the only mutable shared resource) and appends to an
//! outgoing `Io` queue instead of calling the transport directly.
pub mod message;

use std::collections::VecDeque;
use std::sync::Arc;

use localtime::LocalDuration;
use thiserror::Error;

use crate::clock::RefClock;
use crate::config;
use crate::ids::{AddressName, EndpointId, LocalNodeId, RequestUuid};
use crate::neighbor::NeighborTable;
use crate::registry::NodeRegistry;
use crate::routes::{self, RouteEntry, RouteRequestEntry, RouteUsage};

pub use message::{RouteRequestMessage, RouteResponseMessage, RouteStatus};

#[derive(Error, Debug)]
pub enum Error {
    /// Nothing to broadcast to at origin.
    #[error("no neighbors available to broadcast to")]
    NoNeighborsAvailable,

    /// `BroadcastStatusEntry` update with no parent `RouteRequestEntry`;
    /// the orphan row is logged and dropped.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    #[error("route table storage error: {0}")]
    Storage(#[from] routes::Error),

    #[error("node registry error: {0}")]
    Registry(String),
}

/// Output of a discovery state transition, consumed by the runtime and
/// handed to the transport / origin caller. Never produced by direct I/O
/// calls from inside [`Engine`].
#[derive(Debug, Clone)]
pub enum Io {
    SendRequest {
        to: EndpointId,
        message: RouteRequestMessage,
    },
    SendResponse {
        to: EndpointId,
        message: RouteResponseMessage,
    },
    /// Delivered once, to the node that originated `initiate_discovery`.
    RouteFound(RouteEntry),
    /// Delivered once, to the node that originated `initiate_discovery`.
    RouteNotFound {
        request_uuid: RequestUuid,
        status: RouteStatus,
    },
    /// Ask the runtime for a wakeup call to `handle_timeout` once this
    /// request's own TTL elapses, bounding the wait on
    /// `RequestAlreadyInProgress` peers.
    ScheduleTimeout {
        request_uuid: RequestUuid,
        after: LocalDuration,
    },
}

/// The request/response state machine for flooding-based route discovery,
/// parametrized over the persistent route store and the node registry
/// capability.
pub struct Engine<Rt, Rg> {
    local_address: AddressName,
    routes: Rt,
    registry: Rg,
    neighbors: Arc<NeighborTable>,
    clock: RefClock,
    io: VecDeque<Io>,
}

impl<Rt, Rg> Engine<Rt, Rg>
where
    Rt: routes::Store,
    Rg: NodeRegistry,
{
    pub fn new(
        local_address: AddressName,
        routes: Rt,
        registry: Rg,
        neighbors: Arc<NeighborTable>,
        clock: RefClock,
    ) -> Self {
        Self {
            local_address,
            routes,
            registry,
            neighbors,
            clock,
            io: VecDeque::new(),
        }
    }

    /// Drains every `Io` queued since the last call.
    pub fn drain_io(&mut self) -> impl Iterator<Item = Io> + '_ {
        self.io.drain(..)
    }

    fn now_ms(&self) -> u64 {
        self.clock.timestamp() * 1_000
    }

    fn resolve(&self, address_name: &AddressName) -> Result<LocalNodeId, Error> {
        self.registry
            .find_or_create(address_name)
            .map(|node| node.local_id)
            .map_err(|e| Error::Registry(e.to_string()))
    }

    fn endpoint_for_local_id(&self, local_id: LocalNodeId) -> Option<EndpointId> {
        self.neighbors.connected_endpoints().into_iter().find(|ep| {
            self.neighbors
                .get(ep)
                .and_then(|link| self.resolve(&link.address_name).ok())
                .map(|id| id == local_id)
                .unwrap_or(false)
        })
    }

    fn address_of(&self, endpoint_id: &EndpointId) -> Option<AddressName> {
        self.neighbors.get(endpoint_id).map(|link| link.address_name)
    }

    /// Broadcasts `message` to every connected neighbor except `exclude`,
    /// persisting a `BroadcastStatusEntry` per successful hand-off.
    /// Returns the number of neighbors broadcast to.
    fn broadcast(
        &mut self,
        request_uuid: RequestUuid,
        message: &RouteRequestMessage,
        exclude: Option<&EndpointId>,
    ) -> Result<usize, Error> {
        let mut count = 0;
        for endpoint_id in self.neighbors.connected_endpoints() {
            if Some(&endpoint_id) == exclude {
                continue;
            }
            let Some(address_name) = self.address_of(&endpoint_id) else {
                continue;
            };
            let neighbor_local_id = self.resolve(&address_name)?;

            self.routes.insert_broadcast(&request_uuid, neighbor_local_id)?;
            self.io.push_back(Io::SendRequest {
                to: endpoint_id,
                message: message.clone(),
            });
            count += 1;
        }
        Ok(count)
    }

    fn reply(&mut self, to: EndpointId, request_uuid: RequestUuid, status: RouteStatus) {
        self.io.push_back(Io::SendResponse {
            to,
            message: RouteResponseMessage {
                request_uuid,
                status,
            },
        });
    }

    /// Origin path: reuse a usable open route, or flood a fresh request.
    pub fn initiate_discovery(&mut self, destination: &AddressName) -> Result<(), Error> {
        let destination_local_id = self.resolve(destination)?;

        if let Some((route, last_used)) =
            self.routes.most_recent_opened_route_to(destination_local_id)?
        {
            let last_active = last_used.or(route.last_use_timestamp);
            let usable = route.is_open()
                && last_active
                    .map(|t| self.now_ms().saturating_sub(t as u64) <= config::ROUTE_MAX_INACTIVITY.as_secs() * 1_000)
                    .unwrap_or(false);
            if usable {
                // A usable open route produces no wire traffic at all.
                self.io.push_back(Io::RouteFound(route));
                return Ok(());
            }
            // Stale: fall through to a fresh discovery without deleting the row.
        }

        let request_uuid = RequestUuid::generate();
        let now_ms = self.now_ms();
        let max_ttl_epoch_ms = now_ms + config::DEFAULT_TTL.as_secs() * 1_000;

        self.routes.insert_request(RouteRequestEntry {
            request_uuid,
            destination_local_id,
            previous_hop_local_id: None,
            remaining_hops_at_send: config::DEFAULT_HOPS,
            max_ttl_epoch_ms,
        })?;

        let message = RouteRequestMessage {
            request_uuid,
            destination_address_name: destination.clone(),
            remaining_hops: config::DEFAULT_HOPS,
            max_ttl_epoch_ms,
        };

        let sent = self.broadcast(request_uuid, &message, None)?;
        if sent == 0 {
            self.routes.delete_request(&request_uuid)?;
            return Err(Error::NoNeighborsAvailable);
        }

        self.io.push_back(Io::ScheduleTimeout {
            request_uuid,
            after: config::DEFAULT_TTL,
        });
        Ok(())
    }

    /// Relay / destination path, executed atomically per `request_uuid`.
    pub fn handle_incoming_request(
        &mut self,
        sender: EndpointId,
        req: RouteRequestMessage,
    ) -> Result<(), Error> {
        let Some(sender_address) = self.address_of(&sender) else {
            log::warn!(target: "discovery", "route request from unlinked endpoint {sender}");
            return Ok(());
        };
        let sender_local_id = self.resolve(&sender_address)?;

        // Loop suppression must happen before the destination check.
        if self.routes.request(&req.request_uuid)?.is_some() {
            self.reply(sender, req.request_uuid, RouteStatus::RequestAlreadyInProgress);
            return Ok(());
        }

        if self.local_address == req.destination_address_name {
            self.reply(sender, req.request_uuid, RouteStatus::RouteFound);
            return Ok(());
        }

        let now_ms = self.now_ms();
        if req.max_ttl_epoch_ms < now_ms {
            self.reply(sender, req.request_uuid, RouteStatus::TtlExpired);
            return Ok(());
        }

        if req.remaining_hops <= 0 {
            self.reply(sender, req.request_uuid, RouteStatus::MaxHopsReached);
            return Ok(());
        }

        let destination_local_id = self.resolve(&req.destination_address_name)?;
        self.routes.insert_request(RouteRequestEntry {
            request_uuid: req.request_uuid,
            destination_local_id,
            previous_hop_local_id: Some(sender_local_id),
            remaining_hops_at_send: req.remaining_hops - 1,
            max_ttl_epoch_ms: req.max_ttl_epoch_ms,
        })?;

        let relayed = RouteRequestMessage {
            request_uuid: req.request_uuid,
            destination_address_name: req.destination_address_name.clone(),
            remaining_hops: req.remaining_hops - 1,
            max_ttl_epoch_ms: req.max_ttl_epoch_ms,
        };

        let sent = self.broadcast(req.request_uuid, &relayed, Some(&sender))?;
        if sent == 0 {
            self.reply(sender, req.request_uuid, RouteStatus::NoRouteFound);
            self.routes.delete_request(&req.request_uuid)?;
            return Ok(());
        }

        self.io.push_back(Io::ScheduleTimeout {
            request_uuid: req.request_uuid,
            after: LocalDuration::from_secs(req.max_ttl_epoch_ms.saturating_sub(now_ms) / 1_000),
        });
        Ok(())
    }

    /// Response handling for a single returned `RouteStatus`.
    pub fn handle_incoming_response(
        &mut self,
        sender: EndpointId,
        resp: RouteResponseMessage,
    ) -> Result<(), Error> {
        let Some(sender_address) = self.address_of(&sender) else {
            log::warn!(target: "discovery", "route response from unlinked endpoint {sender}");
            return Ok(());
        };
        let sender_local_id = self.resolve(&sender_address)?;

        let Some(req) = self.routes.request(&resp.request_uuid)? else {
            // Late or duplicate response; the request already resolved.
            // Idempotently ignored.
            return Ok(());
        };

        match resp.status {
            RouteStatus::RouteFound => self.handle_route_found(req, resp.request_uuid, sender_local_id),
            RouteStatus::RequestAlreadyInProgress => {
                self.routes
                    .set_broadcast_pending(&resp.request_uuid, sender_local_id, true)?;
                Ok(())
            }
            status if status.is_terminal_negative() => {
                self.handle_terminal_negative(req, resp.request_uuid, sender_local_id, status)
            }
            _ => Ok(()),
        }
    }

    fn handle_route_found(
        &mut self,
        req: RouteRequestEntry,
        request_uuid: RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), Error> {
        self.routes.delete_broadcast(&request_uuid, neighbor_local_id)?;

        // `remaining_hops_at_send` of 0 implies a hop count of
        // DEFAULT_HOPS + 1; clamp so an off-by-one relay never installs a
        // route deeper than DEFAULT_HOPS.
        let hop_count = (config::DEFAULT_HOPS - req.remaining_hops_at_send + 1).min(config::DEFAULT_HOPS);
        let now_ms = self.now_ms() as i64;

        let route = RouteEntry {
            discovery_uuid: request_uuid,
            destination_local_id: req.destination_local_id,
            next_hop_local_id: Some(neighbor_local_id),
            previous_hop_local_id: req.previous_hop_local_id,
            hop_count,
            last_use_timestamp: Some(now_ms),
        };
        self.routes.insert_route(route.clone())?;
        self.routes.insert_usage(RouteUsage {
            usage_request_uuid: RequestUuid::generate(),
            route_entry_discovery_uuid: request_uuid,
            previous_hop_local_id: req.previous_hop_local_id,
            last_used_timestamp: Some(now_ms),
        })?;
        self.routes.delete_request(&request_uuid)?;

        match req.previous_hop_local_id.and_then(|id| self.endpoint_for_local_id(id)) {
            Some(endpoint_id) => self.reply(endpoint_id, request_uuid, RouteStatus::RouteFound),
            None => self.io.push_back(Io::RouteFound(route)),
        }
        Ok(())
    }

    fn handle_terminal_negative(
        &mut self,
        req: RouteRequestEntry,
        request_uuid: RequestUuid,
        neighbor_local_id: LocalNodeId,
        status: RouteStatus,
    ) -> Result<(), Error> {
        self.routes.delete_broadcast(&request_uuid, neighbor_local_id)?;

        let remaining = self.routes.count_broadcasts(&request_uuid)?;
        if remaining > 0 {
            return Ok(());
        }
        if self.routes.has_pending_in_progress(&request_uuid, true)? {
            return Ok(());
        }
        self.finalize_negative(req, request_uuid, status)
    }

    fn finalize_negative(
        &mut self,
        req: RouteRequestEntry,
        request_uuid: RequestUuid,
        status: RouteStatus,
    ) -> Result<(), Error> {
        match req.previous_hop_local_id.and_then(|id| self.endpoint_for_local_id(id)) {
            Some(endpoint_id) => self.reply(endpoint_id, request_uuid, status),
            None => self.io.push_back(Io::RouteNotFound { request_uuid, status }),
        }
        self.routes.delete_request(&request_uuid)?;
        Ok(())
    }

    /// Called by the runtime when a previously scheduled
    /// [`Io::ScheduleTimeout`] fires. No-op if the request already
    /// resolved. Otherwise this is the safety net that bounds the wait on
    /// `RequestAlreadyInProgress` peers to the request's own TTL.
    pub fn handle_timeout(&mut self, request_uuid: RequestUuid) -> Result<(), Error> {
        let Some(req) = self.routes.request(&request_uuid)? else {
            return Ok(());
        };
        if self.now_ms() < req.max_ttl_epoch_ms {
            return Ok(());
        }
        self.finalize_negative(req, request_uuid, RouteStatus::NoRouteFound)
    }

    /// Maintenance sweep: reaps routes whose newest usage predates
    /// `ROUTE_MAX_INACTIVITY`. Does not affect in-flight discoveries, only
    /// already-resolved `RouteEntry` rows.
    pub fn reap_stale_routes(&mut self) -> Result<Vec<RequestUuid>, Error> {
        let threshold = (self.now_ms() as i64) - (config::ROUTE_MAX_INACTIVITY.as_secs() as i64 * 1_000);
        Ok(self.routes.reap_stale_routes(threshold)?)
    }
}
