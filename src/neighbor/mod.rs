//! Neighbor Table.
//!
//! Owns the per-endpoint connection state machine and the
//! `address_name <-> endpoint_id` mapping. Grounded on
//! `service::session::{Session, State}` for the state enum and its guarded
//! transitions, and on `radicle::node::events::Events` for the
//! multi-subscriber event fan-out (re-expressed here over
//! `crossbeam_channel`, one channel per subscriber, dispatched in
//! subscription order).
mod event;

pub use event::{Event, EventBus, Subscription};

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;

use crate::ids::{AddressName, EndpointId};

/// Connection state of a single neighbor link.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Discovered by the transport substrate but not yet connecting.
    Found,
    /// The remote peer asked to connect to us.
    InitiatedFromRemote,
    /// We asked the transport to connect to the remote peer.
    InitiatedFromHost,
    /// The connection handshake completed successfully.
    Connected,
}

/// A single neighbor link, owned exclusively by the [`NeighborTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborLink {
    pub endpoint_id: EndpointId,
    pub address_name: AddressName,
    pub status: Status,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("endpoint `{0}` is already connected")]
    AlreadyConnected(EndpointId),

    #[error("a connection to `{0}` was already initiated by the remote peer")]
    InitiatedFromRemote(AddressName),

    #[error("no endpoint has been discovered for `{0}`")]
    NoEndpointFor(AddressName),

    #[error("no such endpoint `{0}`")]
    NoSuchEndpoint(EndpointId),
}

#[derive(Default)]
struct Inner {
    links: HashMap<EndpointId, NeighborLink>,
    /// Secondary index: only holds endpoints whose status is not `Found`,
    /// enforcing the invariant that a given address maps to at most one
    /// non-`Found` endpoint at a time.
    by_address: HashMap<AddressName, EndpointId>,
}

/// Tracks the lifecycle of every direct neighbor link and exposes
/// `address_name <-> endpoint_id` lookups.
///
/// All mutations are serialized through a single lock; event dispatch
/// happens after the lock is released so that subscriber callbacks can
/// never re-enter it.
pub struct NeighborTable {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NeighborTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events: EventBus::new(),
        }
    }

    /// Subscribe to neighbor lifecycle events. Events are delivered to all
    /// subscribers in the order they occurred.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Look up the endpoint currently linked to `address_name`, if any
    /// (state `Found` is never returned, matching the `linked_endpoint`
    /// contract of an established or establishing link).
    pub fn linked_endpoint(&self, address_name: &AddressName) -> Option<EndpointId> {
        let inner = self.inner.lock().expect("neighbor table lock poisoned");
        inner.by_address.get(address_name).cloned()
    }

    /// The set of peers currently in state `Connected`.
    pub fn connected_neighbors(&self) -> HashSet<AddressName> {
        let inner = self.inner.lock().expect("neighbor table lock poisoned");
        inner
            .links
            .values()
            .filter(|l| l.status == Status::Connected)
            .map(|l| l.address_name.clone())
            .collect()
    }

    /// The endpoints currently in state `Connected`.
    pub fn connected_endpoints(&self) -> Vec<EndpointId> {
        let inner = self.inner.lock().expect("neighbor table lock poisoned");
        inner
            .links
            .values()
            .filter(|l| l.status == Status::Connected)
            .map(|l| l.endpoint_id.clone())
            .collect()
    }

    pub fn get(&self, endpoint_id: &EndpointId) -> Option<NeighborLink> {
        let inner = self.inner.lock().expect("neighbor table lock poisoned");
        inner.links.get(endpoint_id).cloned()
    }

    /// `∅|Found -> Found` on `endpoint_discovered`.
    pub fn endpoint_discovered(&self, endpoint_id: EndpointId, address_name: AddressName) {
        let event = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            inner.links.entry(endpoint_id.clone()).or_insert(NeighborLink {
                endpoint_id: endpoint_id.clone(),
                address_name: address_name.clone(),
                status: Status::Found,
            });
            Event::Found {
                endpoint_id,
                address_name,
            }
        };
        self.events.publish(event);
    }

    /// `∅|Found -> InitiatedFromRemote` on `connection_initiated`.
    pub fn connection_initiated(&self, endpoint_id: EndpointId, address_name: AddressName) {
        let event = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            inner.links.insert(
                endpoint_id.clone(),
                NeighborLink {
                    endpoint_id: endpoint_id.clone(),
                    address_name: address_name.clone(),
                    status: Status::InitiatedFromRemote,
                },
            );
            inner
                .by_address
                .insert(address_name.clone(), endpoint_id.clone());
            Event::Initiated {
                endpoint_id,
                address_name,
            }
        };
        self.events.publish(event);
    }

    /// `Found|∅ -> InitiatedFromHost` on explicit `request_connection`.
    /// Fails if the remote side is already driving the connection, or if
    /// it's already connected.
    pub fn request_connection(&self, address_name: &AddressName) -> Result<EndpointId, Error> {
        let (endpoint_id, event) = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            let endpoint_id = inner
                .links
                .values()
                .find(|l| &l.address_name == address_name)
                .map(|l| l.endpoint_id.clone())
                .ok_or_else(|| Error::NoEndpointFor(address_name.clone()))?;

            let link = inner.links.get_mut(&endpoint_id).expect("endpoint present");
            match link.status {
                Status::Connected => return Err(Error::AlreadyConnected(endpoint_id)),
                Status::InitiatedFromRemote => {
                    return Err(Error::InitiatedFromRemote(address_name.clone()))
                }
                Status::Found | Status::InitiatedFromHost => {
                    link.status = Status::InitiatedFromHost;
                }
            }
            inner
                .by_address
                .insert(address_name.clone(), endpoint_id.clone());

            (
                endpoint_id.clone(),
                Event::Initiated {
                    endpoint_id,
                    address_name: address_name.clone(),
                },
            )
        };
        self.events.publish(event);
        Ok(endpoint_id)
    }

    /// `Initiated* -> Connected` on `connection_result(success)`, or
    /// `Initiated*|Connected -> Found` on failure.
    pub fn connection_result(&self, endpoint_id: EndpointId, success: bool) {
        let event = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            let Some(link) = inner.links.get_mut(&endpoint_id) else {
                log::warn!(
                    target: "neighbor",
                    "connection_result for unknown endpoint {endpoint_id} (orphaned callback)"
                );
                return;
            };

            match (&link.status, success) {
                (Status::InitiatedFromHost | Status::InitiatedFromRemote, true) => {
                    link.status = Status::Connected;
                    Event::Connected {
                        endpoint_id: endpoint_id.clone(),
                        address_name: link.address_name.clone(),
                    }
                }
                (_, false) => {
                    let address_name = link.address_name.clone();
                    link.status = Status::Found;
                    inner.by_address.remove(&address_name);
                    Event::Failed {
                        endpoint_id: endpoint_id.clone(),
                        address_name,
                    }
                }
                (Status::Connected, true) | (Status::Found, true) => {
                    log::warn!(
                        target: "neighbor",
                        "connection_result(success) for endpoint {endpoint_id} not awaiting a result"
                    );
                    return;
                }
            }
        };
        self.events.publish(event);
    }

    pub fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
        let link = inner
            .links
            .get_mut(endpoint_id)
            .ok_or_else(|| Error::NoSuchEndpoint(endpoint_id.clone()))?;
        link.status = Status::InitiatedFromRemote;
        Ok(())
    }

    pub fn reject_connection(&self, endpoint_id: &EndpointId) {
        let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
        if let Some(link) = inner.links.remove(endpoint_id) {
            inner.by_address.remove(&link.address_name);
        }
    }

    /// `any -> ∅` on `endpoint_lost` (if not Connected) or `disconnected`.
    pub fn disconnect(&self, endpoint_id: EndpointId) {
        let event = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            let Some(link) = inner.links.remove(&endpoint_id) else {
                return;
            };
            inner.by_address.remove(&link.address_name);
            Event::Disconnected {
                endpoint_id,
                address_name: link.address_name,
            }
        };
        self.events.publish(event);
    }

    /// `any -> ∅` on `endpoint_lost`, but only if the link wasn't
    /// `Connected` — a connected link is only ever removed via
    /// [`NeighborTable::disconnect`].
    pub fn endpoint_lost(&self, endpoint_id: EndpointId) {
        let event = {
            let mut inner = self.inner.lock().expect("neighbor table lock poisoned");
            let Some(link) = inner.links.get(&endpoint_id) else {
                return;
            };
            if link.status == Status::Connected {
                return;
            }
            let link = inner.links.remove(&endpoint_id).expect("just checked");
            inner.by_address.remove(&link.address_name);
            Event::Lost {
                endpoint_id,
                address_name: link.address_name,
            }
        };
        self.events.publish(event);
    }
}
