//! Neighbor lifecycle event fan-out.
//!
//! Grounded on `radicle::node::events::Events`: a cloneable broadcaster
//! that fans a single stream of events out to every subscriber, backed by
//! `crossbeam_channel` rather than a deep callback hierarchy.
use std::sync::Mutex;

use crossbeam_channel as chan;

use crate::ids::{AddressName, EndpointId};

/// A neighbor lifecycle event, as emitted by [`super::NeighborTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Found {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    Initiated {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    Connected {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    Failed {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    Disconnected {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    Lost {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
}

/// A subscriber's end of the event stream. Dropping it unsubscribes.
pub struct Subscription {
    receiver: chan::Receiver<Event>,
}

impl Subscription {
    pub fn recv(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Test convenience: block up to `millis` for the next event.
    pub fn recv_timeout_ms(&self, millis: u64) -> Option<Event> {
        self.receiver
            .recv_timeout(std::time::Duration::from_millis(millis))
            .ok()
    }
}

/// Multi-subscriber broadcaster. Subscribers registered earlier receive
/// events before subscribers registered later would have missed them —
/// all subscribers alive at publish time receive every event, in the
/// order it was published.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<chan::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = chan::unbounded();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        Subscription { receiver: rx }
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
