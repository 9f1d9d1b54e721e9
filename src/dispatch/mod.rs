//! Message Dispatcher.
//!
//! Maps a single `(destination, plaintext)` application send to either
//! direct-neighbor delivery or a route discovered by the routing engine,
//! and drives the resend/ACK lifecycle of everything it hands to the
//! transport. Same `Io`-queue shape as [`crate::discovery`]: every public
//! entry point mutates `store` (backed by [`store::Table`]) and appends to
//! an outgoing queue instead of calling the transport or the discovery
//! engine directly.
mod store;
mod types;

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel as chan;
use prost::Message as _;
use thiserror::Error;

use crate::clock::RefClock;
use crate::envelope::{self, Envelope, SessionCipher};
use crate::ids::{AddressName, AppMessageId, EndpointId, LocalNodeId};
use crate::neighbor::NeighborTable;
use crate::registry::NodeRegistry;
use crate::routes;
use crate::wire::proto;

pub use store::{Store, Table};
pub use types::{OutboundMessage, OutboundStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("outbound message storage error: {0}")]
    Storage(String),
    #[error("route table storage error: {0}")]
    Routes(#[from] routes::Error),
    #[error("envelope error: {0}")]
    Envelope(#[from] envelope::Error),
    #[error("node registry error: {0}")]
    Registry(String),
    #[error("malformed message ack")]
    InvalidAck,
}

/// A plaintext application body received from a neighbor or relay, handed
/// up to whatever owns the chat UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: AddressName,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Io {
    Transmit {
        endpoint_id: EndpointId,
        envelope_bytes: Vec<u8>,
        /// Set when this transmission carries (or piggybacks) a specific
        /// outbound application message, so the runtime can correlate the
        /// transport's accepted `PayloadId` back via
        /// [`Dispatcher::on_transport_accepted`].
        app_message_id: Option<AppMessageId>,
    },
    /// No neighbor or open route to `destination` exists yet; the runtime
    /// is expected to drive `discovery::Engine::initiate_discovery` and
    /// call [`Dispatcher::on_route_found`] once it resolves.
    RequestDiscovery {
        destination: AddressName,
    },
    Received(IncomingMessage),
    DeliveryUpdated {
        app_message_id: AppMessageId,
        status: OutboundStatus,
    },
}

/// A command submitted through a [`Handle`], mirroring [`Dispatcher`]'s own
/// public operations for callers on another thread.
#[derive(Debug, Clone)]
pub enum Command {
    Send {
        destination: AddressName,
        payload: Vec<u8>,
    },
    RouteFound {
        destination: AddressName,
    },
    AckDelivered {
        app_message_id: AppMessageId,
    },
    AckRead {
        app_message_id: AppMessageId,
    },
    SendDeliveredAck {
        to: AddressName,
        app_message_id: AppMessageId,
    },
    SendReadAck {
        to: AddressName,
        app_message_id: AppMessageId,
    },
}

/// A cheaply cloned submission point for [`Dispatcher`] commands, one
/// method per [`Command`] variant, the same shape as `client::handle`'s
/// typed wrapper around a `crossbeam_channel::Sender`.
#[derive(Clone)]
pub struct Handle(chan::Sender<Command>);

impl Handle {
    pub fn send(&self, destination: AddressName, payload: Vec<u8>) {
        let _ = self.0.send(Command::Send { destination, payload });
    }

    pub fn route_found(&self, destination: AddressName) {
        let _ = self.0.send(Command::RouteFound { destination });
    }

    pub fn ack_delivered(&self, app_message_id: AppMessageId) {
        let _ = self.0.send(Command::AckDelivered { app_message_id });
    }

    pub fn ack_read(&self, app_message_id: AppMessageId) {
        let _ = self.0.send(Command::AckRead { app_message_id });
    }

    /// Tell the peer `to` arrived from that we received `app_message_id`.
    pub fn send_delivered_ack(&self, to: AddressName, app_message_id: AppMessageId) {
        let _ = self.0.send(Command::SendDeliveredAck { to, app_message_id });
    }

    /// Tell the peer `to` arrived from that we read `app_message_id`.
    pub fn send_read_ack(&self, to: AddressName, app_message_id: AppMessageId) {
        let _ = self.0.send(Command::SendReadAck { to, app_message_id });
    }
}

/// The send/resend/ACK state machine for application messages, parametrized
/// over the outbound store, the route store, the node registry and the
/// Signal capability.
pub struct Dispatcher<St, Rt, Rg, C, S> {
    local_address: AddressName,
    store: St,
    routes: Rt,
    registry: Rg,
    envelope: Envelope<C, S>,
    neighbors: Arc<NeighborTable>,
    clock: RefClock,
    io: VecDeque<Io>,
    commands: (chan::Sender<Command>, chan::Receiver<Command>),
}

impl<St, Rt, Rg, C, S> Dispatcher<St, Rt, Rg, C, S>
where
    St: Store,
    Rt: routes::Store,
    Rg: NodeRegistry,
    C: SessionCipher,
    S: envelope::KeyExchangeStore,
{
    pub fn new(
        local_address: AddressName,
        store: St,
        routes: Rt,
        registry: Rg,
        envelope: Envelope<C, S>,
        neighbors: Arc<NeighborTable>,
        clock: RefClock,
    ) -> Self {
        Self {
            local_address,
            store,
            routes,
            registry,
            envelope,
            neighbors,
            clock,
            io: VecDeque::new(),
            commands: chan::unbounded(),
        }
    }

    /// A cloneable handle other threads use to submit commands, drained by
    /// [`Dispatcher::drain_commands`].
    pub fn handle(&self) -> Handle {
        Handle(self.commands.0.clone())
    }

    /// Applies every command submitted through a [`Handle`] since the last
    /// call.
    pub fn drain_commands(&mut self) -> Result<(), Error> {
        while let Ok(command) = self.commands.1.try_recv() {
            match command {
                Command::Send { destination, payload } => {
                    self.send(&destination, payload)?;
                }
                Command::RouteFound { destination } => self.on_route_found(&destination)?,
                Command::AckDelivered { app_message_id } => {
                    self.mark_status(app_message_id, OutboundStatus::Delivered)?
                }
                Command::AckRead { app_message_id } => {
                    self.mark_status(app_message_id, OutboundStatus::Read)?
                }
                Command::SendDeliveredAck { to, app_message_id } => {
                    self.send_delivered_ack(&to, app_message_id)?
                }
                Command::SendReadAck { to, app_message_id } => {
                    self.send_read_ack(&to, app_message_id)?
                }
            }
        }
        Ok(())
    }

    fn mark_status(&mut self, app_message_id: AppMessageId, status: OutboundStatus) -> Result<(), Error> {
        if self.store.get(&app_message_id).map_err(Self::store_err)?.is_some() {
            self.store.set_status(&app_message_id, status).map_err(Self::store_err)?;
            self.io.push_back(Io::DeliveryUpdated { app_message_id, status });
        }
        Ok(())
    }

    /// Drains every `Io` queued since the last call.
    pub fn drain_io(&mut self) -> impl Iterator<Item = Io> + '_ {
        self.io.drain(..)
    }

    fn now_ms(&self) -> i64 {
        self.clock.timestamp() as i64 * 1_000
    }

    fn store_err(e: store::Error) -> Error {
        Error::Storage(e.to_string())
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

    /// The endpoint to physically hand wire bytes to for `destination`:
    /// its own endpoint if directly connected, otherwise the `next_hop` of
    /// the most recently opened usable route.
    fn next_hop_endpoint(&self, destination: &AddressName) -> Result<Option<EndpointId>, Error> {
        if let Some(endpoint_id) = self.neighbors.linked_endpoint(destination) {
            return Ok(Some(endpoint_id));
        }

        let destination_local_id = self.resolve(destination)?;
        let Some((route, _)) = self.routes.most_recent_opened_route_to(destination_local_id)?
        else {
            return Ok(None);
        };
        if !route.is_open() {
            return Ok(None);
        }
        Ok(route
            .next_hop_local_id
            .and_then(|id| self.endpoint_for_local_id(id)))
    }

    /// Stages `payload` for `destination` and, if a neighbor or route is
    /// already available, attempts delivery immediately. Returns the
    /// application message id the caller tracks ACKs against.
    pub fn send(&mut self, destination: &AddressName, payload: Vec<u8>) -> Result<AppMessageId, Error> {
        let app_message_id = AppMessageId::new(uuid::Uuid::new_v4().to_string());
        self.store
            .insert(OutboundMessage {
                app_message_id: app_message_id.clone(),
                destination: destination.clone(),
                status: OutboundStatus::Pending,
                plaintext: payload,
                payload_id: None,
                created_at: self.now_ms(),
            })
            .map_err(Self::store_err)?;

        match self.next_hop_endpoint(destination)? {
            Some(endpoint_id) => self.attempt_delivery(&app_message_id, destination, endpoint_id)?,
            None => self.io.push_back(Io::RequestDiscovery {
                destination: destination.clone(),
            }),
        }
        Ok(app_message_id)
    }

    /// Wraps the currently stored plaintext for `app_message_id` via the
    /// envelope and queues it for transmission to `endpoint_id`.
    fn attempt_delivery(
        &mut self,
        app_message_id: &AppMessageId,
        destination: &AddressName,
        endpoint_id: EndpointId,
    ) -> Result<(), Error> {
        let Some(record) = self.store.get(app_message_id).map_err(Self::store_err)? else {
            return Ok(());
        };

        let body = proto::NearbyMessageBody {
            r#type: proto::MessageType::EncryptedMessage as i32,
            encrypted_data: record.plaintext,
        };

        match self.envelope.wrap(destination, body) {
            Ok(envelope_bytes) => {
                self.store
                    .set_status(app_message_id, OutboundStatus::Pending)
                    .map_err(Self::store_err)?;
                self.io.push_back(Io::Transmit {
                    endpoint_id,
                    envelope_bytes,
                    app_message_id: Some(app_message_id.clone()),
                });
                Ok(())
            }
            Err(envelope::Error::NoSession(_)) => {
                self.store
                    .set_status(app_message_id, OutboundStatus::PendingKeyExchange)
                    .map_err(Self::store_err)?;
                if let Some(bundle) = self.envelope.ensure_session(destination)? {
                    self.io.push_back(Io::Transmit {
                        endpoint_id,
                        envelope_bytes: Envelope::<C, S>::wrap_key_exchange(bundle),
                        app_message_id: Some(app_message_id.clone()),
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.store
                    .set_status(app_message_id, OutboundStatus::Failed)
                    .map_err(Self::store_err)?;
                Err(Error::Envelope(e))
            }
        }
    }

    /// Called by the runtime once the transport accepts a send, persisting
    /// the transport's `payload_id` against the application message.
    pub fn on_transport_accepted(
        &mut self,
        app_message_id: &AppMessageId,
        payload_id: crate::ids::PayloadId,
    ) -> Result<(), Error> {
        self.store
            .set_payload_id(app_message_id, &payload_id)
            .map_err(Self::store_err)
    }

    /// Called by the runtime when the transport rejects a send.
    pub fn on_transport_failed(&mut self, app_message_id: &AppMessageId) -> Result<(), Error> {
        self.store
            .set_status(app_message_id, OutboundStatus::Failed)
            .map_err(Self::store_err)?;
        self.io.push_back(Io::DeliveryUpdated {
            app_message_id: app_message_id.clone(),
            status: OutboundStatus::Failed,
        });
        Ok(())
    }

    /// Re-drives every `Failed`/`Pending`/`PendingKeyExchange` message for
    /// `destination`. Called by the runtime on `SessionEstablished` and on
    /// a freshly discovered route, whichever unblocks delivery.
    pub fn retry_undelivered(&mut self, destination: &AddressName) -> Result<(), Error> {
        let Some(endpoint_id) = self.next_hop_endpoint(destination)? else {
            return Ok(());
        };
        let pending = self
            .store
            .undelivered_for_destination(destination)
            .map_err(Self::store_err)?;
        for record in pending {
            self.attempt_delivery(&record.app_message_id, destination, endpoint_id.clone())?;
        }
        Ok(())
    }

    /// A prekey bundle exchange with `address` just completed.
    pub fn on_session_established(&mut self, address: &AddressName) -> Result<(), Error> {
        self.retry_undelivered(address)
    }

    /// A route to `destination` was just discovered (or reused).
    pub fn on_route_found(&mut self, destination: &AddressName) -> Result<(), Error> {
        self.retry_undelivered(destination)
    }

    /// Sends a `MESSAGE_DELIVERED_ACK` for `app_message_id` to `to`. Unlike
    /// an application send, an ack carries no outbound record of its own:
    /// it is a best-effort, one-shot transmission, not persisted or
    /// retried, and dropped if no neighbor or route to `to` exists yet.
    pub fn send_delivered_ack(&mut self, to: &AddressName, app_message_id: AppMessageId) -> Result<(), Error> {
        self.send_ack(to, app_message_id, proto::MessageType::MessageDeliveredAck)
    }

    /// Sends a `MESSAGE_READ_ACK` for `app_message_id` to `to`.
    pub fn send_read_ack(&mut self, to: &AddressName, app_message_id: AppMessageId) -> Result<(), Error> {
        self.send_ack(to, app_message_id, proto::MessageType::MessageReadAck)
    }

    fn send_ack(
        &mut self,
        to: &AddressName,
        app_message_id: AppMessageId,
        ack_type: proto::MessageType,
    ) -> Result<(), Error> {
        let Some(endpoint_id) = self.next_hop_endpoint(to)? else {
            log::debug!(target: "dispatch", "no route to {to} yet, dropping {ack_type:?} for {app_message_id}");
            return Ok(());
        };

        let ack = proto::MessageAck {
            app_message_id: app_message_id.as_str().to_string(),
            ack_type: ack_type as i32,
        };
        let body = proto::NearbyMessageBody {
            r#type: ack_type as i32,
            encrypted_data: ack.encode_to_vec(),
        };

        match self.envelope.wrap(to, body) {
            Ok(envelope_bytes) => {
                self.io.push_back(Io::Transmit {
                    endpoint_id,
                    envelope_bytes,
                    app_message_id: None,
                });
                Ok(())
            }
            Err(envelope::Error::NoSession(_)) => {
                if let Some(bundle) = self.envelope.ensure_session(to)? {
                    self.io.push_back(Io::Transmit {
                        endpoint_id,
                        envelope_bytes: Envelope::<C, S>::wrap_key_exchange(bundle),
                        app_message_id: None,
                    });
                }
                Ok(())
            }
            Err(e) => Err(Error::Envelope(e)),
        }
    }

    /// Unwraps an inbound `NearbyMessage` payload from `sender` and reacts
    /// to whatever it decrypts to: an ACK updates outbound state, a key
    /// exchange is handled by the envelope itself, and an application body
    /// is surfaced via `Io::Received`.
    pub fn handle_incoming(&mut self, sender: &AddressName, bytes: &[u8]) -> Result<(), Error> {
        match self.envelope.unwrap(sender, bytes)? {
            envelope::Received::KeyExchange { reply_bundle } => {
                if let Some(endpoint_id) = self.neighbors.linked_endpoint(sender) {
                    if let Some(bundle) = reply_bundle {
                        self.io.push_back(Io::Transmit {
                            endpoint_id,
                            envelope_bytes: Envelope::<C, S>::wrap_key_exchange(bundle),
                            app_message_id: None,
                        });
                    }
                }
                self.on_session_established(sender)
            }
            envelope::Received::Body(body) => self.handle_body(sender, body),
        }
    }

    fn handle_body(&mut self, sender: &AddressName, body: proto::NearbyMessageBody) -> Result<(), Error> {
        match proto::MessageType::try_from(body.r#type).unwrap_or(proto::MessageType::Unknown) {
            proto::MessageType::MessageDeliveredAck => {
                self.handle_ack(&body.encrypted_data, OutboundStatus::Delivered)
            }
            proto::MessageType::MessageReadAck => {
                self.handle_ack(&body.encrypted_data, OutboundStatus::Read)
            }
            proto::MessageType::EncryptedMessage => {
                self.io.push_back(Io::Received(IncomingMessage {
                    from: sender.clone(),
                    payload: body.encrypted_data,
                }));
                Ok(())
            }
            other => {
                log::warn!(
                    target: "dispatch",
                    "unhandled nearby message body type {other:?} from {sender}"
                );
                Ok(())
            }
        }
    }

    /// Idempotent: an unknown or already-terminal `app_message_id` is
    /// silently ignored, matching the "duplicate ACKs are no-ops" contract.
    fn handle_ack(&mut self, bytes: &[u8], status: OutboundStatus) -> Result<(), Error> {
        let ack = proto::MessageAck::decode(bytes).map_err(|_| Error::InvalidAck)?;
        self.mark_status(AppMessageId::new(ack.app_message_id), status)
    }
}

#[cfg(test)]
mod tests {
    use localtime::LocalTime;
    use prost::Message as _;

    use super::*;
    use crate::envelope::fake::FakeSessionCipher;
    use crate::envelope::key_exchange;
    use crate::ids::EndpointId;
    use crate::registry::Node;
    use crate::routes::Table as RouteTable;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        next_id: AtomicI64,
        by_name: Mutex<std::collections::HashMap<AddressName, LocalNodeId>>,
    }

    impl NodeRegistry for FakeRegistry {
        type Error = std::convert::Infallible;

        fn find_or_create(&self, address_name: &AddressName) -> Result<Node, Self::Error> {
            let mut map = self.by_name.lock().unwrap();
            let local_id = *map
                .entry(address_name.clone())
                .or_insert_with(|| LocalNodeId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
            Ok(Node {
                local_id,
                address_name: address_name.clone(),
            })
        }

        fn find_by_local_id(&self, local_id: LocalNodeId) -> Result<Option<Node>, Self::Error> {
            let map = self.by_name.lock().unwrap();
            Ok(map.iter().find(|(_, id)| **id == local_id).map(|(name, id)| Node {
                local_id: *id,
                address_name: name.clone(),
            }))
        }
    }

    type TestDispatcher = Dispatcher<Table, RouteTable, FakeRegistry, FakeSessionCipher, key_exchange::Table>;

    fn dispatcher(local_address: &str) -> TestDispatcher {
        Dispatcher::new(
            AddressName::new(local_address),
            Table::memory().unwrap(),
            RouteTable::memory().unwrap(),
            FakeRegistry::default(),
            Envelope::new(
                FakeSessionCipher::default(),
                key_exchange::Table::memory().unwrap(),
                RefClock::from(LocalTime::from_secs(1_700_000_000)),
            ),
            Arc::new(NeighborTable::new()),
            RefClock::from(LocalTime::from_secs(1_700_000_000)),
        )
    }

    fn connect(d: &TestDispatcher, endpoint: &str, address: &str) {
        d.neighbors
            .endpoint_discovered(EndpointId::new(endpoint), AddressName::new(address));
        d.neighbors
            .connection_initiated(EndpointId::new(endpoint), AddressName::new(address));
        d.neighbors.connection_result(EndpointId::new(endpoint), true);
    }

    #[test]
    fn send_with_no_neighbor_or_route_requests_discovery() {
        let mut d = dispatcher("a");
        let id = d.send(&AddressName::new("z"), b"hi".to_vec()).unwrap();

        let io: Vec<_> = d.drain_io().collect();
        assert!(matches!(&io[0], Io::RequestDiscovery { destination } if *destination == AddressName::new("z")));

        let record = d.store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, OutboundStatus::Pending);
    }

    #[test]
    fn send_to_a_connected_neighbor_without_a_session_stages_key_exchange() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");

        let id = d.send(&AddressName::new("b"), b"hi".to_vec()).unwrap();
        let io: Vec<_> = d.drain_io().collect();

        assert!(matches!(io[0], Io::Transmit { .. }), "bundle must go out");
        assert_eq!(
            d.store.get(&id).unwrap().unwrap().status,
            OutboundStatus::PendingKeyExchange
        );
    }

    #[test]
    fn send_to_a_connected_neighbor_with_a_session_transmits_immediately() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        d.envelope
            .ensure_session(&AddressName::new("b"))
            .unwrap();
        d.envelope
            .unwrap(
                &AddressName::new("b"),
                &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(
                    b"bob-bundle".to_vec(),
                ),
            )
            .unwrap();

        let id = d.send(&AddressName::new("b"), b"hi".to_vec()).unwrap();
        let io: Vec<_> = d.drain_io().collect();

        assert!(matches!(io[0], Io::Transmit { .. }));
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Pending);
    }

    #[test]
    fn on_session_established_redrives_a_staged_message() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        let bob = AddressName::new("b");

        let id = d.send(&bob, b"hi".to_vec()).unwrap();
        d.drain_io().count();
        assert_eq!(
            d.store.get(&id).unwrap().unwrap().status,
            OutboundStatus::PendingKeyExchange
        );

        d.envelope
            .unwrap(
                &bob,
                &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(
                    b"bob-bundle".to_vec(),
                ),
            )
            .unwrap();
        d.on_session_established(&bob).unwrap();

        let io: Vec<_> = d.drain_io().collect();
        assert!(io.iter().any(|io| matches!(io, Io::Transmit { .. })));
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Pending);
    }

    #[test]
    fn delivered_ack_updates_status_and_is_idempotent() {
        let mut d = dispatcher("a");
        let id = d.send(&AddressName::new("z"), b"hi".to_vec()).unwrap();
        d.drain_io().count();

        let ack = proto::MessageAck {
            app_message_id: id.to_string(),
            ack_type: proto::MessageType::MessageDeliveredAck as i32,
        }
        .encode_to_vec();
        d.handle_ack(&ack, OutboundStatus::Delivered).unwrap();
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Delivered);

        // A duplicate ack is a no-op, not an error.
        d.handle_ack(&ack, OutboundStatus::Delivered).unwrap();
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Delivered);
    }

    #[test]
    fn ack_for_unknown_message_id_is_silently_ignored() {
        let mut d = dispatcher("a");
        let ack = proto::MessageAck {
            app_message_id: "does-not-exist".to_string(),
            ack_type: proto::MessageType::MessageReadAck as i32,
        }
        .encode_to_vec();
        d.handle_ack(&ack, OutboundStatus::Read).unwrap();
    }

    #[test]
    fn handle_send_is_applied_on_the_next_drain_commands() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        d.envelope.ensure_session(&AddressName::new("b")).unwrap();
        d.envelope
            .unwrap(
                &AddressName::new("b"),
                &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(
                    b"bob-bundle".to_vec(),
                ),
            )
            .unwrap();

        let handle = d.handle();
        handle.send(AddressName::new("b"), b"hi".to_vec());
        // Nothing happens until the owning thread drains.
        assert!(d.drain_io().next().is_none());

        d.drain_commands().unwrap();
        let io: Vec<_> = d.drain_io().collect();
        assert!(matches!(io[0], Io::Transmit { .. }));
    }

    #[test]
    fn handle_ack_delivered_and_ack_read_update_status_through_drain_commands() {
        let mut d = dispatcher("a");
        let id = d.send(&AddressName::new("z"), b"hi".to_vec()).unwrap();
        d.drain_io().count();

        let handle = d.handle();
        handle.ack_delivered(id.clone());
        d.drain_commands().unwrap();
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Delivered);
        assert!(matches!(
            d.drain_io().next(),
            Some(Io::DeliveryUpdated { status: OutboundStatus::Delivered, .. })
        ));

        handle.ack_read(id.clone());
        d.drain_commands().unwrap();
        assert_eq!(d.store.get(&id).unwrap().unwrap().status, OutboundStatus::Read);
    }

    #[test]
    fn send_delivered_ack_transmits_to_a_connected_neighbor() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        let bob = AddressName::new("b");
        let bundle = d.envelope.ensure_session(&bob).unwrap().unwrap();
        d.envelope
            .unwrap(&bob, &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(bundle))
            .unwrap();
        d.drain_io().count();

        d.send_delivered_ack(&bob, AppMessageId::new("their-message")).unwrap();
        let io: Vec<_> = d.drain_io().collect();
        assert!(matches!(io[0], Io::Transmit { app_message_id: None, .. }));
    }

    #[test]
    fn send_read_ack_with_no_route_is_silently_dropped() {
        let mut d = dispatcher("a");
        d.send_read_ack(&AddressName::new("nobody"), AppMessageId::new("m")).unwrap();
        assert!(d.drain_io().next().is_none());
    }

    #[test]
    fn handle_send_delivered_ack_and_send_read_ack_through_drain_commands() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        let bob = AddressName::new("b");
        let bundle = d.envelope.ensure_session(&bob).unwrap().unwrap();
        d.envelope
            .unwrap(&bob, &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(bundle))
            .unwrap();
        d.drain_io().count();

        let handle = d.handle();
        handle.send_delivered_ack(bob.clone(), AppMessageId::new("m1"));
        d.drain_commands().unwrap();
        assert!(matches!(d.drain_io().next(), Some(Io::Transmit { .. })));

        handle.send_read_ack(bob, AppMessageId::new("m2"));
        d.drain_commands().unwrap();
        assert!(matches!(d.drain_io().next(), Some(Io::Transmit { .. })));
    }

    #[test]
    fn handle_route_found_redrives_a_message_blocked_on_discovery() {
        let mut d = dispatcher("a");
        let id = d.send(&AddressName::new("b"), b"hi".to_vec()).unwrap();
        d.drain_io().count();
        connect(&d, "ab", "b");

        d.handle().route_found(AddressName::new("b"));
        d.drain_commands().unwrap();

        let io: Vec<_> = d.drain_io().collect();
        assert!(io.iter().any(|io| matches!(io, Io::Transmit { .. })));
        assert_eq!(
            d.store.get(&id).unwrap().unwrap().status,
            OutboundStatus::PendingKeyExchange
        );
    }

    #[test]
    fn incoming_encrypted_body_surfaces_as_received() {
        let mut d = dispatcher("a");
        connect(&d, "ab", "b");
        let bob = AddressName::new("b");

        let bundle = d.envelope.ensure_session(&bob).unwrap().unwrap();
        let exchange_bytes =
            Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(bundle);
        d.handle_incoming(&bob, &exchange_bytes).unwrap();
        d.drain_io().count();

        let body = proto::NearbyMessageBody {
            r#type: proto::MessageType::EncryptedMessage as i32,
            encrypted_data: b"hello".to_vec(),
        };
        let wire = d.envelope.wrap(&bob, body).unwrap();
        d.handle_incoming(&bob, &wire).unwrap();

        let io: Vec<_> = d.drain_io().collect();
        assert!(matches!(
            &io[0],
            Io::Received(IncomingMessage { payload, .. }) if payload == b"hello"
        ));
    }
}
