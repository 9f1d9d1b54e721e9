//! Runtime.
//!
//! Wires the neighbor table, the route discovery engine and the message
//! dispatcher into the single actor the rest of this crate is built
//! sans-I/O around: an owned struct plus a `crossbeam_channel::Receiver<Input>`
//! drained by one single-threaded `run` loop, the same shape `service.rs`
//! drives over its own `reactor::Io` queue. Every `Transport`, registry or
//! route-table call happens between queue-drain steps; [`NeighborTable`]'s
//! internal lock is never held across one.
//!
//! [`discovery::Engine`] and [`dispatch::Dispatcher`] are both generic over
//! the route store, but a single process only ever has one route table on
//! disk. [`SharedRoutes`] and the blanket [`NodeRegistry`] impl for `Arc<R>`
//! let both actors share one underlying store/registry instance without
//! either capability needing to be internally synchronized — the run loop
//! is single-threaded, so `Rc<RefCell<_>>` is enough, the same
//! interior-mutability shape [`RefClock`] already uses for the shared clock.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use localtime::LocalDuration;
use prost::Message as _;
use thiserror::Error;

use crate::clock::RefClock;
use crate::config;
use crate::discovery::{self, Engine};
use crate::dispatch::{self, Dispatcher};
use crate::envelope::{Envelope, KeyExchangeStore, SessionCipher};
use crate::ids::{AddressName, AppMessageId, LocalNodeId, RequestUuid};
use crate::neighbor::{Event as NeighborEvent, NeighborTable};
use crate::registry::{Node, NodeRegistry};
use crate::routes;
use crate::transport::{Transport, TransportEvent};
use crate::wire::{self, Message};

#[derive(Error, Debug)]
pub enum Error {
    #[error("route discovery error: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] dispatch::Error),
    #[error("malformed frame: {0}")]
    Wire(#[from] wire::Error),
    #[error("malformed route discovery message")]
    InvalidRouteMessage,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node registry error: {0}")]
    Registry(String),
}

impl From<discovery::message::InvalidMessage> for Error {
    fn from(_: discovery::message::InvalidMessage) -> Self {
        Self::InvalidRouteMessage
    }
}

/// Shares a single `routes::Store` between the discovery engine and the
/// dispatcher. Both hold their own clone; both see the same rows.
pub(crate) struct SharedRoutes<T>(Rc<RefCell<T>>);

impl<T> SharedRoutes<T> {
    pub fn new(inner: T) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }
}

impl<T> Clone for SharedRoutes<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: routes::Store> routes::Store for SharedRoutes<T> {
    fn insert_request(&mut self, entry: routes::RouteRequestEntry) -> Result<(), routes::Error> {
        self.0.borrow_mut().insert_request(entry)
    }

    fn request(
        &self,
        request_uuid: &RequestUuid,
    ) -> Result<Option<routes::RouteRequestEntry>, routes::Error> {
        self.0.borrow().request(request_uuid)
    }

    fn delete_request(&mut self, request_uuid: &RequestUuid) -> Result<(), routes::Error> {
        self.0.borrow_mut().delete_request(request_uuid)
    }

    fn insert_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), routes::Error> {
        self.0.borrow_mut().insert_broadcast(request_uuid, neighbor_local_id)
    }

    fn set_broadcast_pending(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
        pending: bool,
    ) -> Result<(), routes::Error> {
        self.0
            .borrow_mut()
            .set_broadcast_pending(request_uuid, neighbor_local_id, pending)
    }

    fn delete_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), routes::Error> {
        self.0.borrow_mut().delete_broadcast(request_uuid, neighbor_local_id)
    }

    fn count_broadcasts(&self, request_uuid: &RequestUuid) -> Result<usize, routes::Error> {
        self.0.borrow().count_broadcasts(request_uuid)
    }

    fn has_pending_in_progress(
        &self,
        request_uuid: &RequestUuid,
        pending: bool,
    ) -> Result<bool, routes::Error> {
        self.0.borrow().has_pending_in_progress(request_uuid, pending)
    }

    fn insert_route(&mut self, route: routes::RouteEntry) -> Result<(), routes::Error> {
        self.0.borrow_mut().insert_route(route)
    }

    fn route(&self, discovery_uuid: &RequestUuid) -> Result<Option<routes::RouteEntry>, routes::Error> {
        self.0.borrow().route(discovery_uuid)
    }

    fn delete_route(&mut self, discovery_uuid: &RequestUuid) -> Result<(), routes::Error> {
        self.0.borrow_mut().delete_route(discovery_uuid)
    }

    fn insert_usage(&mut self, usage: routes::RouteUsage) -> Result<(), routes::Error> {
        self.0.borrow_mut().insert_usage(usage)
    }

    fn touch_usage(&mut self, usage_uuid: &RequestUuid, now_ms: i64) -> Result<(), routes::Error> {
        self.0.borrow_mut().touch_usage(usage_uuid, now_ms)
    }

    fn insert_backtracking(
        &mut self,
        usage_uuid: &RequestUuid,
        destination_local_id: LocalNodeId,
    ) -> Result<(), routes::Error> {
        self.0.borrow_mut().insert_backtracking(usage_uuid, destination_local_id)
    }

    fn most_recent_opened_route_to(
        &self,
        destination_local_id: LocalNodeId,
    ) -> Result<Option<(routes::RouteEntry, Option<i64>)>, routes::Error> {
        self.0.borrow().most_recent_opened_route_to(destination_local_id)
    }

    fn reap_stale_routes(&mut self, older_than_ms: i64) -> Result<Vec<RequestUuid>, routes::Error> {
        self.0.borrow_mut().reap_stale_routes(older_than_ms)
    }
}

impl<R: NodeRegistry> NodeRegistry for Arc<R> {
    type Error = R::Error;

    fn find_or_create(&self, address_name: &AddressName) -> Result<Node, Self::Error> {
        (**self).find_or_create(address_name)
    }

    fn find_by_local_id(&self, local_id: LocalNodeId) -> Result<Option<Node>, Self::Error> {
        (**self).find_by_local_id(local_id)
    }
}

/// Events the runtime never fully swallows: inbound application messages
/// and outbound delivery status changes, surfaced to whatever owns the
/// chat UI.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    MessageReceived(dispatch::IncomingMessage),
    DeliveryUpdated {
        app_message_id: AppMessageId,
        status: dispatch::OutboundStatus,
    },
}

/// A subscriber's end of the [`RuntimeEvent`] stream. Dropping it
/// unsubscribes.
pub struct RuntimeSubscription {
    receiver: chan::Receiver<RuntimeEvent>,
}

impl RuntimeSubscription {
    pub fn recv(&self) -> Option<RuntimeEvent> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<RuntimeEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Multi-subscriber fan-out for [`RuntimeEvent`], the same shape as
/// `neighbor::event::EventBus`.
#[derive(Default)]
struct RuntimeEventBus {
    subscribers: Mutex<Vec<chan::Sender<RuntimeEvent>>>,
}

impl RuntimeEventBus {
    fn subscribe(&self) -> RuntimeSubscription {
        let (tx, rx) = chan::unbounded();
        self.subscribers
            .lock()
            .expect("runtime event bus lock poisoned")
            .push(tx);
        RuntimeSubscription { receiver: rx }
    }

    fn publish(&self, event: RuntimeEvent) {
        let mut subscribers = self.subscribers.lock().expect("runtime event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Input drained by the single-threaded [`Runtime::run`] loop. Application
/// sends and ACKs bypass this queue entirely — they go straight through
/// the [`dispatch::Handle`] embedded in [`Handle`], and are picked up on
/// the next [`Dispatcher::drain_commands`] call inside the loop.
enum Input {
    Transport(TransportEvent),
    DiscoveryTimeout(RequestUuid),
    Prune,
}

/// A cheaply cloned submission point for everything the runtime reacts to.
#[derive(Clone)]
pub struct Handle {
    dispatch: dispatch::Handle,
    inputs: chan::Sender<Input>,
    events: Arc<RuntimeEventBus>,
}

impl Handle {
    pub fn send(&self, destination: AddressName, payload: Vec<u8>) {
        self.dispatch.send(destination, payload);
    }

    pub fn ack_delivered(&self, app_message_id: AppMessageId) {
        self.dispatch.ack_delivered(app_message_id);
    }

    pub fn ack_read(&self, app_message_id: AppMessageId) {
        self.dispatch.ack_read(app_message_id);
    }

    /// Send a delivery receipt to the peer that `app_message_id` arrived
    /// from, for an application-observed delivery (not a wire send of our
    /// own message).
    pub fn send_delivered_ack(&self, to: AddressName, app_message_id: AppMessageId) {
        self.dispatch.send_delivered_ack(to, app_message_id);
    }

    /// Send a read receipt to the peer that `app_message_id` arrived from.
    pub fn send_read_ack(&self, to: AddressName, app_message_id: AppMessageId) {
        self.dispatch.send_read_ack(to, app_message_id);
    }

    /// Feed a substrate callback into the runtime. Must never be called
    /// from inside [`Runtime::run`] itself, only from the transport's own
    /// callback thread.
    pub fn transport_event(&self, event: TransportEvent) {
        let _ = self.inputs.send(Input::Transport(event));
    }

    /// Subscribe to inbound messages and outbound delivery status changes.
    pub fn subscribe(&self) -> RuntimeSubscription {
        self.events.subscribe()
    }
}

/// Owns the neighbor table, the discovery engine and the dispatcher, and
/// drives all three from a single queue.
pub struct Runtime<Tr, Rt, Rg, C, S> {
    transport: Arc<Tr>,
    neighbors: Arc<NeighborTable>,
    registry: Arc<Rg>,
    discovery: Engine<SharedRoutes<Rt>, Arc<Rg>>,
    dispatch: Dispatcher<dispatch::Table, SharedRoutes<Rt>, Arc<Rg>, C, S>,
    dispatch_handle: dispatch::Handle,
    inputs: (chan::Sender<Input>, chan::Receiver<Input>),
    events: Arc<RuntimeEventBus>,
}

impl<Tr, Rt, Rg, C, S> Runtime<Tr, Rt, Rg, C, S>
where
    Tr: Transport,
    Rt: routes::Store,
    Rg: NodeRegistry,
    C: SessionCipher,
    S: KeyExchangeStore,
{
    pub fn new(
        local_address: AddressName,
        transport: Tr,
        routes: Rt,
        registry: Rg,
        outbound_store: dispatch::Table,
        envelope: Envelope<C, S>,
        clock: RefClock,
    ) -> Self {
        let transport = Arc::new(transport);
        let neighbors = Arc::new(NeighborTable::new());
        let registry = Arc::new(registry);
        let shared_routes = SharedRoutes::new(routes);

        let discovery = Engine::new(
            local_address.clone(),
            shared_routes.clone(),
            registry.clone(),
            neighbors.clone(),
            clock.clone(),
        );
        let dispatch = Dispatcher::new(
            local_address,
            outbound_store,
            shared_routes,
            registry.clone(),
            envelope,
            neighbors.clone(),
            clock,
        );
        let dispatch_handle = dispatch.handle();

        Self {
            transport,
            neighbors,
            registry,
            discovery,
            dispatch,
            dispatch_handle,
            inputs: chan::unbounded(),
            events: Arc::new(RuntimeEventBus::default()),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            dispatch: self.dispatch_handle.clone(),
            inputs: self.inputs.0.clone(),
            events: self.events.clone(),
        }
    }

    /// Spawns the background threads that keep the loop moving even with
    /// no transport activity: the stale-route reaper.
    pub fn spawn_timers(&self) {
        let sender = self.inputs.0.clone();
        let interval = Duration::from_secs(config::PRUNE_INTERVAL.as_secs());
        thread::spawn(move || loop {
            thread::sleep(interval);
            if sender.send(Input::Prune).is_err() {
                return;
            }
        });
    }

    fn schedule_timeout(&self, request_uuid: RequestUuid, after: LocalDuration) {
        let sender = self.inputs.0.clone();
        let after = Duration::from_secs(after.as_secs());
        thread::spawn(move || {
            thread::sleep(after);
            let _ = sender.send(Input::DiscoveryTimeout(request_uuid));
        });
    }

    /// The single-threaded loop: drain submitted commands, drain neighbor
    /// lifecycle events, drain the input queue, then drain every `Io`
    /// produced as a result — in that order, every iteration. Returns once
    /// the last [`Handle`] (and this `Runtime`) has been dropped.
    pub fn run(&mut self) -> Result<(), Error> {
        let neighbor_events = self.neighbors.subscribe();
        loop {
            self.dispatch.drain_commands()?;

            while let Some(event) = neighbor_events.try_recv() {
                self.handle_neighbor_event(event)?;
            }

            match self.inputs.1.recv_timeout(Duration::from_millis(200)) {
                Ok(input) => self.handle_input(input)?,
                Err(chan::RecvTimeoutError::Timeout) => {}
                Err(chan::RecvTimeoutError::Disconnected) => return Ok(()),
            }

            self.drain_discovery_io()?;
            self.drain_dispatch_io()?;
        }
    }

    fn handle_neighbor_event(&mut self, event: NeighborEvent) -> Result<(), Error> {
        if let NeighborEvent::Connected { address_name, .. } = event {
            self.dispatch.retry_undelivered(&address_name)?;
        }
        Ok(())
    }

    fn handle_input(&mut self, input: Input) -> Result<(), Error> {
        match input {
            Input::Transport(event) => self.handle_transport_event(event)?,
            Input::DiscoveryTimeout(request_uuid) => self.discovery.handle_timeout(request_uuid)?,
            Input::Prune => {
                let reaped = self.discovery.reap_stale_routes()?;
                if !reaped.is_empty() {
                    log::debug!(target: "runtime", "reaped {} stale route(s)", reaped.len());
                }
            }
        }
        Ok(())
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        match event {
            TransportEvent::EndpointFound {
                endpoint_id,
                address_name,
            } => self.neighbors.endpoint_discovered(endpoint_id, address_name),
            TransportEvent::EndpointLost { endpoint_id } => self.neighbors.endpoint_lost(endpoint_id),
            TransportEvent::ConnectionInitiated {
                endpoint_id,
                address_name,
            } => self.neighbors.connection_initiated(endpoint_id, address_name),
            TransportEvent::ConnectionResult {
                endpoint_id,
                success,
            } => self.neighbors.connection_result(endpoint_id, success),
            TransportEvent::Disconnected { endpoint_id } => self.neighbors.disconnect(endpoint_id),
            TransportEvent::PayloadReceived {
                endpoint_id,
                bytes,
                payload_id: _,
            } => {
                let Some(link) = self.neighbors.get(&endpoint_id) else {
                    log::warn!(target: "runtime", "payload from unlinked endpoint {endpoint_id}");
                    return Ok(());
                };
                match Message::decode(&bytes)? {
                    Message::Envelope(envelope) => {
                        self.dispatch
                            .handle_incoming(&link.address_name, &envelope.encode_to_vec())?;
                    }
                    Message::RouteRequest(req) => {
                        let req: discovery::RouteRequestMessage = req.try_into()?;
                        self.discovery.handle_incoming_request(endpoint_id, req)?;
                    }
                    Message::RouteResponse(resp) => {
                        let resp: discovery::RouteResponseMessage = resp.try_into()?;
                        self.discovery.handle_incoming_response(endpoint_id, resp)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn send_payload(&self, endpoint_id: &crate::ids::EndpointId, bytes: Vec<u8>) -> Result<(), Error> {
        self.transport
            .send_payload(endpoint_id, &bytes)
            .map(|_payload_id| ())
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn drain_discovery_io(&mut self) -> Result<(), Error> {
        let io: Vec<_> = self.discovery.drain_io().collect();
        for item in io {
            match item {
                discovery::Io::SendRequest { to, message } => {
                    let framed = Message::RouteRequest(message.into()).encode();
                    self.send_payload(&to, framed)?;
                }
                discovery::Io::SendResponse { to, message } => {
                    let framed = Message::RouteResponse(message.into()).encode();
                    self.send_payload(&to, framed)?;
                }
                discovery::Io::RouteFound(route) => {
                    if let Some(node) = self
                        .registry
                        .find_by_local_id(route.destination_local_id)
                        .map_err(|e| Error::Registry(e.to_string()))?
                    {
                        self.dispatch.on_route_found(&node.address_name)?;
                    }
                }
                discovery::Io::RouteNotFound { request_uuid, status } => {
                    log::warn!(
                        target: "runtime",
                        "discovery {request_uuid} resolved negatively: {status}"
                    );
                }
                discovery::Io::ScheduleTimeout { request_uuid, after } => {
                    self.schedule_timeout(request_uuid, after);
                }
            }
        }
        Ok(())
    }

    fn drain_dispatch_io(&mut self) -> Result<(), Error> {
        let io: Vec<_> = self.dispatch.drain_io().collect();
        for item in io {
            match item {
                dispatch::Io::Transmit {
                    endpoint_id,
                    envelope_bytes,
                    app_message_id,
                } => {
                    let framed = Message::frame_encoded_envelope(envelope_bytes);
                    match self.transport.send_payload(&endpoint_id, &framed) {
                        Ok(payload_id) => {
                            if let Some(app_message_id) = app_message_id {
                                self.dispatch.on_transport_accepted(&app_message_id, payload_id)?;
                            }
                        }
                        Err(e) => {
                            log::warn!(target: "runtime", "send to {endpoint_id} failed: {e}");
                            if let Some(app_message_id) = app_message_id {
                                self.dispatch.on_transport_failed(&app_message_id)?;
                            }
                        }
                    }
                }
                dispatch::Io::RequestDiscovery { destination } => {
                    if let Err(discovery::Error::NoNeighborsAvailable) =
                        self.discovery.initiate_discovery(&destination)
                    {
                        log::debug!(target: "runtime", "no neighbors to discover a route to {destination} through yet");
                    }
                }
                dispatch::Io::Received(msg) => {
                    log::info!(target: "runtime", "message received from {}", msg.from);
                    self.events.publish(RuntimeEvent::MessageReceived(msg));
                }
                dispatch::Io::DeliveryUpdated { app_message_id, status } => {
                    log::debug!(target: "runtime", "{app_message_id} is now {status:?}");
                    self.events
                        .publish(RuntimeEvent::DeliveryUpdated { app_message_id, status });
                }
            }
        }
        Ok(())
    }
}

