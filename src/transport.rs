//! The neighbor discovery/transport substrate, consumed as an opaque
//! capability. Advertise, discover, accept and payload delivery
//! all live outside this crate; we only need the narrow surface the mesh
//! overlay drives.
use std::fmt;

use crate::ids::{AddressName, EndpointId, PayloadId};

/// A capability for sending bytes to, and accepting connections from,
/// nearby endpoints. Implemented by the embedding application's transport
/// substrate (e.g. a Nearby Connections wrapper).
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start advertising this node under `local_name` on `service_id`.
    /// Idempotent: "already advertising" from the substrate is absorbed as
    /// success.
    fn advertise(&self, local_name: &AddressName, service_id: &str) -> Result<(), Self::Error>;

    /// Start discovering other advertisers of `service_id`. Idempotent in
    /// the same sense as [`Transport::advertise`].
    fn discover(&self, service_id: &str) -> Result<(), Self::Error>;

    /// Ask the substrate to initiate a connection to `endpoint_id`.
    fn request_connection(
        &self,
        local_name: &AddressName,
        endpoint_id: &EndpointId,
    ) -> Result<(), Self::Error>;

    fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<(), Self::Error>;

    fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<(), Self::Error>;

    fn disconnect(&self, endpoint_id: &EndpointId) -> Result<(), Self::Error>;

    /// Hand `bytes` to the substrate for delivery to `endpoint_id`, returning
    /// a substrate-assigned id for the send once accepted.
    fn send_payload(
        &self,
        endpoint_id: &EndpointId,
        bytes: &[u8],
    ) -> Result<PayloadId, Self::Error>;
}

/// Events the transport substrate delivers to the neighbor table. These
/// arrive on the substrate's own callback thread and must only ever be
/// enqueued onto a subsystem's mailbox, never acted on inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    EndpointFound {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    ConnectionInitiated {
        endpoint_id: EndpointId,
        address_name: AddressName,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        success: bool,
    },
    Disconnected {
        endpoint_id: EndpointId,
    },
    PayloadReceived {
        endpoint_id: EndpointId,
        bytes: Vec<u8>,
        payload_id: PayloadId,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointFound { endpoint_id, .. } => write!(f, "endpoint found: {endpoint_id}"),
            Self::EndpointLost { endpoint_id } => write!(f, "endpoint lost: {endpoint_id}"),
            Self::ConnectionInitiated { endpoint_id, .. } => {
                write!(f, "connection initiated: {endpoint_id}")
            }
            Self::ConnectionResult {
                endpoint_id,
                success,
            } => write!(f, "connection result: {endpoint_id} success={success}"),
            Self::Disconnected { endpoint_id } => write!(f, "disconnected: {endpoint_id}"),
            Self::PayloadReceived { endpoint_id, .. } => {
                write!(f, "payload received from {endpoint_id}")
            }
        }
    }
}
