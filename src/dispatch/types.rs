use crate::ids::{AddressName, AppMessageId, PayloadId};

/// Lifecycle of a single outbound application message, persisted so a
/// restart (or a session/route that only resolves later) can resume it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutboundStatus {
    /// Staged behind an in-flight Signal prekey exchange.
    PendingKeyExchange,
    /// Handed to the transport, awaiting `MESSAGE_DELIVERED_ACK`.
    Pending,
    Delivered,
    Read,
    /// Transport or encryption failed in a way retrying won't fix.
    Failed,
}

/// `{app_message_id (PK), destination, status, payload_id?, created_at}`,
/// plus the application plaintext itself: without it a `SessionEstablished`
/// re-drive would have nothing to (re-)wrap and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub app_message_id: AppMessageId,
    pub destination: AddressName,
    pub status: OutboundStatus,
    pub plaintext: Vec<u8>,
    /// Set once the transport has accepted the payload for this attempt.
    pub payload_id: Option<PayloadId>,
    pub created_at: i64,
}
