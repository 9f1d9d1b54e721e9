//! Route discovery wire messages.
//!
//! Typed counterparts to the generated `proto::RouteRequestMessage` /
//! `proto::RouteResponseMessage`, the way `wire::message::Message` sits in
//! front of the generated wire types elsewhere in this crate: conversions
//! are explicit (`TryFrom`/`From`) rather than using the generated structs
//! directly throughout the engine.
use std::fmt;
use std::str::FromStr;

use crate::ids::{AddressName, RequestUuid};
use crate::wire::proto;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequestMessage {
    pub request_uuid: RequestUuid,
    pub destination_address_name: AddressName,
    pub remaining_hops: i32,
    pub max_ttl_epoch_ms: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RouteStatus {
    RouteFound,
    RequestAlreadyInProgress,
    NoRouteFound,
    MaxHopsReached,
    TtlExpired,
}

impl RouteStatus {
    pub fn is_terminal_negative(self) -> bool {
        matches!(
            self,
            Self::NoRouteFound | Self::MaxHopsReached | Self::TtlExpired
        )
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RouteFound => "route-found",
            Self::RequestAlreadyInProgress => "request-already-in-progress",
            Self::NoRouteFound => "no-route-found",
            Self::MaxHopsReached => "max-hops-reached",
            Self::TtlExpired => "ttl-expired",
        };
        write!(f, "{s}")
    }
}

impl From<RouteStatus> for proto::RouteStatus {
    fn from(status: RouteStatus) -> Self {
        match status {
            RouteStatus::RouteFound => proto::RouteStatus::RouteFound,
            RouteStatus::RequestAlreadyInProgress => proto::RouteStatus::RequestAlreadyInProgress,
            RouteStatus::NoRouteFound => proto::RouteStatus::NoRouteFound,
            RouteStatus::MaxHopsReached => proto::RouteStatus::MaxHopsReached,
            RouteStatus::TtlExpired => proto::RouteStatus::TtlExpired,
        }
    }
}

impl TryFrom<proto::RouteStatus> for RouteStatus {
    type Error = ();

    fn try_from(status: proto::RouteStatus) -> Result<Self, Self::Error> {
        match status {
            proto::RouteStatus::RouteFound => Ok(Self::RouteFound),
            proto::RouteStatus::RequestAlreadyInProgress => Ok(Self::RequestAlreadyInProgress),
            proto::RouteStatus::NoRouteFound => Ok(Self::NoRouteFound),
            proto::RouteStatus::MaxHopsReached => Ok(Self::MaxHopsReached),
            proto::RouteStatus::TtlExpired => Ok(Self::TtlExpired),
            proto::RouteStatus::Unspecified => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResponseMessage {
    pub request_uuid: RequestUuid,
    pub status: RouteStatus,
}

/// Errors converting a wire-decoded protobuf message into its typed,
/// validated counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMessage;

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed route discovery message")
    }
}

impl std::error::Error for InvalidMessage {}

impl TryFrom<proto::RouteRequestMessage> for RouteRequestMessage {
    type Error = InvalidMessage;

    fn try_from(msg: proto::RouteRequestMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            request_uuid: RequestUuid::from_str(&msg.request_uuid).map_err(|_| InvalidMessage)?,
            destination_address_name: AddressName::new(msg.destination_address_name),
            remaining_hops: msg.remaining_hops,
            max_ttl_epoch_ms: msg.max_ttl_epoch_ms,
        })
    }
}

impl From<RouteRequestMessage> for proto::RouteRequestMessage {
    fn from(msg: RouteRequestMessage) -> Self {
        Self {
            request_uuid: msg.request_uuid.to_string(),
            destination_address_name: msg.destination_address_name.to_string(),
            remaining_hops: msg.remaining_hops,
            max_ttl_epoch_ms: msg.max_ttl_epoch_ms,
        }
    }
}

impl TryFrom<proto::RouteResponseMessage> for RouteResponseMessage {
    type Error = InvalidMessage;

    fn try_from(msg: proto::RouteResponseMessage) -> Result<Self, Self::Error> {
        let status = proto::RouteStatus::try_from(msg.status).map_err(|_| InvalidMessage)?;
        Ok(Self {
            request_uuid: RequestUuid::from_str(&msg.request_uuid).map_err(|_| InvalidMessage)?,
            status: RouteStatus::try_from(status).map_err(|_| InvalidMessage)?,
        })
    }
}

impl From<RouteResponseMessage> for proto::RouteResponseMessage {
    fn from(msg: RouteResponseMessage) -> Self {
        let status: proto::RouteStatus = msg.status.into();
        Self {
            request_uuid: msg.request_uuid.to_string(),
            status: status as i32,
        }
    }
}
