//! Generated protobuf wire types and the frame that multiplexes them.
//!
//! `proto::NearbyMessage` and friends are compiled by `build.rs` from
//! `proto/mesh.proto` via `prost-build`; nothing in this crate hand-rolls
//! their encoding. [`message::Message`] sits in front of the generated
//! types the way `wire::message::Message` does upstream: one small tag
//! byte picks which generated type follows, so a single transport payload
//! can carry an encrypted chat envelope or a plaintext route-discovery
//! message without either needing to know about the other.
pub mod message;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/mesh.rs"));
}

pub use message::Message;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown frame tag: {0}")]
    UnknownTag(u8),
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}
