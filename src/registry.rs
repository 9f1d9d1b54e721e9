//! The node registry, consumed as an opaque capability. Owns the
//! durable `Node{local_id, address_name, display_name?, last_seen?}`
//! records; the mesh overlay depends only on the ability to resolve an
//! [`AddressName`] to a stable [`LocalNodeId`], creating the row if absent.
use crate::ids::{AddressName, LocalNodeId};

/// A resolved node record, as returned by [`NodeRegistry::find_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub local_id: LocalNodeId,
    pub address_name: AddressName,
}

pub trait NodeRegistry: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolve `address_name` to a node, creating a new registry row if one
    /// doesn't already exist.
    fn find_or_create(&self, address_name: &AddressName) -> Result<Node, Self::Error>;

    /// Look up a previously resolved node by its local id, if the registry
    /// still has a record of it.
    fn find_by_local_id(&self, local_id: LocalNodeId) -> Result<Option<Node>, Self::Error>;
}
