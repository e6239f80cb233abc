//! Trait surfaces that describe the external collaborators of the
//! replicated value-store client.
//!
//! The client itself lives in `replistore-core`; this crate only names the
//! seams it talks through: the per-replica transport, the consistent-hashing
//! ring, and the control-plane ring stream. Concrete transports implement
//! these traits out of tree.

pub mod backend;
pub mod ring;
pub mod source;

/// Frequently used trait combinators for transport and embedding crates.
pub mod prelude {
    pub use super::backend::{BackendError, ReplicaStore, StoreConnector};
    pub use super::ring::{Ring, RingCodec, RingNode};
    pub use super::source::{
        RingEnvelope, RingSource, RingSubscription, ServiceDiscovery,
    };
}
