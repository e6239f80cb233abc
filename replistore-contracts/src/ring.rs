//! The partitioner seam.
//!
//! A ring maps the partition index of a key to the ordered set of nodes
//! responsible for it. The encoding is opaque to the replicated tier, which
//! only persists, loads, and queries it.

use std::io::{self, Write};
use std::sync::Arc;

/// One member of the ring. Nodes are multi-homed; callers pick an address
/// slot appropriate for their network.
pub trait RingNode: Send + Sync {
    fn address(&self, index: usize) -> Option<String>;
}

/// Sharding map from partition index to ordered replica nodes.
pub trait Ring: Send + Sync {
    /// Number of leading key bits that select a partition.
    fn partition_bit_count(&self) -> u32;

    /// The nodes responsible for a partition, in replica order.
    fn responsible_nodes(&self, partition: u32) -> Vec<Arc<dyn RingNode>>;

    /// Every node in the ring.
    fn nodes(&self) -> Vec<Arc<dyn RingNode>>;

    /// Write the ring's opaque encoding.
    fn persist(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Decoder for the opaque ring encoding, used for both control-plane
/// messages and the on-disk cache.
pub trait RingCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Ring>>;
}
