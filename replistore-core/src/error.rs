//! Error taxonomy exposed to callers of the replicated client.

use std::fmt;

use replistore_contracts::backend::BackendError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreClientError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreClientError {
    /// No ring has been received yet; replica placement is unknown.
    #[error("no ring known yet")]
    NoRing,

    /// The caller cancelled before or during the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Write value exceeds the configured cap; nothing was sent.
    #[error("value length {len} exceeds cap {cap}")]
    ValueTooLarge { len: usize, cap: u32 },

    /// The operation is not meaningful at the replicated-client tier.
    #[error("{0} is not supported by the replicated client")]
    Unsupported(&'static str),

    /// Per-replica failures that crossed the operation's tolerance
    /// threshold.
    #[error(transparent)]
    Replicas(#[from] ReplicaAggregate),
}

impl StoreClientError {
    /// True when the authoritative (newest-timestamp) replica reported the
    /// key absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Replicas(agg) if agg.is_not_found())
    }
}

/// What an aggregate of replica failures means to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Some or all replicas failed.
    Partial,
    /// The winning replica reply says the key does not exist.
    NotFound,
}

/// One failed replica reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaFailure {
    pub address: String,
    pub error: BackendError,
}

impl fmt::Display for ReplicaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.error)
    }
}

/// Ordered collection of per-replica failures, tagged with what the
/// collection means. Carries the winning timestamp (the newest reply for
/// reads and lookups, the maximum displaced timestamp for writes and
/// deletes) so a not-found tombstone time or a partial write's progress
/// stays observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaAggregate {
    pub kind: AggregateKind,
    pub timestamp_micro: i64,
    pub failures: Vec<ReplicaFailure>,
}

impl ReplicaAggregate {
    pub fn is_not_found(&self) -> bool {
        self.kind == AggregateKind::NotFound
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for ReplicaAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.as_slice() {
            [] => write!(f, "no replica errors"),
            [only] => write!(f, "{only}"),
            [first, ..] => {
                write!(f, "{} errors, first is: {}", self.failures.len(), first)
            }
        }
    }
}

impl std::error::Error for ReplicaAggregate {}
