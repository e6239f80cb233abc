//! The per-replica transport seam.
//!
//! A [`ReplicaStore`] is a client for a single value-store endpoint. The
//! replicated client never constructs one directly; it asks a
//! [`StoreConnector`] to dial addresses it learned from the ring.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy for a single replica call.
///
/// Errors are cloneable so the replicated tier can fan a cached dial
/// failure out to every operation that hits the same endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The store has no live entry for the key. Carries the tombstone
    /// timestamp when one exists, so last-writer-wins reconciliation can
    /// order an absence against older values.
    #[error("key not found")]
    NotFound { timestamp_micro: i64 },

    /// Dialing the endpoint failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The connection was established but the call itself failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled before or during the call.
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// The not-found predicate of the store protocol.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Tombstone timestamp for not-found replies, zero otherwise.
    pub fn timestamp_micro(&self) -> i64 {
        match self {
            Self::NotFound { timestamp_micro } => *timestamp_micro,
            _ => 0,
        }
    }
}

/// Client for one value-store endpoint.
///
/// Timestamps are caller-supplied microsecond counters; the store orders
/// writes and deletes purely by them.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Timestamp and length of the newest entry for the key.
    async fn lookup(
        &self,
        key_a: u64,
        key_b: u64,
    ) -> Result<(i64, u32), BackendError>;

    /// Timestamp and value of the newest entry for the key.
    async fn read(
        &self,
        key_a: u64,
        key_b: u64,
    ) -> Result<(i64, Vec<u8>), BackendError>;

    /// Store a value; returns the timestamp it displaced (zero if none).
    async fn write(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
        value: &[u8],
    ) -> Result<i64, BackendError>;

    /// Record a tombstone; returns the timestamp it displaced.
    async fn delete(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
    ) -> Result<i64, BackendError>;

    /// Release the connection. The handle must not be used afterwards.
    async fn shutdown(&self) -> Result<(), BackendError>;
}

/// Factory for [`ReplicaStore`] handles.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Dial `address` with room for `concurrency` in-flight requests.
    /// `options` is an opaque transport-layer payload the replicated tier
    /// passes through unmodified.
    async fn connect(
        &self,
        address: &str,
        concurrency: usize,
        options: &Value,
    ) -> Result<Arc<dyn ReplicaStore>, BackendError>;
}
