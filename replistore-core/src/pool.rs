//! Connection pool keyed by replica address.
//!
//! Entries are created lazily on first use, pruned when the ring stops
//! referencing their address, and negatively cached for a while after a
//! failed dial so a flapping endpoint cannot stall every operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use replistore_contracts::backend::{BackendError, ReplicaStore, StoreConnector};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreClientError;

/// A pooled endpoint: either a live store or the cached outcome of a
/// failed dial.
pub(crate) enum StoreHandle {
    Live(Arc<dyn ReplicaStore>),
    Failed(BackendError),
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreHandle::Live(_) => f.write_str("StoreHandle::Live(..)"),
            StoreHandle::Failed(err) => f.debug_tuple("StoreHandle::Failed").field(err).finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PoolEntry {
    pub(crate) address: String,
    pub(crate) store: StoreHandle,
    /// Tickets bounding concurrent in-flight requests to this endpoint.
    /// Every operation, including one that hits a failed entry, holds a
    /// ticket for its duration.
    pub(crate) tickets: Arc<Semaphore>,
}

impl PoolEntry {
    pub(crate) fn live_store(&self) -> Result<Arc<dyn ReplicaStore>, BackendError> {
        match &self.store {
            StoreHandle::Live(store) => Ok(Arc::clone(store)),
            StoreHandle::Failed(err) => Err(err.clone()),
        }
    }
}

pub(crate) struct StorePool {
    connector: Arc<dyn StoreConnector>,
    entries: Arc<RwLock<HashMap<String, Arc<PoolEntry>>>>,
    concurrency: usize,
    transport_options: Value,
    retry_delay: Duration,
}

impl StorePool {
    pub(crate) fn new(
        connector: Arc<dyn StoreConnector>,
        concurrency: usize,
        transport_options: Value,
        retry_delay: Duration,
    ) -> Self {
        Self {
            connector,
            entries: Arc::new(RwLock::new(HashMap::new())),
            concurrency,
            transport_options,
            retry_delay,
        }
    }

    /// Entries for `addresses`, in order, dialing whichever are missing.
    ///
    /// The hot path holds only the read lock; the write lock is taken just
    /// to install entries, re-checking each slot since another resolve may
    /// have installed it while we waited. Cancellation is checked at every
    /// lock acquisition and before returning.
    pub(crate) async fn resolve(
        &self,
        token: &CancellationToken,
        addresses: &[String],
    ) -> Result<Vec<Arc<PoolEntry>>, StoreClientError> {
        if token.is_cancelled() {
            return Err(StoreClientError::Cancelled);
        }

        let mut found: Vec<Option<Arc<PoolEntry>>> = vec![None; addresses.len()];
        let mut missing = false;
        {
            let entries = tokio::select! {
                _ = token.cancelled() => return Err(StoreClientError::Cancelled),
                guard = self.entries.read() => guard,
            };
            for (slot, address) in addresses.iter().enumerate() {
                match entries.get(address) {
                    Some(entry) => found[slot] = Some(Arc::clone(entry)),
                    None => missing = true,
                }
            }
        }

        if missing {
            let mut entries = tokio::select! {
                _ = token.cancelled() => return Err(StoreClientError::Cancelled),
                guard = self.entries.write() => guard,
            };
            for (slot, address) in addresses.iter().enumerate() {
                if found[slot].is_some() {
                    continue;
                }
                if let Some(entry) = entries.get(address) {
                    found[slot] = Some(Arc::clone(entry));
                    continue;
                }
                let entry = self.dial(address).await;
                entries.insert(address.clone(), Arc::clone(&entry));
                if matches!(entry.store, StoreHandle::Failed(_)) {
                    self.schedule_eviction(address.clone(), Arc::clone(&entry));
                }
                found[slot] = Some(entry);
            }
        }

        if token.is_cancelled() {
            return Err(StoreClientError::Cancelled);
        }
        Ok(found.into_iter().flatten().collect())
    }

    async fn dial(&self, address: &str) -> Arc<PoolEntry> {
        let tickets = Arc::new(Semaphore::new(self.concurrency));
        let store = match self
            .connector
            .connect(address, self.concurrency, &self.transport_options)
            .await
        {
            Ok(store) => StoreHandle::Live(store),
            Err(err) => {
                warn!(address, error = %err, "replica dial failed, caching the failure");
                StoreHandle::Failed(err)
            }
        };
        Arc::new(PoolEntry {
            address: address.to_string(),
            store,
            tickets,
        })
    }

    /// After the retry delay, drop the failed entry so the next resolve
    /// re-dials. Only the exact sentinel is removed; a replacement
    /// installed in the meantime stays.
    fn schedule_eviction(&self, address: String, sentinel: Arc<PoolEntry>) {
        let entries = Arc::clone(&self.entries);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut entries = entries.write().await;
            if let Some(current) = entries.get(&address)
                && Arc::ptr_eq(current, &sentinel)
            {
                entries.remove(&address);
                debug!(address, "failed replica entry evicted, next use re-dials");
            }
        });
    }

    /// Drop every entry whose address is not in `keep`, returning the
    /// removed entries so the caller can shut their stores down outside
    /// the lock.
    pub(crate) async fn retain(
        &self,
        keep: &HashSet<String>,
    ) -> Vec<Arc<PoolEntry>> {
        let mut entries = self.entries.write().await;
        let stale: Vec<String> = entries
            .keys()
            .filter(|address| !keep.contains(*address))
            .cloned()
            .collect();
        stale
            .into_iter()
            .filter_map(|address| entries.remove(&address))
            .collect()
    }

    /// Remove and return every entry.
    pub(crate) async fn drain(&self) -> Vec<Arc<PoolEntry>> {
        let mut entries = self.entries.write().await;
        entries.drain().map(|(_, entry)| entry).collect()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
