//! The replicated store: fan-out, reconciliation, and lifecycle.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use replistore_contracts::backend::{BackendError, ReplicaStore, StoreConnector};
use replistore_contracts::ring::{Ring, RingCodec};
use replistore_contracts::source::{RingSource, ServiceDiscovery};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache;
use crate::config::ReplicatedStoreConfig;
use crate::error::{
    AggregateKind, ReplicaAggregate, ReplicaFailure, Result, StoreClientError,
};
use crate::pool::{PoolEntry, StorePool};
use crate::sync;

/// State guarded by the ring lock: the live partitioner and the
/// subscription task control handle. Always acquired before the pool lock.
struct RingState {
    ring: Option<Arc<dyn Ring>>,
    sync_task: Option<SyncHandle>,
}

struct SyncHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct Shared {
    pub(crate) config: ReplicatedStoreConfig,
    pub(crate) codec: Arc<dyn RingCodec>,
    pub(crate) source: Arc<dyn RingSource>,
    pub(crate) discovery: Arc<dyn ServiceDiscovery>,
    ring: RwLock<RingState>,
    pool: StorePool,
}

impl Shared {
    /// Install a new ring, then prune pool entries whose address it no
    /// longer references. Persistence and stale-store shutdowns both run
    /// after the locks are released so a large topology change or a slow
    /// disk cannot stall in-flight operations.
    pub(crate) async fn apply_ring(&self, ring: Arc<dyn Ring>) {
        let stale = {
            let mut state = self.ring.write().await;
            state.ring = Some(Arc::clone(&ring));
            let keep = self.member_addresses(ring.as_ref());
            self.pool.retain(&keep).await
        };
        if let Some(path) = self.config.ring_cache_path.clone() {
            let ring = Arc::clone(&ring);
            let _ = tokio::task::spawn_blocking(move || {
                cache::store(&path, ring.as_ref())
            })
            .await;
        }
        for entry in stale {
            if let Ok(store) = entry.live_store() {
                let address = entry.address.clone();
                tokio::spawn(async move {
                    if let Err(err) = store.shutdown().await {
                        debug!(address, error = %err, "stale replica shutdown failed");
                    }
                });
            }
        }
    }

    fn member_addresses(&self, ring: &dyn Ring) -> HashSet<String> {
        ring.nodes()
            .iter()
            .filter_map(|node| node.address(self.config.address_index))
            .collect()
    }
}

/// Replicated value-store client.
///
/// Cheap to clone; clones share the ring, the pool, and the subscription
/// task.
#[derive(Clone)]
pub struct ReplicatedStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring_known = self
            .shared
            .ring
            .try_read()
            .map(|state| state.ring.is_some())
            .unwrap_or(false);
        f.debug_struct("ReplicatedStore")
            .field("ring_known", &ring_known)
            .field("value_cap", &self.shared.config.value_cap)
            .finish()
    }
}

impl ReplicatedStore {
    pub fn new(
        mut config: ReplicatedStoreConfig,
        connector: Arc<dyn StoreConnector>,
        codec: Arc<dyn RingCodec>,
        source: Arc<dyn RingSource>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Self {
        config.normalize();
        let pool = StorePool::new(
            connector,
            config.concurrent_requests_per_store,
            config.transport_options.clone(),
            config.failed_connect_retry_delay(),
        );
        Self {
            shared: Arc::new(Shared {
                config,
                codec,
                source,
                discovery,
                ring: RwLock::new(RingState {
                    ring: None,
                    sync_task: None,
                }),
                pool,
            }),
        }
    }

    /// Begin ring synchronization. Idempotent, and returns without waiting
    /// for the first ring delivery; operations issued before a ring is
    /// known fail with [`StoreClientError::NoRing`]. If a ring was
    /// persisted by an earlier run it is loaded immediately.
    pub async fn startup(&self) {
        // Read the cache off the ring lock; the fsync'd file can sit on
        // slow storage.
        let mut cached = None;
        if let Some(path) = self.shared.config.ring_cache_path.clone() {
            if self.shared.ring.read().await.ring.is_none() {
                let codec = Arc::clone(&self.shared.codec);
                let load_path = path.clone();
                cached = tokio::task::spawn_blocking(move || {
                    cache::load(&load_path, codec.as_ref())
                })
                .await
                .ok()
                .flatten()
                .map(|ring| (path, ring));
            }
        }

        let mut state = self.shared.ring.write().await;
        if state.ring.is_none()
            && let Some((path, ring)) = cached
        {
            info!(path = %path.display(), "starting from cached ring");
            state.ring = Some(ring);
        }
        if state
            .sync_task
            .as_ref()
            .is_none_or(|handle| handle.task.is_finished())
        {
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(sync::run(
                Arc::clone(&self.shared),
                shutdown.clone(),
            ));
            state.sync_task = Some(SyncHandle { shutdown, task });
        }
    }

    /// Stop ring synchronization, then shut down and drop every pooled
    /// connection. The client stays usable afterwards: operations re-dial
    /// on demand, and `startup` must be called again to resume ring
    /// updates.
    pub async fn shutdown(&self, token: &CancellationToken) -> Result<()> {
        let handle = {
            let mut state = self.shared.ring.write().await;
            state.sync_task.take()
        };
        if let Some(handle) = handle {
            handle.shutdown.cancel();
            let _ = handle.task.await;
        }

        let entries = self.shared.pool.drain().await;
        for entry in entries {
            if token.is_cancelled() {
                return Err(StoreClientError::Cancelled);
            }
            if let Ok(store) = entry.live_store()
                && let Err(err) = store.shutdown().await
            {
                debug!(address = %entry.address, error = %err, "replica shutdown failed");
            }
        }
        Ok(())
    }

    /// Replace the live ring. Normally driven by the control-plane
    /// subscription; exposed for embeddings that manage rings themselves.
    pub async fn set_ring(&self, ring: Arc<dyn Ring>) {
        self.shared.apply_ring(ring).await;
    }

    /// The currently live ring, if any.
    pub async fn current_ring(&self) -> Option<Arc<dyn Ring>> {
        self.shared.ring.read().await.ring.clone()
    }

    async fn stores_for(
        &self,
        token: &CancellationToken,
        key_a: u64,
    ) -> Result<Vec<Arc<PoolEntry>>> {
        let ring = {
            let state = self.shared.ring.read().await;
            state.ring.clone()
        }
        .ok_or(StoreClientError::NoRing)?;

        let partition = partition_of(key_a, ring.partition_bit_count());
        let addresses: Vec<String> = ring
            .responsible_nodes(partition)
            .iter()
            .filter_map(|node| node.address(self.shared.config.address_index))
            .collect();
        if addresses.is_empty() {
            return Err(StoreClientError::NoRing);
        }
        self.shared.pool.resolve(token, &addresses).await
    }

    /// Timestamp and length of the newest entry for the key.
    ///
    /// Liberal aggregation: one live reply is authoritative; errors only
    /// surface if every replica failed, or if the newest reply itself says
    /// not-found.
    pub async fn lookup(
        &self,
        token: &CancellationToken,
        key_a: u64,
        key_b: u64,
    ) -> Result<(i64, u32)> {
        let entries = self.stores_for(token, key_a).await?;
        let results = join_all(entries.iter().map(|entry| async move {
            let reply = call(entry, token, |store| async move {
                store.lookup(key_a, key_b).await
            })
            .await;
            (entry.address.clone(), reply)
        }))
        .await;

        let replica_count = results.len();
        let mut winner: Option<(i64, u32, bool)> = None;
        let mut failures = Vec::new();
        for (address, reply) in results {
            let (timestamp_micro, length, not_found) = match &reply {
                Ok((timestamp_micro, length)) => (*timestamp_micro, *length, false),
                Err(err) => (err.timestamp_micro(), 0, err.is_not_found()),
            };
            if winner
                .as_ref()
                .is_none_or(|(best, _, _)| timestamp_micro > *best)
            {
                winner = Some((timestamp_micro, length, not_found));
            }
            if let Err(error) = reply {
                failures.push(ReplicaFailure { address, error });
            }
        }

        let (timestamp_micro, length, not_found) = winner.unwrap_or((0, 0, false));
        if not_found {
            return Err(StoreClientError::Replicas(ReplicaAggregate {
                kind: AggregateKind::NotFound,
                timestamp_micro,
                failures,
            }));
        }
        if failures.len() < replica_count {
            log_tolerated(&failures, "lookup");
            return Ok((timestamp_micro, length));
        }
        Err(StoreClientError::Replicas(ReplicaAggregate {
            kind: AggregateKind::Partial,
            timestamp_micro,
            failures,
        }))
    }

    /// Timestamp and value of the newest entry for the key. The winning
    /// bytes are appended to `value`, permitting zero-copy appends into a
    /// caller's buffer.
    pub async fn read(
        &self,
        token: &CancellationToken,
        key_a: u64,
        key_b: u64,
        value: Vec<u8>,
    ) -> Result<(i64, Vec<u8>)> {
        let entries = self.stores_for(token, key_a).await?;
        let results = join_all(entries.iter().map(|entry| async move {
            let reply = call(entry, token, |store| async move {
                store.read(key_a, key_b).await
            })
            .await;
            (entry.address.clone(), reply)
        }))
        .await;

        let replica_count = results.len();
        let mut winner: Option<(i64, Vec<u8>, bool)> = None;
        let mut failures = Vec::new();
        for (address, reply) in results {
            match reply {
                Ok((timestamp_micro, bytes)) => {
                    if winner
                        .as_ref()
                        .is_none_or(|(best, _, _)| timestamp_micro > *best)
                    {
                        winner = Some((timestamp_micro, bytes, false));
                    }
                }
                Err(error) => {
                    let timestamp_micro = error.timestamp_micro();
                    if winner
                        .as_ref()
                        .is_none_or(|(best, _, _)| timestamp_micro > *best)
                    {
                        winner =
                            Some((timestamp_micro, Vec::new(), error.is_not_found()));
                    }
                    failures.push(ReplicaFailure { address, error });
                }
            }
        }

        let (timestamp_micro, bytes, not_found) =
            winner.unwrap_or((0, Vec::new(), false));
        if not_found {
            return Err(StoreClientError::Replicas(ReplicaAggregate {
                kind: AggregateKind::NotFound,
                timestamp_micro,
                failures,
            }));
        }
        if failures.len() < replica_count {
            log_tolerated(&failures, "read");
            let mut out = value;
            out.extend_from_slice(&bytes);
            return Ok((timestamp_micro, out));
        }
        Err(StoreClientError::Replicas(ReplicaAggregate {
            kind: AggregateKind::Partial,
            timestamp_micro,
            failures,
        }))
    }

    /// Store a value on every responsible replica.
    ///
    /// Conservative aggregation: strict-minority failures are tolerated
    /// and logged; a failing majority surfaces as an aggregate error.
    /// Returns the maximum timestamp the write displaced.
    pub async fn write(
        &self,
        token: &CancellationToken,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
        value: &[u8],
    ) -> Result<i64> {
        if value.len() > self.shared.config.value_cap as usize {
            return Err(StoreClientError::ValueTooLarge {
                len: value.len(),
                cap: self.shared.config.value_cap,
            });
        }
        let entries = self.stores_for(token, key_a).await?;
        let results = join_all(entries.iter().map(|entry| async move {
            let reply = call(entry, token, |store| async move {
                store.write(key_a, key_b, timestamp_micro, value).await
            })
            .await;
            (entry.address.clone(), reply)
        }))
        .await;
        self.settle_mutation(results, "write")
    }

    /// Record a tombstone on every responsible replica. Same tolerance
    /// rule as `write`.
    pub async fn delete(
        &self,
        token: &CancellationToken,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
    ) -> Result<i64> {
        let entries = self.stores_for(token, key_a).await?;
        let results = join_all(entries.iter().map(|entry| async move {
            let reply = call(entry, token, |store| async move {
                store.delete(key_a, key_b, timestamp_micro).await
            })
            .await;
            (entry.address.clone(), reply)
        }))
        .await;
        self.settle_mutation(results, "delete")
    }

    fn settle_mutation(
        &self,
        results: Vec<(String, std::result::Result<i64, BackendError>)>,
        op: &'static str,
    ) -> Result<i64> {
        let replica_count = results.len();
        let mut old_timestamp_micro = 0i64;
        let mut failures = Vec::new();
        for (address, reply) in results {
            match reply {
                Ok(displaced) => {
                    old_timestamp_micro = old_timestamp_micro.max(displaced);
                }
                Err(error) => failures.push(ReplicaFailure { address, error }),
            }
        }
        if failures.len() < replica_count.div_ceil(2) {
            log_tolerated(&failures, op);
            Ok(old_timestamp_micro)
        } else {
            Err(StoreClientError::Replicas(ReplicaAggregate {
                kind: AggregateKind::Partial,
                timestamp_micro: old_timestamp_micro,
                failures,
            }))
        }
    }

    /// Configured maximum value length.
    pub fn value_cap(&self) -> u32 {
        self.shared.config.value_cap
    }

    /// Replicas accept writes whenever they are up; nothing to enable.
    pub async fn enable_writes(&self) -> Result<()> {
        Ok(())
    }

    /// Disabling writes cluster-wide is an operator action, not a client
    /// one.
    pub async fn disable_writes(&self) -> Result<()> {
        Err(StoreClientError::Unsupported("disable-writes"))
    }

    /// Audit passes run on the stores themselves.
    pub async fn audit_pass(&self) -> Result<()> {
        Err(StoreClientError::Unsupported("audit-pass"))
    }

    /// The client buffers nothing; flushing is a no-op.
    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn stats(&self, _debug: bool) -> ClientStats {
        ClientStats
    }
}

/// Placeholder statistics value; the client tier keeps no counters of its
/// own.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientStats;

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "statistics are tracked by the individual stores")
    }
}

/// Run one replica call under the entry's ticket semaphore.
///
/// Cancellation races both the ticket acquisition and the call itself. A
/// cancellation that wins before the ticket consumes nothing and never
/// touches the store; a ticket once taken is always returned.
async fn call<T, F, Fut>(
    entry: &PoolEntry,
    token: &CancellationToken,
    op: F,
) -> std::result::Result<T, BackendError>
where
    F: FnOnce(Arc<dyn ReplicaStore>) -> Fut,
    Fut: Future<Output = std::result::Result<T, BackendError>>,
{
    let permit = tokio::select! {
        _ = token.cancelled() => return Err(BackendError::Cancelled),
        permit = Arc::clone(&entry.tickets).acquire_owned() => {
            permit.map_err(|_| BackendError::Cancelled)?
        }
    };
    let store = entry.live_store()?;
    let result = tokio::select! {
        _ = token.cancelled() => Err(BackendError::Cancelled),
        result = op(store) => result,
    };
    drop(permit);
    result
}

fn log_tolerated(failures: &[ReplicaFailure], op: &str) {
    for failure in failures {
        debug!(
            op,
            address = %failure.address,
            error = %failure.error,
            "tolerating minority replica failure"
        );
    }
}

/// Partition index of a key: its leading `bit_count` bits. The partition
/// space is 32 bits wide, so bit counts above 32 clamp to 32 and select
/// the key's top 32 bits; a bit count of zero means a single partition.
fn partition_of(key_a: u64, bit_count: u32) -> u32 {
    if bit_count == 0 {
        return 0;
    }
    let shift = 64 - bit_count.min(32);
    (key_a >> shift) as u32
}
