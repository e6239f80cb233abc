//! Hand-rolled fakes for exercising the replicated client end to end:
//! a static ring, scriptable replicas, a recording connector, and a
//! scriptable control-plane stream.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use replistore_contracts::prelude::*;
use replistore_core::{ReplicatedStore, ReplicatedStoreConfig};

pub struct FakeNode {
    addresses: Vec<String>,
}

impl RingNode for FakeNode {
    fn address(&self, index: usize) -> Option<String> {
        self.addresses.get(index).cloned()
    }
}

fn single(address: &str) -> Arc<dyn RingNode> {
    Arc::new(FakeNode {
        addresses: vec![address.to_string()],
    })
}

pub struct FakeRing {
    bit_count: u32,
    members: Vec<Arc<dyn RingNode>>,
    by_partition: HashMap<u32, Vec<Arc<dyn RingNode>>>,
    payload: Vec<u8>,
}

impl Ring for FakeRing {
    fn partition_bit_count(&self) -> u32 {
        self.bit_count
    }

    fn responsible_nodes(&self, partition: u32) -> Vec<Arc<dyn RingNode>> {
        self.by_partition
            .get(&partition)
            .cloned()
            .unwrap_or_else(|| self.members.clone())
    }

    fn nodes(&self) -> Vec<Arc<dyn RingNode>> {
        self.members.clone()
    }

    fn persist(&self, out: &mut dyn io::Write) -> io::Result<()> {
        out.write_all(&self.payload)
    }
}

/// A ring where every partition is served by `addresses`, in order.
pub fn ring_of(addresses: &[&str]) -> Arc<FakeRing> {
    Arc::new(FakeRing {
        bit_count: 8,
        members: addresses.iter().map(|a| single(a)).collect(),
        by_partition: HashMap::new(),
        payload: addresses.join(",").into_bytes(),
    })
}

/// A ring with explicit per-partition replica sets.
pub fn ring_with_partitions(
    members: &[&str],
    bit_count: u32,
    partitions: &[(u32, &[&str])],
) -> Arc<FakeRing> {
    Arc::new(FakeRing {
        bit_count,
        members: members.iter().map(|a| single(a)).collect(),
        by_partition: partitions
            .iter()
            .map(|(partition, addresses)| {
                (*partition, addresses.iter().map(|a| single(a)).collect())
            })
            .collect(),
        payload: members.join(",").into_bytes(),
    })
}

/// A ring whose nodes are multi-homed; `nodes` lists each node's address
/// slots.
pub fn ring_of_nodes(nodes: &[&[&str]]) -> Arc<FakeRing> {
    Arc::new(FakeRing {
        bit_count: 8,
        members: nodes
            .iter()
            .map(|addresses| {
                Arc::new(FakeNode {
                    addresses: addresses.iter().map(|a| a.to_string()).collect(),
                }) as Arc<dyn RingNode>
            })
            .collect(),
        by_partition: HashMap::new(),
        payload: nodes
            .iter()
            .filter_map(|addresses| addresses.first())
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes(),
    })
}

/// Decodes comma-separated address lists; "garbage" and empty input are
/// rejected, for scripting undecodable control-plane messages.
pub struct TextCodec;

impl RingCodec for TextCodec {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Ring>> {
        let text = std::str::from_utf8(bytes)?;
        if text.is_empty() || text == "garbage" {
            anyhow::bail!("unrecognized ring encoding");
        }
        let addresses: Vec<&str> = text.split(',').collect();
        Ok(ring_of(&addresses))
    }
}

#[derive(Default)]
struct ReplicaState {
    values: HashMap<(u64, u64), (i64, Vec<u8>)>,
    fail_with: Option<BackendError>,
    in_flight: usize,
    max_in_flight: usize,
    shutdowns: usize,
}

/// An in-memory single-endpoint store with failure injection, an optional
/// per-call delay, and concurrency observation.
pub struct FakeReplica {
    address: String,
    delay: Mutex<Duration>,
    state: Mutex<ReplicaState>,
}

struct OpGuard<'a> {
    replica: &'a FakeReplica,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.replica.state.lock().unwrap().in_flight -= 1;
    }
}

impl FakeReplica {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(ReplicaState::default()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn seed(&self, key_a: u64, key_b: u64, timestamp_micro: i64, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert((key_a, key_b), (timestamp_micro, value.to_vec()));
    }

    pub fn fail_with(&self, error: BackendError) {
        self.state.lock().unwrap().fail_with = Some(error);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_with = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.lock().unwrap().shutdowns
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn begin(&self) -> OpGuard<'_> {
        let mut state = self.state.lock().unwrap();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        OpGuard { replica: self }
    }

    async fn pace(&self) {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }

    fn forced_failure(&self) -> Option<BackendError> {
        self.state.lock().unwrap().fail_with.clone()
    }
}

#[async_trait]
impl ReplicaStore for FakeReplica {
    async fn lookup(
        &self,
        key_a: u64,
        key_b: u64,
    ) -> Result<(i64, u32), BackendError> {
        let _guard = self.begin();
        self.pace().await;
        if let Some(error) = self.forced_failure() {
            return Err(error);
        }
        let state = self.state.lock().unwrap();
        match state.values.get(&(key_a, key_b)) {
            Some((timestamp_micro, value)) => {
                Ok((*timestamp_micro, value.len() as u32))
            }
            None => Err(BackendError::NotFound { timestamp_micro: 0 }),
        }
    }

    async fn read(
        &self,
        key_a: u64,
        key_b: u64,
    ) -> Result<(i64, Vec<u8>), BackendError> {
        let _guard = self.begin();
        self.pace().await;
        if let Some(error) = self.forced_failure() {
            return Err(error);
        }
        let state = self.state.lock().unwrap();
        match state.values.get(&(key_a, key_b)) {
            Some((timestamp_micro, value)) => Ok((*timestamp_micro, value.clone())),
            None => Err(BackendError::NotFound { timestamp_micro: 0 }),
        }
    }

    async fn write(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
        value: &[u8],
    ) -> Result<i64, BackendError> {
        let _guard = self.begin();
        self.pace().await;
        if let Some(error) = self.forced_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        let displaced = state
            .values
            .get(&(key_a, key_b))
            .map(|(existing, _)| *existing)
            .unwrap_or(0);
        if timestamp_micro > displaced {
            state
                .values
                .insert((key_a, key_b), (timestamp_micro, value.to_vec()));
        }
        Ok(displaced)
    }

    async fn delete(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_micro: i64,
    ) -> Result<i64, BackendError> {
        let _guard = self.begin();
        self.pace().await;
        if let Some(error) = self.forced_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        let displaced = state
            .values
            .get(&(key_a, key_b))
            .map(|(existing, _)| *existing)
            .unwrap_or(0);
        if timestamp_micro > displaced {
            state.values.remove(&(key_a, key_b));
        }
        Ok(displaced)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.state.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

/// Hands out [`FakeReplica`]s by address and records every dial. Replicas
/// exist before they are dialed so tests can seed and script them first.
#[derive(Default)]
pub struct FakeConnector {
    replicas: Mutex<HashMap<String, Arc<FakeReplica>>>,
    refused: Mutex<HashSet<String>>,
    dials: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replica(&self, address: &str) -> Arc<FakeReplica> {
        Arc::clone(
            self.replicas
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_insert_with(|| FakeReplica::new(address)),
        )
    }

    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }

    pub fn admit(&self, address: &str) {
        self.refused.lock().unwrap().remove(address);
    }

    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self, address: &str) -> usize {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|dialed| *dialed == address)
            .count()
    }
}

#[async_trait]
impl StoreConnector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
        _concurrency: usize,
        _options: &serde_json::Value,
    ) -> Result<Arc<dyn ReplicaStore>, BackendError> {
        self.dials.lock().unwrap().push(address.to_string());
        if self.refused.lock().unwrap().contains(address) {
            return Err(BackendError::Dial(format!("{address} refused")));
        }
        Ok(self.replica(address))
    }
}

pub type FeedItem = anyhow::Result<Option<RingEnvelope>>;
type Feed = mpsc::UnboundedReceiver<FeedItem>;

/// Scripts the control-plane: each subscribe attempt pops either a
/// failure or a feed of envelopes. Dropping a feed's sender closes the
/// stream cleanly.
#[derive(Default)]
pub struct ScriptedRingSource {
    feeds: Mutex<VecDeque<Result<Feed, String>>>,
    endpoints: Mutex<Vec<String>>,
    client_ids: Mutex<Vec<String>>,
}

impl ScriptedRingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_failure(&self, message: &str) {
        self.feeds
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn push_feed(&self) -> mpsc::UnboundedSender<FeedItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push_back(Ok(rx));
        tx
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.client_ids.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }
}

struct FeedSubscription {
    feed: Feed,
}

#[async_trait]
impl RingSubscription for FeedSubscription {
    async fn recv(&mut self) -> anyhow::Result<Option<RingEnvelope>> {
        match self.feed.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RingSource for ScriptedRingSource {
    async fn subscribe(
        &self,
        endpoint: &str,
        client_id: &str,
        _options: &serde_json::Value,
    ) -> anyhow::Result<Box<dyn RingSubscription>> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        self.client_ids.lock().unwrap().push(client_id.to_string());
        match self.feeds.lock().unwrap().pop_front() {
            Some(Ok(feed)) => Ok(Box::new(FeedSubscription { feed })),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("subscription script exhausted")),
        }
    }
}

pub fn envelope(text: &str, version: u64) -> FeedItem {
    Ok(Some(RingEnvelope {
        ring: text.as_bytes().to_vec(),
        version,
    }))
}

pub struct StaticDiscovery {
    address: String,
    requests: Mutex<Vec<(String, String, String)>>,
}

impl StaticDiscovery {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(String, String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(
        &self,
        service: &str,
        namespace: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push((
            service.to_string(),
            namespace.to_string(),
            protocol.to_string(),
        ));
        Ok(self.address.clone())
    }
}

pub struct Harness {
    pub connector: Arc<FakeConnector>,
    pub source: Arc<ScriptedRingSource>,
    pub discovery: Arc<StaticDiscovery>,
    pub store: ReplicatedStore,
}

pub fn harness(config: ReplicatedStoreConfig) -> Harness {
    let connector = FakeConnector::new();
    let source = ScriptedRingSource::new();
    let discovery = StaticDiscovery::new("discovered:1");
    let store = ReplicatedStore::new(
        config,
        Arc::clone(&connector) as Arc<dyn StoreConnector>,
        Arc::new(TextCodec),
        Arc::clone(&source) as Arc<dyn RingSource>,
        Arc::clone(&discovery) as Arc<dyn ServiceDiscovery>,
    );
    Harness {
        connector,
        source,
        discovery,
        store,
    }
}

/// A harness whose ring is installed directly, bypassing the control
/// plane.
pub async fn harness_with_ring(addresses: &[&str]) -> Harness {
    let built = harness(ReplicatedStoreConfig::default());
    built.store.set_ring(ring_of(addresses)).await;
    built
}
