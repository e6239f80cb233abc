//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Configuration for [`ReplicatedStore`](crate::ReplicatedStore).
///
/// Every field has a workable default; `normalize` applies floors so a
/// zero-filled config still behaves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicatedStoreConfig {
    /// Which of a node's multi-homed addresses to dial.
    pub address_index: usize,

    /// Maximum value length; larger writes are rejected before fan-out.
    pub value_cap: u32,

    /// In-flight request cap per replica endpoint.
    pub concurrent_requests_per_store: usize,

    /// How long a failed dial stays negatively cached before the next
    /// operation re-dials the endpoint.
    pub failed_connect_retry_delay_secs: u64,

    /// Opaque transport-layer options passed to the store connector.
    pub transport_options: Value,

    /// Explicit control-plane endpoint. When absent, the service-discovery
    /// hook locates one.
    pub ring_server: Option<String>,

    /// Transport options for the control-plane dial.
    pub ring_server_transport_options: Value,

    /// Where to persist the ring between restarts. `None` disables the
    /// cache.
    pub ring_cache_path: Option<PathBuf>,

    /// Subscriber identity presented to the control plane. Empty means
    /// `normalize` generates one.
    pub ring_client_id: String,

    /// Arguments for the discovery hook when `ring_server` is unset.
    pub ring_discovery_service: String,
    pub ring_discovery_namespace: String,
    pub ring_discovery_protocol: String,
}

impl Default for ReplicatedStoreConfig {
    fn default() -> Self {
        Self {
            address_index: 0,
            value_cap: 4 * 1024 * 1024,
            concurrent_requests_per_store: 10,
            failed_connect_retry_delay_secs: 15,
            transport_options: Value::Null,
            ring_server: None,
            ring_server_transport_options: Value::Null,
            ring_cache_path: None,
            ring_client_id: String::new(),
            ring_discovery_service: "ring".to_string(),
            ring_discovery_namespace: String::new(),
            ring_discovery_protocol: "tcp".to_string(),
        }
    }
}

impl ReplicatedStoreConfig {
    /// Clamp nonsensical values and fill in the generated client id.
    pub fn normalize(&mut self) {
        if self.value_cap == 0 {
            self.value_cap = 1;
        }
        if self.concurrent_requests_per_store == 0 {
            self.concurrent_requests_per_store = 1;
        }
        if self.failed_connect_retry_delay_secs == 0 {
            self.failed_connect_retry_delay_secs = 1;
        }
        if self.ring_client_id.is_empty() {
            self.ring_client_id = Uuid::new_v4().to_string();
        }
    }

    pub fn failed_connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.failed_connect_retry_delay_secs)
    }
}
