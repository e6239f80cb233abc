//! The control-plane seam: a streaming subscription that delivers ring
//! updates, plus the discovery hook used when no endpoint is configured.

use async_trait::async_trait;
use serde_json::Value;

/// One message from the ring stream. `version` is informational; ordering
/// authority lies with the stream itself.
#[derive(Debug, Clone)]
pub struct RingEnvelope {
    pub ring: Vec<u8>,
    pub version: u64,
}

/// A live subscription to ring updates.
#[async_trait]
pub trait RingSubscription: Send {
    /// Next envelope. `Ok(None)` means the server closed the stream
    /// cleanly; an error means the connection is unusable.
    async fn recv(&mut self) -> anyhow::Result<Option<RingEnvelope>>;
}

/// Dialer for the control-plane ring stream.
#[async_trait]
pub trait RingSource: Send + Sync {
    async fn subscribe(
        &self,
        endpoint: &str,
        client_id: &str,
        options: &Value,
    ) -> anyhow::Result<Box<dyn RingSubscription>>;
}

/// Service-discovery hook used to locate the ring server when no endpoint
/// is configured.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover(
        &self,
        service: &str,
        namespace: &str,
        protocol: &str,
    ) -> anyhow::Result<String>;
}
