//! The key-value pub/sub substrate the bus runs on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_core::error::BusError;

/// Raw payloads delivered on one channel.
pub type PayloadStream = BoxStream<'static, Result<String, BusError>>;

/// One live connection to the substrate.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Cheap liveness probe, used right after connecting.
    async fn ping(&self) -> Result<(), BusError>;

    /// Add `member` to the set stored under `key`.
    async fn add_member(&self, key: &str, member: &str) -> Result<(), BusError>;

    /// Remove `member` from the set stored under `key`.
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BusError>;

    /// Every member of the set stored under `key`.
    async fn members(&self, key: &str) -> Result<Vec<String>, BusError>;

    /// Publish `payload` on `channel`, returning how many subscribers got it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError>;

    /// Subscribe to `channel`. Dropping the stream unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError>;
}

/// Opens fresh connections; called lazily and again after a failure.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError>;
}
