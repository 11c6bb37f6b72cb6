//! In-process substrate on `tokio::sync::broadcast`.
//!
//! Each subscribed channel name owns one broadcast sender, dropped once its
//! last subscriber is gone; registry keys map to ordered sets. Every connection handed out shares the same state, so sessions
//! hosted in one process see each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::error::BusError;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::substrate::{BusConnection, BusConnector, PayloadStream};

#[derive(Clone)]
pub struct LocalPubSub {
    state: Arc<LocalState>,
}

struct LocalState {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalPubSub {
    /// Create a substrate whose channels buffer `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(LocalState {
                sets: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// End every live subscription, as a restarted broker would.
    ///
    /// Registry sets survive; subscribers must resubscribe to keep receiving.
    pub fn sever(&self) {
        self.state
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.state.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.state.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.state.capacity).0)
            .clone()
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl BusConnector for LocalPubSub {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BusConnection for LocalPubSub {
    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut sets = self.state.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut sets = self.state.sets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, BusError> {
        let sets = self.state.sets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
        // No subscribers is not an error, just zero deliveries
        let mut channels = self.state.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = channels.get(channel) else {
            return Ok(0);
        };
        if tx.receiver_count() == 0 {
            channels.remove(channel);
            return Ok(0);
        }
        Ok(tx.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(payload) => Some(Ok(payload)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(stream.boxed())
    }
}
