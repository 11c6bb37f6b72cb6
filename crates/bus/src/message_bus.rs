//! Session registry plus one pub/sub channel per session.
//!
//! Keys: the registry set lives at `{prefix}:sessions`, session channels at
//! `{prefix}:comm:{session_id}`. The substrate connection is created lazily
//! and rebuilt once when an operation fails with a connection error.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parley_core::bus::{BROADCAST, BusMessage};
use parley_core::error::BusError;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::local::LocalPubSub;
use crate::substrate::{BusConnection, BusConnector, PayloadStream};

pub struct MessageBus {
    connector: Arc<dyn BusConnector>,
    connection: Mutex<Option<Arc<dyn BusConnection>>>,
    prefix: String,
    resubscribe_delay: Duration,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(connector: Arc<dyn BusConnector>, prefix: impl Into<String>) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
            prefix: prefix.into(),
            resubscribe_delay: Duration::from_millis(500),
            closed: AtomicBool::new(false),
        }
    }

    /// A bus over a fresh in-process substrate.
    pub fn local(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(LocalPubSub::default()), prefix)
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn registry_key(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    pub fn channel_for(&self, session_id: &str) -> String {
        format!("{}:comm:{}", self.prefix, session_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Connection management ──

    async fn connection(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connector.connect().await?;
        conn.ping().await?;
        debug!(prefix = %self.prefix, "Bus connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.connection.lock().await.take();
    }

    /// Run `op`, retrying once on a fresh connection after a connection error.
    async fn with_reconnect<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, BusError>
    where
        F: Fn(Arc<dyn BusConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BusError>> + Send,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let first = match self.connection().await {
            Ok(conn) => op(conn).await,
            Err(e) => Err(e),
        };

        match first {
            Err(e) if e.is_connection() => {
                warn!(op = op_name, error = %e, "Bus operation failed, reconnecting");
                self.reset().await;
                let conn = self.connection().await?;
                op(conn).await
            }
            other => other,
        }
    }

    // ── Registry ──

    pub async fn register(&self, session_id: &str) -> Result<(), BusError> {
        let key = self.registry_key();
        self.with_reconnect("register", |conn| {
            let key = key.clone();
            let member = session_id.to_string();
            async move { conn.add_member(&key, &member).await }
        })
        .await?;
        info!(session_id, "Session registered on bus");
        Ok(())
    }

    /// Remove a session from the registry. Failures are logged, never raised,
    /// because this runs on shutdown paths.
    pub async fn unregister(&self, session_id: &str) {
        let key = self.registry_key();
        let result = self
            .with_reconnect("unregister", |conn| {
                let key = key.clone();
                let member = session_id.to_string();
                async move { conn.remove_member(&key, &member).await }
            })
            .await;
        match result {
            Ok(()) => info!(session_id, "Session unregistered from bus"),
            Err(e) => warn!(session_id, error = %e, "Failed to unregister session"),
        }
    }

    /// Every registered session id, sorted. Callers filter out themselves.
    pub async fn list_active(&self) -> Result<Vec<String>, BusError> {
        let key = self.registry_key();
        let mut members = self
            .with_reconnect("list_active", |conn| {
                let key = key.clone();
                async move { conn.members(&key).await }
            })
            .await?;
        members.sort();
        Ok(members)
    }

    // ── Pub/sub ──

    /// Publish a message on `to`'s channel; returns the subscriber count.
    pub async fn publish(
        &self,
        from: &str,
        to: &str,
        message: &str,
        extra: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<usize, BusError> {
        let msg = BusMessage::new(from, to, message).with_extra(extra.unwrap_or_default());
        let payload =
            serde_json::to_string(&msg).map_err(|e| BusError::Serialization(e.to_string()))?;
        let channel = self.channel_for(to);

        let delivered = self
            .with_reconnect("publish", |conn| {
                let channel = channel.clone();
                let payload = payload.clone();
                async move { conn.publish(&channel, payload).await }
            })
            .await?;
        debug!(from, to, subscribers = delivered, "Bus message published");
        Ok(delivered)
    }

    /// Publish to every registered session except `from`.
    pub async fn broadcast(&self, from: &str, message: &str) -> Result<usize, BusError> {
        let msg = BusMessage::new(from, BROADCAST, message);
        let payload =
            serde_json::to_string(&msg).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut delivered = 0;
        for peer in self.list_active().await?.into_iter().filter(|p| p != from) {
            let channel = self.channel_for(&peer);
            delivered += self
                .with_reconnect("broadcast", |conn| {
                    let channel = channel.clone();
                    let payload = payload.clone();
                    async move { conn.publish(&channel, payload).await }
                })
                .await?;
        }
        Ok(delivered)
    }

    async fn open_stream(&self, session_id: &str) -> Result<PayloadStream, BusError> {
        let channel = self.channel_for(session_id);
        self.with_reconnect("subscribe", |conn| {
            let channel = channel.clone();
            async move { conn.subscribe(&channel).await }
        })
        .await
    }

    /// Subscribe to `session_id`'s channel.
    ///
    /// The first subscription is established eagerly so errors surface here;
    /// afterwards the subscription re-establishes itself as needed.
    pub async fn subscribe(self: &Arc<Self>, session_id: &str) -> Result<Subscription, BusError> {
        let stream = self.open_stream(session_id).await?;
        debug!(session_id, "Subscribed to session channel");
        Ok(Subscription {
            bus: Arc::clone(self),
            session_id: session_id.to_string(),
            stream: Some(stream),
        })
    }

    /// Drop the connection; every later operation fails with `BusError::Closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reset().await;
        debug!(prefix = %self.prefix, "Bus closed");
    }
}

/// A restartable subscription to one session's channel.
///
/// Delivery is at-most-once: messages published while the subscription is
/// being re-established are not replayed.
pub struct Subscription {
    bus: Arc<MessageBus>,
    session_id: String,
    stream: Option<PayloadStream>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next decodable message. Returns `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            if self.bus.is_closed() {
                return None;
            }

            if self.stream.is_none() {
                match self.bus.open_stream(&self.session_id).await {
                    Ok(stream) => {
                        info!(session_id = %self.session_id, "Resubscribed to session channel");
                        self.stream = Some(stream);
                    }
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "Resubscribe failed");
                        tokio::time::sleep(self.bus.resubscribe_delay).await;
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(Ok(payload)) => match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "Skipping undecodable bus payload");
                    }
                },
                Some(Err(e)) => {
                    warn!(session_id = %self.session_id, error = %e, "Subscription error");
                    self.stream = None;
                    tokio::time::sleep(self.bus.resubscribe_delay).await;
                }
                None => {
                    debug!(session_id = %self.session_id, "Subscription ended");
                    self.stream = None;
                    tokio::time::sleep(self.bus.resubscribe_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// The first `failing_connections` connections fail every publish and removal.
    struct FlakyConnector {
        inner: LocalPubSub,
        connects: AtomicUsize,
        failing_connections: usize,
    }

    struct FlakyConnection {
        inner: LocalPubSub,
        broken: bool,
    }

    #[async_trait]
    impl BusConnector for FlakyConnector {
        async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakyConnection {
                inner: self.inner.clone(),
                broken: n < self.failing_connections,
            }))
        }
    }

    #[async_trait]
    impl BusConnection for FlakyConnection {
        async fn ping(&self) -> Result<(), BusError> {
            Ok(())
        }
        async fn add_member(&self, key: &str, member: &str) -> Result<(), BusError> {
            self.inner.add_member(key, member).await
        }
        async fn remove_member(&self, key: &str, member: &str) -> Result<(), BusError> {
            if self.broken {
                return Err(BusError::Connection("reset by peer".into()));
            }
            self.inner.remove_member(key, member).await
        }
        async fn members(&self, key: &str) -> Result<Vec<String>, BusError> {
            self.inner.members(key).await
        }
        async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
            if self.broken {
                return Err(BusError::Connection("reset by peer".into()));
            }
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError> {
            self.inner.subscribe(channel).await
        }
    }

    fn flaky_bus(failing_connections: usize) -> (Arc<MessageBus>, Arc<FlakyConnector>) {
        let connector = Arc::new(FlakyConnector {
            inner: LocalPubSub::default(),
            connects: AtomicUsize::new(0),
            failing_connections,
        });
        let bus = Arc::new(MessageBus::new(connector.clone(), "test"));
        (bus, connector)
    }

    #[test]
    fn key_layout() {
        let bus = MessageBus::local("desk");
        assert_eq!(bus.registry_key(), "desk:sessions");
        assert_eq!(bus.channel_for("B"), "desk:comm:B");
    }

    #[tokio::test]
    async fn registry_is_sorted_and_unfiltered() {
        let bus = MessageBus::local("t");
        bus.register("charlie").await.unwrap();
        bus.register("alpha").await.unwrap();
        bus.register("bravo").await.unwrap();
        assert_eq!(bus.list_active().await.unwrap(), vec!["alpha", "bravo", "charlie"]);

        bus.unregister("bravo").await;
        assert_eq!(bus.list_active().await.unwrap(), vec!["alpha", "charlie"]);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_with_wire_fields() {
        let bus = Arc::new(MessageBus::local("t"));
        let mut sub = bus.subscribe("B").await.unwrap();

        let mut extra = serde_json::Map::new();
        extra.insert("topic".into(), serde_json::json!("prices"));
        let delivered = bus.publish("A", "B", "ping", Some(extra)).await.unwrap();
        assert_eq!(delivered, 1);

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.from, "A");
        assert_eq!(msg.to, "B");
        assert_eq!(msg.message, "ping");
        assert_eq!(msg.extra["topic"], "prices");
        assert!(msg.ts > 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_zero() {
        let bus = MessageBus::local("t");
        assert_eq!(bus.publish("A", "nobody", "hello", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_reconnects_once() {
        let (bus, connector) = flaky_bus(1);
        // Caches the first, broken connection; subscribing still works on it.
        let _sub = bus.subscribe("B").await.unwrap();

        assert_eq!(bus.publish("A", "B", "ping", None).await.unwrap(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_surfaces() {
        let (bus, connector) = flaky_bus(2);
        let err = bus.publish("A", "B", "ping", None).await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_swallows_errors() {
        let (bus, _) = flaky_bus(usize::MAX);
        bus.register("A").await.unwrap();
        bus.unregister("A").await;
        assert_eq!(bus.list_active().await.unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let bus = Arc::new(MessageBus::local("t"));
        for id in ["A", "B", "C"] {
            bus.register(id).await.unwrap();
        }
        let mut sub_a = bus.subscribe("A").await.unwrap();
        let mut sub_b = bus.subscribe("B").await.unwrap();
        let mut sub_c = bus.subscribe("C").await.unwrap();

        assert_eq!(bus.broadcast("A", "market closed").await.unwrap(), 2);
        assert_eq!(sub_b.next().await.unwrap().to, BROADCAST);
        assert_eq!(sub_c.next().await.unwrap().message, "market closed");

        bus.publish("B", "A", "direct", None).await.unwrap();
        assert_eq!(sub_a.next().await.unwrap().message, "direct");
    }

    #[tokio::test]
    async fn subscription_survives_substrate_restart() {
        let substrate = LocalPubSub::default();
        let bus = Arc::new(
            MessageBus::new(Arc::new(substrate.clone()), "t")
                .with_resubscribe_delay(Duration::from_millis(5)),
        );
        let mut sub = bus.subscribe("B").await.unwrap();
        substrate.sever();

        let reader = tokio::spawn(async move { sub.next().await });

        let mut delivered = 0;
        for _ in 0..200 {
            delivered = bus.publish("A", "B", "after restart", None).await.unwrap();
            if delivered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(delivered, 1);
        let msg = reader.await.unwrap().unwrap();
        assert_eq!(msg.message, "after restart");
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped() {
        let substrate = LocalPubSub::default();
        let bus = Arc::new(MessageBus::new(Arc::new(substrate.clone()), "t"));
        let mut sub = bus.subscribe("B").await.unwrap();

        substrate
            .publish(&bus.channel_for("B"), "not json".into())
            .await
            .unwrap();
        bus.publish("A", "B", "valid", None).await.unwrap();
        assert_eq!(sub.next().await.unwrap().message, "valid");
    }

    #[tokio::test]
    async fn closed_bus_rejects_operations() {
        let bus = Arc::new(MessageBus::local("t"));
        let mut sub = bus.subscribe("B").await.unwrap();
        bus.close().await;
        assert!(matches!(
            bus.publish("A", "B", "x", None).await,
            Err(BusError::Closed)
        ));
        assert!(sub.next().await.is_none());
    }
}
