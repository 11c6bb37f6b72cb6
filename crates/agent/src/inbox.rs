//! Inbox listener: wakes a session when another session messages it.
//!
//! The listener registers its session on the bus and subscribes to the
//! session's channel. Every accepted message is recorded as a user turn and
//! answered by a fresh agent run once the session is idle.

use std::sync::Arc;

use parley_bus::{MessageBus, Subscription};
use parley_core::bus::BusMessage;
use parley_core::error::BusError;
use parley_core::message::Message;
use parley_core::task::Task;
use parley_session::SharedSession;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::loop_runner::{AgentLoop, RunOptions};

pub struct InboxListener {
    agent: Arc<AgentLoop>,
    bus: Arc<MessageBus>,
    session: SharedSession,
    session_id: String,
    notify: Option<mpsc::Sender<BusMessage>>,
}

/// Owns a running listener. Dropping it stops the listener as well.
pub struct InboxHandle {
    session_id: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl InboxListener {
    pub fn new(
        agent: Arc<AgentLoop>,
        bus: Arc<MessageBus>,
        session: SharedSession,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            bus,
            session,
            session_id: session_id.into(),
            notify: None,
        }
    }

    /// Forward each accepted message to `tx` before it is answered.
    pub fn with_notifications(mut self, tx: mpsc::Sender<BusMessage>) -> Self {
        self.notify = Some(tx);
        self
    }

    /// Register, subscribe, and start listening in the background.
    pub async fn spawn(self) -> Result<InboxHandle, BusError> {
        self.bus.register(&self.session_id).await?;
        let subscription = match self.bus.subscribe(&self.session_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.bus.unregister(&self.session_id).await;
                return Err(e);
            }
        };
        info!(session_id = %self.session_id, "Inbox listener started");

        let (tx, rx) = oneshot::channel();
        let session_id = self.session_id.clone();
        let task = tokio::spawn(self.listen(subscription, rx));
        Ok(InboxHandle {
            session_id,
            shutdown: Some(tx),
            task,
        })
    }

    async fn listen(self, mut subscription: Subscription, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let msg = tokio::select! {
                _ = &mut shutdown => break,
                msg = subscription.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        debug!(session_id = %self.session_id, "Bus closed, inbox stopping");
                        break;
                    }
                },
            };

            if !self.accepts(&msg) {
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.deliver(msg) => {}
            }
        }

        drop(subscription);
        self.bus.unregister(&self.session_id).await;
        info!(session_id = %self.session_id, "Inbox listener stopped");
    }

    fn accepts(&self, msg: &BusMessage) -> bool {
        if !msg.is_for(&self.session_id) {
            debug!(session_id = %self.session_id, from = %msg.from, to = %msg.to, "Ignoring message");
            return false;
        }
        if msg.message.trim().is_empty() {
            debug!(session_id = %self.session_id, from = %msg.from, "Ignoring blank message");
            return false;
        }
        true
    }

    /// Record `msg` and answer it with a new run.
    ///
    /// The run is spawned, so cancelling this future detaches the run
    /// instead of aborting it halfway.
    async fn deliver(&self, msg: BusMessage) {
        let from = if msg.from.is_empty() { "unknown" } else { msg.from.as_str() };
        let incoming = msg.message.trim().to_string();
        info!(session_id = %self.session_id, from, "Inbox message received");

        self.agent.locks().wait_idle(&self.session_id).await;

        if let Err(e) = self.session.lock().await.append_qa(Message::user(incoming.clone())) {
            warn!(session_id = %self.session_id, error = %e, "Recording inbox message failed");
        }
        if let Some(tx) = &self.notify {
            let _ = tx.send(msg.clone()).await;
        }

        let agent = Arc::clone(&self.agent);
        let session = Arc::clone(&self.session);
        let session_id = self.session_id.clone();
        let run = tokio::spawn(async move {
            let mut task = Task::new(incoming);
            let options = RunOptions {
                record_user_turn: false,
            };
            match agent.run(&session, &mut task, options).await {
                Ok(answer) => debug!(session_id = %session_id, answer_len = answer.len(), "Inbox run finished"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Inbox run failed"),
            }
        });

        if let Err(e) = run.await {
            error!(session_id = %self.session_id, error = %e, "Inbox run panicked");
        }
    }
}

impl InboxHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop listening, unsubscribe and unregister. A run in flight keeps going.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(session_id = %self.session_id, error = %e, "Inbox listener ended abnormally");
        }
    }
}
