//! One foreground run: stream its events, honour Ctrl-C.

use parley_agent::{AgentEvent, AgentLoop, BUDGET_EXHAUSTED, RunOptions};
use parley_core::task::Task;
use parley_session::SharedSession;
use tokio::sync::mpsc;
use tracing::warn;

use super::render::EventPrinter;

pub enum TurnOutcome {
    Answered,
    Failed(String),
    Cancelled,
}

/// Run `task` on `session`, printing events from `events` while it streams.
///
/// Ctrl-C drops the run, marks the task cancelled and saves the session.
pub async fn run_turn(
    agent: &AgentLoop,
    session: &SharedSession,
    task: Task,
    events: &mut mpsc::Receiver<AgentEvent>,
    printer: &mut EventPrinter,
) -> TurnOutcome {
    run_turn_until(agent, session, task, events, printer, tokio::signal::ctrl_c()).await
}

/// [`run_turn`], cancelled when `cancel` completes instead of on Ctrl-C.
async fn run_turn_until<F: Future>(
    agent: &AgentLoop,
    session: &SharedSession,
    mut task: Task,
    events: &mut mpsc::Receiver<AgentEvent>,
    printer: &mut EventPrinter,
    cancel: F,
) -> TurnOutcome {
    printer.reset();

    let result = {
        let run = agent.run(session, &mut task, RunOptions::default());
        tokio::pin!(run, cancel);
        loop {
            tokio::select! {
                Some(event) = events.recv() => printer.print(&event),
                result = &mut run => break Some(result),
                _ = &mut cancel => break None,
            }
        }
    };

    // Events emitted right before the run returned
    while let Ok(event) = events.try_recv() {
        printer.print(&event);
    }

    match result {
        Some(Ok(answer)) => {
            if answer == BUDGET_EXHAUSTED || !printer.answered() {
                println!("\n  Assistant > {answer}");
            }
            TurnOutcome::Answered
        }
        Some(Err(e)) => TurnOutcome::Failed(e.to_string()),
        None => {
            task.cancel();
            let session = session.lock().await;
            if let Err(e) = session.save() {
                warn!(session_id = %session.id(), error = %e, "Saving session after cancel failed");
            }
            printer.reset();
            TurnOutcome::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use parley_agent::LoopConfig;
    use parley_core::error::ProviderError;
    use parley_core::provider::{ChunkReceiver, Provider, ProviderRequest};
    use parley_session::Session;
    use parley_tools::{GatewayPolicy, ToolGateway};

    /// Opens a stream that never yields a chunk.
    #[derive(Default)]
    struct StalledProvider {
        open: Mutex<Vec<mpsc::Sender<Result<parley_core::provider::StreamChunk, ProviderError>>>>,
    }

    #[async_trait]
    impl Provider for StalledProvider {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
            let (tx, rx) = mpsc::channel(1);
            self.open.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_stalled_run() {
        let (tx, mut events) = mpsc::channel(64);
        let gateway = Arc::new(ToolGateway::from_providers(vec![], GatewayPolicy::default()));
        let agent = AgentLoop::new(Arc::new(StalledProvider::default()), gateway, LoopConfig::default())
            .with_events(tx);
        let session = Session::in_memory("main").into_shared();
        let mut printer = EventPrinter::new();

        let outcome = run_turn_until(
            &agent,
            &session,
            Task::new("hello"),
            &mut events,
            &mut printer,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(session.lock().await.qa_history().len(), 1);
    }
}
