//! `parley ask`: answer one question and exit.

use parley_config::AppConfig;
use tokio::sync::mpsc;

use super::render::EventPrinter;
use super::runtime::Runtime;
use super::turn::{TurnOutcome, run_turn};

pub async fn run(config: AppConfig, question: String, session_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::start(config).await?;

    let (tx, mut events) = mpsc::channel(256);
    let agent = runtime.agent(Some(tx));
    let session = runtime.open(&session_id);
    let task = runtime.task(question);

    let mut printer = EventPrinter::new();
    let outcome = run_turn(&agent, &session, task, &mut events, &mut printer).await;
    runtime.close().await;

    match outcome {
        TurnOutcome::Answered => Ok(()),
        TurnOutcome::Failed(e) => Err(format!("Agent run failed: {e}").into()),
        TurnOutcome::Cancelled => Err("Cancelled".into()),
    }
}
