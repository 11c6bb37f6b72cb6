//! `parley chat`: interactive REPL on one session.
//!
//! The chat session and every `--peer` get an inbox listener in this
//! process, so sessions can message each other while the user types.

use std::io::Write;
use std::sync::Arc;

use parley_agent::{InboxHandle, InboxListener};
use parley_config::AppConfig;
use parley_core::bus::BusMessage;
use parley_session::SharedSession;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::render::{BackgroundPrinter, EventPrinter};
use super::runtime::Runtime;
use super::turn::{TurnOutcome, run_turn};

#[derive(Debug, PartialEq)]
enum SlashCommand<'a> {
    Sessions,
    Send { target: &'a str, message: &'a str },
    Tools,
    Clear,
    Quit,
    Usage(&'static str),
    Unknown(&'a str),
}

impl<'a> SlashCommand<'a> {
    /// Parse a line starting with `/`. Returns `None` for ordinary input.
    fn parse(line: &'a str) -> Option<Self> {
        let rest = line.strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        Some(match name {
            "sessions" => Self::Sessions,
            "send" => match args.split_once(char::is_whitespace) {
                Some((target, message)) if !message.trim().is_empty() => Self::Send {
                    target,
                    message: message.trim(),
                },
                _ => Self::Usage("/send <session|*> <message>"),
            },
            "tools" => Self::Tools,
            "clear" => Self::Clear,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other),
        })
    }
}

pub async fn run(config: AppConfig, session_id: String, peers: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::start(config).await?;
    let result = repl(&runtime, &session_id, &peers).await;
    runtime.close().await;
    result
}

async fn repl(runtime: &Runtime, session_id: &str, peers: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut events) = mpsc::channel(256);
    let agent = runtime.agent(Some(tx));
    let session = runtime.open(session_id);

    let inboxes = start_inboxes(runtime, &session, session_id, peers).await?;

    print_banner(runtime, session_id, &inboxes);

    let mut printer = EventPrinter::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match SlashCommand::parse(line) {
            Some(SlashCommand::Quit) => break,
            Some(command) => handle_command(runtime, &session, session_id, command).await,
            None => {
                let task = runtime.task(line);
                match run_turn(&agent, &session, task, &mut events, &mut printer).await {
                    TurnOutcome::Answered => {}
                    TurnOutcome::Failed(e) => eprintln!("  [Error] {e}"),
                    TurnOutcome::Cancelled => println!("\n  (cancelled)"),
                }
                println!();
            }
        }
    }

    for inbox in inboxes {
        inbox.shutdown().await;
    }

    println!();
    println!("  Goodbye! 👋");
    println!();
    Ok(())
}

/// One listener per hosted session. Background runs print through their own
/// printer so they never garble the foreground stream.
async fn start_inboxes(
    runtime: &Runtime,
    session: &SharedSession,
    session_id: &str,
    peers: &[String],
) -> Result<Vec<InboxHandle>, Box<dyn std::error::Error>> {
    let (tx, mut background) = mpsc::channel(256);
    let inbox_agent = runtime.agent(Some(tx));
    tokio::spawn(async move {
        let mut printer = BackgroundPrinter::new();
        while let Some(event) = background.recv().await {
            printer.print(&event);
        }
    });

    let (notify_tx, mut notices) = mpsc::channel::<BusMessage>(64);
    tokio::spawn(async move {
        while let Some(msg) = notices.recv().await {
            println!("\n  ✉ [{}] message from {}: {}", msg.to, msg.from, msg.message);
        }
    });

    let mut hosted: Vec<&str> = vec![session_id];
    for peer in peers {
        if !hosted.contains(&peer.as_str()) {
            hosted.push(peer);
        }
    }

    let mut handles = Vec::with_capacity(hosted.len());
    for id in hosted {
        let shared = if id == session_id {
            Arc::clone(session)
        } else {
            runtime.open(id)
        };
        let listener = InboxListener::new(Arc::clone(&inbox_agent), Arc::clone(&runtime.bus), shared, id)
            .with_notifications(notify_tx.clone());
        match listener.spawn().await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in handles {
                    handle.shutdown().await;
                }
                return Err(format!("Failed to start inbox for '{id}': {e}").into());
            }
        }
    }
    Ok(handles)
}

async fn handle_command(runtime: &Runtime, session: &SharedSession, session_id: &str, command: SlashCommand<'_>) {
    match command {
        SlashCommand::Sessions => match runtime.bus.list_active().await {
            Ok(active) if active.is_empty() => println!("  No active sessions."),
            Ok(active) => {
                for id in active {
                    let marker = if id == session_id { " (you)" } else { "" };
                    println!("  - {id}{marker}");
                }
            }
            Err(e) => eprintln!("  [Error] {e}"),
        },
        SlashCommand::Send { target, message } => {
            let sent = if target == "*" {
                runtime.bus.broadcast(session_id, message).await
            } else {
                runtime.bus.publish(session_id, target, message, None).await
            };
            match sent {
                Ok(0) => println!("  Sent to {target}, but nobody is listening."),
                Ok(n) => println!("  Sent to {target} ({n} subscriber(s))."),
                Err(e) => eprintln!("  [Error] {e}"),
            }
        }
        SlashCommand::Tools => match runtime.gateway.list_tools().await {
            Ok(tools) if tools.is_empty() => println!("  No tools available."),
            Ok(tools) => {
                for tool in tools {
                    println!("  - {} ({}): {}", tool.name, tool.provider, tool.description);
                }
            }
            Err(e) => eprintln!("  [Error] {e}"),
        },
        SlashCommand::Clear => match session.lock().await.clear_context() {
            Ok(()) => println!("  Context cleared."),
            Err(e) => eprintln!("  [Error] {e}"),
        },
        SlashCommand::Usage(usage) => println!("  Usage: {usage}"),
        SlashCommand::Unknown(name) => {
            println!("  Unknown command '/{name}'. Try /sessions, /send, /tools, /clear or /quit.")
        }
        SlashCommand::Quit => {}
    }
}

fn print_banner(runtime: &Runtime, session_id: &str, inboxes: &[InboxHandle]) {
    let hosted: Vec<&str> = inboxes.iter().map(InboxHandle::session_id).collect();
    let providers = runtime.gateway.provider_names();

    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║          Parley: Interactive Session          ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Session:   {session_id}");
    println!("  Hosting:   {}", hosted.join(", "));
    println!("  Model:     {}", runtime.config.llm.model);
    if providers.is_empty() {
        println!("  Tools:     (no providers)");
    } else {
        println!("  Tools:     {}", providers.join(", "));
    }
    println!();
    println!("  Type your message and press Enter.");
    println!("  Commands: /sessions  /send <id|*> <msg>  /tools  /clear  /quit");
    println!("  Ctrl+C stops a running answer, or quits at the prompt.");
    println!();
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}
