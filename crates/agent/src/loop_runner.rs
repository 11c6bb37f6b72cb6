//! The ReAct loop: reason, act, observe, until an answer or a budget ends it.
//!
//! Each iteration streams one LLM turn through a [`TagStreamParser`] and
//! dispatches on exactly one outcome, in this order:
//!
//! 1. `<final_answer>` → record it and finish
//! 2. `<action>` with a valid payload → call the tool, observe the result
//! 3. `<communication>` with a valid payload → publish to the target session
//! 4. anything else → keep the prose, append a corrective prompt
//!
//! Tool failures and delivery problems become observations; they never end
//! the run. A turn that times out or whose model call fails also becomes an
//! observation, until `consecutive_failure_limit` such turns in a row end the
//! run. Running out of iterations or time ends it with [`BUDGET_EXHAUSTED`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parley_bus::MessageBus;
use parley_config::{AgentConfig, LlmConfig};
use parley_core::bus::BROADCAST;
use parley_core::error::{Error, Result};
use parley_core::message::Message;
use parley_core::provider::{Provider, ProviderRequest, Usage};
use parley_core::task::Task;
use parley_session::{ContextSlot, SharedSession};
use parley_tools::ToolGateway;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::locks::SessionLocks;
use crate::parser::{SectionBuffers, SectionEvent, SectionKind, TagStreamParser};
use crate::prompt::{DefaultPromptBuilder, PromptBuilder};
use crate::protocol::{ActionPayload, CommunicationPayload, strip_protocol_blocks};
use crate::stream_event::AgentEvent;

/// Result of a run that ended without a final answer.
pub const BUDGET_EXHAUSTED: &str =
    "Task ended: the iteration or time budget ran out before a final answer was reached.";

/// Budgets and limits of the loop, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub temperature: f32,
    /// Ceiling on tokens per turn
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub first_turn_tokens: u32,
    pub turn_tokens: u32,
    pub trailing_chunks: usize,
    pub timeout_margin: Duration,
    pub first_turn_min: Duration,
    pub turn_min: Duration,
    pub first_turn_cap: Duration,
    pub turn_cap: Duration,
    pub scratchpad_limit: usize,
    pub scratchpad_keep: usize,
    pub qa_limit: usize,
    pub qa_keep: usize,
    pub observation_max_chars: usize,
    pub consecutive_failure_limit: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default(), &AgentConfig::default())
    }
}

impl LoopConfig {
    pub fn from_config(llm: &LlmConfig, agent: &AgentConfig) -> Self {
        Self {
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            max_iterations: agent.max_iterations,
            timeout: agent.timeout(),
            first_turn_tokens: agent.first_turn_tokens,
            turn_tokens: agent.turn_tokens,
            trailing_chunks: agent.trailing_chunks,
            timeout_margin: Duration::from_secs(agent.timeout_margin_secs),
            first_turn_min: Duration::from_secs(agent.first_turn_min_secs),
            turn_min: Duration::from_secs(agent.turn_min_secs),
            first_turn_cap: Duration::from_secs(agent.first_turn_cap_secs),
            turn_cap: Duration::from_secs(agent.turn_cap_secs),
            scratchpad_limit: agent.scratchpad_limit,
            scratchpad_keep: agent.scratchpad_keep,
            qa_limit: agent.qa_limit,
            qa_keep: agent.qa_keep,
            observation_max_chars: agent.observation_max_chars,
            consecutive_failure_limit: agent.consecutive_failure_limit,
        }
    }

    /// Token budget of iteration `n`. The opening turn of a task gets more.
    pub fn token_budget(&self, n: u32, scratchpad_empty: bool) -> u32 {
        let wanted = if n == 1 && scratchpad_empty {
            self.first_turn_tokens
        } else {
            self.turn_tokens
        };
        wanted.min(self.max_tokens)
    }

    /// Wall-clock budget of iteration `n`, given the time left for the task.
    pub fn iteration_budget(&self, n: u32, remaining: Duration) -> Result<Duration> {
        if remaining <= self.timeout_margin {
            return Err(Error::Timeout(format!(
                "only {:.1}s of the task budget left",
                remaining.as_secs_f64()
            )));
        }
        let (floor, cap) = if n == 1 {
            (self.first_turn_min, self.first_turn_cap)
        } else {
            (self.turn_min, self.turn_cap)
        };
        Ok(floor.max(remaining - self.timeout_margin).min(cap))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Record the task description as a user turn before the first iteration
    pub record_user_turn: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            record_user_turn: true,
        }
    }
}

/// What one streamed turn produced.
#[derive(Debug, Default)]
struct TurnOutput {
    raw: String,
    sections: SectionBuffers,
    usage: Usage,
    /// An action, communication or final answer section was closed
    settled: bool,
}

enum Outcome {
    Answer(String),
    Exhausted,
}

/// The ReAct controller.
///
/// One `AgentLoop` can serve many sessions; runs on the same session are
/// serialized through the shared [`SessionLocks`].
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolGateway>,
    bus: Option<Arc<MessageBus>>,
    locks: SessionLocks,
    prompts: Arc<dyn PromptBuilder>,
    events: Option<mpsc::Sender<AgentEvent>>,
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolGateway>, config: LoopConfig) -> Self {
        Self {
            provider,
            tools,
            bus: None,
            locks: SessionLocks::new(),
            prompts: Arc::new(DefaultPromptBuilder),
            events: None,
            config,
        }
    }

    /// Attach a message bus for `<communication>` and peer discovery.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share run locks with other loops in the process.
    pub fn with_locks(mut self, locks: SessionLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Stream [`AgentEvent`]s of every run to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn bus(&self) -> Option<&Arc<MessageBus>> {
        self.bus.as_ref()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run `task` on `session` until it has an answer or its budget is spent.
    ///
    /// Returns the final answer, or [`BUDGET_EXHAUSTED`] when iterations or
    /// time ran out. Any other failure marks the task failed and is returned.
    pub async fn run(&self, session: &SharedSession, task: &mut Task, options: RunOptions) -> Result<String> {
        let session_id = session.lock().await.id().to_string();
        let _run = self.locks.acquire(&session_id).await;

        session.lock().await.reset_scratchpad();
        task.start();
        info!(session_id = %session_id, task_id = %task.id, "Agent run starting");

        let outcome = self.run_inner(session, &session_id, task, options).await;
        let result = match outcome {
            Ok(Outcome::Answer(answer)) => {
                info!(
                    session_id = %session_id,
                    iterations = task.current_iteration,
                    total_tokens = task.usage.total_tokens,
                    "Agent run completed"
                );
                Ok(answer)
            }
            Ok(Outcome::Exhausted) => Ok(self.exhausted(&session_id, task, None)),
            Err(e) if e.is_timeout() => Ok(self.exhausted(&session_id, task, Some(&e))),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Agent run failed");
                task.fail(e.to_string());
                if let Err(save_err) = session.lock().await.save() {
                    warn!(session_id = %session_id, error = %save_err, "Saving session after failure failed");
                }
                self.emit(AgentEvent::Error {
                    message: e.to_string(),
                })
                .await;
                Err(e)
            }
        };

        self.emit(AgentEvent::Done {
            session_id,
            iterations: task.current_iteration,
            usage: task.usage,
        })
        .await;
        result
    }

    fn exhausted(&self, session_id: &str, task: &mut Task, cause: Option<&Error>) -> String {
        match cause {
            Some(e) => warn!(session_id = %session_id, reason = %e, "Time budget exhausted"),
            None => warn!(
                session_id = %session_id,
                iterations = task.current_iteration,
                "Iteration budget exhausted"
            ),
        }
        task.complete(BUDGET_EXHAUSTED);
        BUDGET_EXHAUSTED.to_string()
    }

    async fn run_inner(
        &self,
        session: &SharedSession,
        session_id: &str,
        task: &mut Task,
        options: RunOptions,
    ) -> Result<Outcome> {
        if options.record_user_turn {
            session
                .lock()
                .await
                .append_qa(Message::user(task.description.clone()))?;
        }

        let max_iterations = task.max_iterations.min(self.config.max_iterations);
        let timeout = task.timeout.min(self.config.timeout);
        let started = Instant::now();
        let mut failures = 0u32;
        let mut turn_failures = 0u32;
        let mut n = 0u32;

        while n < max_iterations && started.elapsed() < timeout {
            n += 1;
            task.current_iteration = n;
            debug!(session_id = %session_id, iteration = n, "Agent loop iteration");
            self.emit(AgentEvent::IterationStart {
                session_id: session_id.to_string(),
                iteration: n,
            })
            .await;

            // ── Context ──
            self.refresh_slots(session, session_id).await;
            let (messages, scratchpad_empty) = {
                let s = session.lock().await;
                (s.build_messages(task, s.scratchpad()), s.scratchpad().is_empty())
            };

            // ── Budgets ──
            let mut request = ProviderRequest::new(self.config.model.clone(), messages);
            request.temperature = self.config.temperature;
            request.max_tokens = Some(self.config.token_budget(n, scratchpad_empty));
            let remaining = timeout.saturating_sub(started.elapsed());
            let budget = self.config.iteration_budget(n, remaining)?;

            // ── LLM turn ──
            let mut turn = TurnOutput::default();
            let streamed = tokio::time::timeout(budget, self.stream_turn(request, &mut turn)).await;
            task.record_usage(turn.usage);
            let failed = match streamed {
                Ok(Ok(())) => None,
                Ok(Err(Error::Provider(e))) => Some(Error::Provider(e)),
                Ok(Err(e)) => return Err(e),
                // A turn that already settled keeps its outcome
                Err(_) if turn.settled => {
                    debug!(session_id = %session_id, iteration = n, "Turn settled before its budget expired");
                    None
                }
                Err(_) => Some(Error::Timeout(format!(
                    "turn timed out after {:.0}s",
                    budget.as_secs_f64()
                ))),
            };
            if let Some(e) = failed {
                turn_failures += 1;
                if turn_failures >= self.config.consecutive_failure_limit.max(1) {
                    return Err(e);
                }
                self.turn_failed(session, session_id, n, &e).await;
                continue;
            }
            turn_failures = 0;

            // ── Dispatch ──
            if let Some(answer) = turn.sections.present(SectionKind::FinalAnswer) {
                let answer = answer.to_string();
                session
                    .lock()
                    .await
                    .append_qa(Message::assistant(answer.clone()))?;
                self.emit(AgentEvent::FinalAnswer {
                    content: answer.clone(),
                })
                .await;
                task.complete(answer.clone());
                self.compact(session).await?;
                return Ok(Outcome::Answer(answer));
            }

            if let Some(action) = parse_section(&turn.sections, SectionKind::Action, ActionPayload::parse) {
                self.act(session, action, &mut failures).await;
            } else if let Some(comm) =
                parse_section(&turn.sections, SectionKind::Communication, CommunicationPayload::parse)
            {
                self.communicate(session, session_id, comm).await;
            } else {
                self.correct(session, session_id, n, &turn.raw).await;
            }

            self.compact(session).await?;
        }

        Ok(Outcome::Exhausted)
    }

    /// Stream one turn into `turn`, stopping shortly after a terminal section closes.
    async fn stream_turn(&self, request: ProviderRequest, turn: &mut TurnOutput) -> Result<()> {
        let mut rx = self.provider.stream(request).await?;
        let mut parser = TagStreamParser::new();
        // Chunks still accepted after the turn settled, for trailing usage
        let mut trailing: Option<usize> = None;

        loop {
            if trailing == Some(0) {
                break;
            }
            let Some(item) = rx.recv().await else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) if trailing.is_some() => {
                    debug!(error = %e, "Stream error after turn settled, ignoring");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(usage) = chunk.usage {
                turn.usage = turn.usage.add(usage);
            }

            if let Some(left) = trailing.as_mut() {
                *left -= 1;
            } else if let Some(text) = &chunk.content {
                turn.raw.push_str(text);
                for event in parser.feed(text) {
                    let settles = matches!(event, SectionEvent::End(kind) if kind.is_terminal());
                    self.forward(&event).await;
                    turn.sections.apply(&event);
                    if settles {
                        turn.settled = true;
                        trailing = Some(self.config.trailing_chunks);
                        break;
                    }
                }
            }

            if chunk.done {
                break;
            }
        }

        if trailing.is_none() {
            for event in parser.finish() {
                self.forward(&event).await;
                turn.sections.apply(&event);
            }
        }
        // Dropping the receiver here releases the provider's stream
        Ok(())
    }

    async fn act(&self, session: &SharedSession, action: ActionPayload, failures: &mut u32) {
        info!(tool = %action.tool, "Calling tool");
        let arguments = Value::Object(action.arguments.clone());
        self.emit(AgentEvent::ToolCall {
            tool: action.tool.clone(),
            arguments: arguments.clone(),
        })
        .await;

        let (observation, success) = match self.tools.call_tool(&action.tool, arguments).await {
            Ok(value) => {
                let text = truncate_chars(&render_value(value), self.config.observation_max_chars);
                (format!("Observation: {text}"), true)
            }
            Err(e) => {
                warn!(tool = %action.tool, error = %e, "Tool call failed");
                (format!("Observation: tool call failed: {e}"), false)
            }
        };
        self.emit(AgentEvent::Observation {
            content: observation.clone(),
            success,
        })
        .await;

        let mut s = session.lock().await;
        s.push_scratch(Message::assistant(format!("Action: {}", action.to_json())));
        s.push_scratch(Message::user(observation));

        if success {
            *failures = 0;
        } else {
            *failures += 1;
            if *failures >= self.config.consecutive_failure_limit.max(1) {
                s.push_scratch(Message::system(self.prompts.failure_hint(*failures)));
                *failures = 0;
            }
        }
    }

    async fn communicate(&self, session: &SharedSession, session_id: &str, comm: CommunicationPayload) {
        let observation = if comm.target == session_id {
            format!("Observation: not sent; {} is this session", comm.target)
        } else if let Some(bus) = &self.bus {
            let sent = if comm.target == BROADCAST {
                bus.broadcast(session_id, &comm.message).await
            } else {
                bus.publish(session_id, &comm.target, &comm.message, None).await
            };
            match sent {
                Ok(subscribers) => {
                    info!(from = %session_id, to = %comm.target, subscribers, "Message sent");
                    self.emit(AgentEvent::MessageSent {
                        target: comm.target.clone(),
                        subscribers,
                    })
                    .await;
                    if subscribers == 0 {
                        format!(
                            "Observation: delivered to {} (0 subscribers); the target may be offline",
                            comm.target
                        )
                    } else {
                        format!("Observation: delivered to {} ({subscribers} subscriber(s))", comm.target)
                    }
                }
                Err(e) => {
                    warn!(to = %comm.target, error = %e, "Message delivery failed");
                    format!("Observation: message to {} failed: {e}", comm.target)
                }
            }
        } else {
            "Observation: messaging is not available in this session".to_string()
        };

        self.emit(AgentEvent::Observation {
            content: observation.clone(),
            success: observation.contains("delivered"),
        })
        .await;

        let mut s = session.lock().await;
        s.push_scratch(Message::assistant(format!("Communication: {}", comm.to_json())));
        s.push_scratch(Message::user(observation));
    }

    /// Record a turn that timed out or whose provider call failed, so the
    /// next iteration can retry with that in view.
    async fn turn_failed(&self, session: &SharedSession, session_id: &str, iteration: u32, error: &Error) {
        warn!(session_id = %session_id, iteration, error = %error, "Turn failed, retrying");
        let observation = match error {
            Error::Timeout(reason) => format!("Observation: {reason}"),
            other => format!("Observation: the model call failed: {other}"),
        };
        self.emit(AgentEvent::Observation {
            content: observation.clone(),
            success: false,
        })
        .await;
        session.lock().await.push_scratch(Message::user(observation));
    }

    async fn correct(&self, session: &SharedSession, session_id: &str, iteration: u32, raw: &str) {
        debug!(session_id = %session_id, iteration, "Turn matched no protocol branch");
        let leftover = strip_protocol_blocks(raw);

        {
            let mut s = session.lock().await;
            if !leftover.is_empty() {
                s.push_scratch(Message::assistant(leftover));
            }
            s.push_scratch(Message::system(self.prompts.corrective_prompt()));
        }
        self.emit(AgentEvent::Corrective { iteration }).await;
    }

    async fn compact(&self, session: &SharedSession) -> Result<()> {
        let mut s = session.lock().await;
        let dropped = s.compact_scratchpad(self.config.scratchpad_limit, self.config.scratchpad_keep);
        if dropped > 0 {
            debug!(session_id = %s.id(), dropped, "Scratchpad compacted");
        }
        let evicted = s.compact_qa_history(self.config.qa_limit, self.config.qa_keep)?;
        if !evicted.is_empty() {
            info!(session_id = %s.id(), evicted = evicted.len(), "History compacted");
        }
        Ok(())
    }

    /// Refresh the tool list, the clock and the peer list in the context slots.
    async fn refresh_slots(&self, session: &SharedSession, session_id: &str) {
        let tools = match self.tools.list_tools().await {
            Ok(tools) => Some(self.prompts.render_tools(&tools)),
            Err(e) => {
                warn!(error = %e, "Listing tools failed, keeping previous list");
                None
            }
        };

        let peers = match &self.bus {
            Some(bus) => match bus.list_active().await {
                Ok(active) => {
                    let others: Vec<String> = active.into_iter().filter(|id| id != session_id).collect();
                    Some(self.prompts.render_active_sessions(&others))
                }
                Err(e) => {
                    warn!(error = %e, "Listing active sessions failed, keeping previous list");
                    None
                }
            },
            None => Some(self.prompts.render_active_sessions(&[])),
        };

        let now = self.prompts.render_time(Local::now());

        let mut s = session.lock().await;
        if let Some(tools) = tools {
            s.set_slot(ContextSlot::AvailableTools, tools);
        }
        if let Some(peers) = peers {
            s.set_slot(ContextSlot::ActiveSessions, peers);
        }
        s.set_slot(ContextSlot::CurrentTime, now);
    }

    async fn forward(&self, event: &SectionEvent) {
        let event = match event {
            SectionEvent::Start(section) => AgentEvent::SectionStart { section: *section },
            SectionEvent::Text(section, text) => AgentEvent::SectionText {
                section: *section,
                text: text.clone(),
            },
            SectionEvent::End(section) => AgentEvent::SectionEnd { section: *section },
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            // A closed receiver just means nobody is watching
            let _ = tx.send(event).await;
        }
    }
}

/// Parse the payload of `kind` if that section was opened.
fn parse_section<T>(
    sections: &SectionBuffers,
    kind: SectionKind,
    parse: fn(&str) -> std::result::Result<T, parley_core::error::ProtocolError>,
) -> Option<T> {
    if !sections.opened(kind) {
        return None;
    }
    match parse(sections.get(kind)) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(section = %kind, error = %e, "Ignoring malformed section");
            None
        }
    }
}

fn render_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}
