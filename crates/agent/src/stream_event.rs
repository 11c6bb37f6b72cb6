//! Agent-level streaming events.
//!
//! `AgentEvent` is what a front end sees of a run: iteration boundaries,
//! section text as it streams, tool calls and their observations, messages
//! sent to other sessions, and the outcome.

use parley_core::provider::Usage;
use serde::{Deserialize, Serialize};

use crate::parser::SectionKind;

/// Events emitted by the agent loop while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A new LLM turn is starting.
    IterationStart { session_id: String, iteration: u32 },

    /// The model opened a section.
    SectionStart { section: SectionKind },

    /// Visible text inside the open section.
    SectionText { section: SectionKind, text: String },

    /// The model closed a section.
    SectionEnd { section: SectionKind },

    /// The loop is calling a tool.
    ToolCall {
        tool: String,
        arguments: serde_json::Value,
    },

    /// Result of a tool call or message delivery, as recorded for the model.
    Observation { content: String, success: bool },

    /// A message was published to another session.
    MessageSent {
        target: String,
        subscribers: usize,
    },

    /// The turn matched no protocol branch; a corrective prompt was added.
    Corrective { iteration: u32 },

    /// The task finished with an answer.
    FinalAnswer { content: String },

    /// The run failed.
    Error { message: String },

    /// The run is over, whatever the outcome.
    Done {
        session_id: String,
        iterations: u32,
        usage: Usage,
    },
}

impl AgentEvent {
    /// Stable name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iteration_start",
            Self::SectionStart { .. } => "section_start",
            Self::SectionText { .. } => "section_text",
            Self::SectionEnd { .. } => "section_end",
            Self::ToolCall { .. } => "tool_call",
            Self::Observation { .. } => "observation",
            Self::MessageSent { .. } => "message_sent",
            Self::Corrective { .. } => "corrective",
            Self::FinalAnswer { .. } => "final_answer",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}
