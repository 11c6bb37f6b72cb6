//! Fixed-slot session context and its lenient decoding.

use parley_core::message::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, an autonomous agent that solves tasks \
step by step. You can call tools and exchange messages with other agent sessions. Be accurate \
and concise, and never invent tool results.";

pub const DEFAULT_TOOL_POLICY: &str = "Tool usage policy:
- Put exactly one strict JSON object inside <action>: {\"tool\": \"<name>\", \"arguments\": {...}}. Use double quotes.
- Emit at most one <action> per turn, then wait for its observation.
- Do not repeat a call with identical arguments; reuse earlier observations instead.
- Most tasks need no more than three tool calls.
- If a tool call fails, correct it once. If it fails again, answer with what you have.";

pub const DEFAULT_REACT_PROMPT: &str = "Answer using these tags only.
Start with <thinking>your reasoning</thinking>, then emit exactly one of:
<action>{\"tool\": \"<name>\", \"arguments\": {...}}</action> to call a tool,
<communication>{\"target\": \"<session_id>\", \"message\": \"<text>\"}</communication> to message another session,
<final_answer>your answer</final_answer> when the task is done.";

pub const NO_TOOLS: &str = "No tools are available.";
pub const NO_PEERS: &str = "No other sessions are online.";

/// The named context slots, in prompt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextSlot {
    SystemPrompt,
    ToolPolicy,
    AvailableTools,
    MemoryContext,
    CurrentTime,
    ActiveSessions,
    ReactPrompt,
}

impl ContextSlot {
    pub const ALL: [ContextSlot; 7] = [
        ContextSlot::SystemPrompt,
        ContextSlot::ToolPolicy,
        ContextSlot::AvailableTools,
        ContextSlot::MemoryContext,
        ContextSlot::CurrentTime,
        ContextSlot::ActiveSessions,
        ContextSlot::ReactPrompt,
    ];

    /// Key used in the persisted context object.
    pub fn key(&self) -> &'static str {
        match self {
            ContextSlot::SystemPrompt => "system_prompt",
            ContextSlot::ToolPolicy => "tool_policy",
            ContextSlot::AvailableTools => "available_tools",
            ContextSlot::MemoryContext => "memory_context",
            ContextSlot::CurrentTime => "current_time",
            ContextSlot::ActiveSessions => "active_sessions",
            ContextSlot::ReactPrompt => "react_prompt",
        }
    }

    fn default_content(&self) -> &'static str {
        match self {
            ContextSlot::SystemPrompt => DEFAULT_SYSTEM_PROMPT,
            ContextSlot::ToolPolicy => DEFAULT_TOOL_POLICY,
            ContextSlot::AvailableTools => NO_TOOLS,
            ContextSlot::MemoryContext | ContextSlot::CurrentTime => "",
            ContextSlot::ActiveSessions => NO_PEERS,
            ContextSlot::ReactPrompt => DEFAULT_REACT_PROMPT,
        }
    }
}

/// Every slot plus the durable history, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub system_prompt: Message,
    pub tool_policy: Message,
    pub available_tools: Message,
    pub memory_context: Message,
    pub current_time: Message,
    pub active_sessions: Message,
    pub react_prompt: Message,
    pub qa_history: Vec<Message>,
}

impl Default for SessionContext {
    fn default() -> Self {
        let slot = |s: ContextSlot| Message::system(s.default_content());
        Self {
            system_prompt: slot(ContextSlot::SystemPrompt),
            tool_policy: slot(ContextSlot::ToolPolicy),
            available_tools: slot(ContextSlot::AvailableTools),
            memory_context: slot(ContextSlot::MemoryContext),
            current_time: slot(ContextSlot::CurrentTime),
            active_sessions: slot(ContextSlot::ActiveSessions),
            react_prompt: slot(ContextSlot::ReactPrompt),
            qa_history: Vec::new(),
        }
    }
}

impl SessionContext {
    pub fn slot(&self, slot: ContextSlot) -> &Message {
        match slot {
            ContextSlot::SystemPrompt => &self.system_prompt,
            ContextSlot::ToolPolicy => &self.tool_policy,
            ContextSlot::AvailableTools => &self.available_tools,
            ContextSlot::MemoryContext => &self.memory_context,
            ContextSlot::CurrentTime => &self.current_time,
            ContextSlot::ActiveSessions => &self.active_sessions,
            ContextSlot::ReactPrompt => &self.react_prompt,
        }
    }

    pub fn slot_mut(&mut self, slot: ContextSlot) -> &mut Message {
        match slot {
            ContextSlot::SystemPrompt => &mut self.system_prompt,
            ContextSlot::ToolPolicy => &mut self.tool_policy,
            ContextSlot::AvailableTools => &mut self.available_tools,
            ContextSlot::MemoryContext => &mut self.memory_context,
            ContextSlot::CurrentTime => &mut self.current_time,
            ContextSlot::ActiveSessions => &mut self.active_sessions,
            ContextSlot::ReactPrompt => &mut self.react_prompt,
        }
    }

    /// Whether a message may live in `qa_history`.
    pub fn is_history_turn(msg: &Message) -> bool {
        matches!(msg.role, Role::User | Role::Assistant) && !msg.is_blank()
    }

    /// Decode a persisted context, keeping defaults for anything malformed.
    ///
    /// Unknown keys are ignored. A slot that is not a `{role, content}` object
    /// keeps its default; history turns that are not valid user/assistant
    /// messages are dropped individually.
    pub fn from_value_lenient(value: &Value) -> Self {
        let mut context = Self::default();
        let Some(obj) = value.as_object() else {
            warn!("Session context is not an object, using defaults");
            return context;
        };

        for slot in ContextSlot::ALL {
            let Some(raw) = obj.get(slot.key()) else {
                continue;
            };
            match serde_json::from_value::<Message>(raw.clone()) {
                Ok(msg) => *context.slot_mut(slot) = msg,
                Err(e) => warn!(slot = slot.key(), error = %e, "Ignoring malformed context slot"),
            }
        }

        if let Some(turns) = obj.get("qa_history").and_then(Value::as_array) {
            context.qa_history = turns
                .iter()
                .filter_map(|t| serde_json::from_value::<Message>(t.clone()).ok())
                .filter(Self::is_history_turn)
                .collect();
            let dropped = turns.len() - context.qa_history.len();
            if dropped > 0 {
                warn!(dropped, "Dropped invalid qa_history entries");
            }
        }

        context
    }
}
