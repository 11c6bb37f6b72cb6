//! Text the loop writes into context slots and the scratchpad.
//!
//! The fixed slot texts (identity, tool policy, tag protocol) live with the
//! session; the builder renders only what changes per iteration.

use chrono::{DateTime, Local};
use parley_core::tool::CachedTool;
use parley_session::context::{NO_PEERS, NO_TOOLS};

pub const CORRECTIVE_PROMPT: &str = "Your last reply did not follow the protocol. Reply with \
<thinking>...</thinking> followed by exactly one of: <action>{\"tool\": \"<name>\", \
\"arguments\": {...}}</action> with strict JSON, <communication>{\"target\": \"<session_id>\", \
\"message\": \"<text>\"}</communication>, or <final_answer>...</final_answer>.";

/// Renders the per-iteration parts of the prompt.
pub trait PromptBuilder: Send + Sync {
    /// Content of the `available_tools` slot.
    fn render_tools(&self, tools: &[CachedTool]) -> String;

    /// Content of the `active_sessions` slot; `peers` excludes the caller.
    fn render_active_sessions(&self, peers: &[String]) -> String;

    /// Content of the `current_time` slot.
    fn render_time(&self, now: DateTime<Local>) -> String;

    /// System message appended after a turn that followed no protocol branch.
    fn corrective_prompt(&self) -> String {
        CORRECTIVE_PROMPT.to_string()
    }

    /// System hint appended after `failures` consecutive failed tool calls.
    fn failure_hint(&self, failures: u32) -> String {
        format!(
            "The last {failures} tool calls failed. Check the tool name and the argument names \
             against the available tools, or give a <final_answer> with what you already know."
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn render_tools(&self, tools: &[CachedTool]) -> String {
        if tools.is_empty() {
            return NO_TOOLS.to_string();
        }
        let blocks: Vec<String> = tools.iter().map(CachedTool::format_for_llm).collect();
        format!("Available tools:\n\n{}", blocks.join("\n\n"))
    }

    fn render_active_sessions(&self, peers: &[String]) -> String {
        if peers.is_empty() {
            return NO_PEERS.to_string();
        }
        let mut out = String::from(
            "Other sessions online (reach them with <communication>):",
        );
        for peer in peers {
            out.push_str("\n- ");
            out.push_str(peer);
        }
        out
    }

    fn render_time(&self, now: DateTime<Local>) -> String {
        format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S %Z (%A)"))
    }
}
