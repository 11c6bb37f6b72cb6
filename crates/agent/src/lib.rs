//! The agent loop of Parley: the Reason → Act → Observe cycle.
//!
//! 1. **Assemble** the session context (slots, history, task, scratchpad)
//! 2. **Stream** one LLM turn through the [`TagStreamParser`]
//! 3. **Dispatch** on the turn: call a tool, message another session,
//!    answer, or correct a malformed reply
//! 4. **Repeat** until an answer arrives or the iteration or time budget
//!    runs out
//!
//! The [`InboxListener`] re-enters the loop when another session sends a
//! message; [`SessionLocks`] keep runs on one session from interleaving.

pub mod inbox;
pub mod locks;
pub mod loop_runner;
pub mod parser;
pub mod prompt;
pub mod protocol;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use inbox::{InboxHandle, InboxListener};
pub use locks::SessionLocks;
pub use loop_runner::{AgentLoop, BUDGET_EXHAUSTED, LoopConfig, RunOptions};
pub use parser::{SectionEvent, SectionKind, TagStreamParser};
pub use prompt::{DefaultPromptBuilder, PromptBuilder};
pub use protocol::{ActionPayload, CommunicationPayload};
pub use stream_event::AgentEvent;
