//! A single agent session: context slots, durable history, scratchpad.
//!
//! Every `qa_history` mutation is written to disk before returning, as a
//! full rewrite of the session's JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_core::error::SessionError;
use parley_core::message::Message;
use parley_core::task::Task;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::{ContextSlot, SessionContext};

/// A session shared between the agent loop and the inbox listener.
pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug)]
pub struct Session {
    id: String,
    context: SessionContext,
    scratchpad: Vec<Message>,
    path: Option<PathBuf>,
    system_prompt_override: Option<String>,
}

#[derive(Serialize)]
struct PersistedSession<'a> {
    session_id: &'a str,
    context: &'a SessionContext,
}

impl Session {
    /// A session that lives only in memory.
    pub fn in_memory(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: SessionContext::default(),
            scratchpad: Vec::new(),
            path: None,
            system_prompt_override: None,
        }
    }

    pub(crate) fn with_file(
        id: impl Into<String>,
        context: SessionContext,
        path: PathBuf,
        system_prompt_override: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            context,
            scratchpad: Vec::new(),
            path: Some(path),
            system_prompt_override,
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn slot(&self, slot: ContextSlot) -> &Message {
        self.context.slot(slot)
    }

    /// Replace a slot's content. Slots are refreshed every iteration, so this
    /// does not persist on its own; the next history write carries it.
    pub fn set_slot(&mut self, slot: ContextSlot, content: impl Into<String>) {
        *self.context.slot_mut(slot) = Message::system(content);
    }

    pub fn qa_history(&self) -> &[Message] {
        &self.context.qa_history
    }

    /// Append a user or assistant turn and persist it.
    ///
    /// Returns `Ok(false)` without touching state when the message is a
    /// system message or has blank content.
    pub fn append_qa(&mut self, msg: Message) -> Result<bool, SessionError> {
        if !SessionContext::is_history_turn(&msg) {
            debug!(session_id = %self.id, role = %msg.role, "Rejected qa_history turn");
            return Ok(false);
        }
        self.context.qa_history.push(msg);
        self.save()?;
        Ok(true)
    }

    /// Evict the oldest turns once history exceeds `max`, keeping `keep`.
    ///
    /// The evicted turns are returned so a caller can fold them into a
    /// summary (e.g. into the memory_context slot).
    pub fn compact_qa_history(&mut self, max: usize, keep: usize) -> Result<Vec<Message>, SessionError> {
        let len = self.context.qa_history.len();
        if len <= max {
            return Ok(Vec::new());
        }
        let evicted: Vec<Message> = self.context.qa_history.drain(..len - keep.min(len)).collect();
        debug!(session_id = %self.id, evicted = evicted.len(), "Compacted qa_history");
        self.save()?;
        Ok(evicted)
    }

    /// Reset every slot and the history to defaults, then persist.
    pub fn clear_context(&mut self) -> Result<(), SessionError> {
        self.context = SessionContext::default();
        if let Some(prompt) = &self.system_prompt_override {
            self.context.system_prompt = Message::system(prompt.clone());
        }
        self.save()
    }

    // ── Scratchpad ──

    pub fn scratchpad(&self) -> &[Message] {
        &self.scratchpad
    }

    pub fn push_scratch(&mut self, msg: Message) {
        self.scratchpad.push(msg);
    }

    pub fn reset_scratchpad(&mut self) {
        self.scratchpad.clear();
    }

    /// Keep only the newest `keep` entries once the scratchpad exceeds `max`.
    pub fn compact_scratchpad(&mut self, max: usize, keep: usize) -> usize {
        let len = self.scratchpad.len();
        if len <= max {
            return 0;
        }
        let evict = len - keep.min(len);
        self.scratchpad.drain(..evict);
        evict
    }

    /// Assemble the prompt for one LLM turn.
    ///
    /// Order: every non-blank context slot, the history, the task
    /// description as a user turn, then the scratchpad. Never mutates.
    pub fn build_messages(&self, task: &Task, scratchpad: &[Message]) -> Vec<Message> {
        let mut messages: Vec<Message> = ContextSlot::ALL
            .iter()
            .map(|slot| self.context.slot(*slot))
            .filter(|msg| !msg.is_blank())
            .cloned()
            .collect();
        messages.extend(self.context.qa_history.iter().cloned());
        messages.push(Message::user(task.description.clone()));
        messages.extend(scratchpad.iter().cloned());
        messages
    }

    /// Write `{session_id, context}` to the session file.
    ///
    /// Writes to a sibling temp file first and renames it into place.
    pub fn save(&self) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SessionError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let doc = PersistedSession {
            session_id: &self.id,
            context: &self.context,
        };
        let content = serde_json::to_string_pretty(&doc)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| SessionError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| SessionError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}
