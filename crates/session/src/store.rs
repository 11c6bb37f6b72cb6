//! File-backed session store: one JSON document per session id.
//!
//! Storage location: `{dir}/{session_id}.json`, containing
//! `{"session_id": "...", "context": {...}}`.
//!
//! Loading never fails: a missing file starts a fresh session and a corrupt
//! file is logged and replaced on the next write.

use std::path::{Path, PathBuf};

use parley_core::message::Message;
use tracing::{debug, warn};

use crate::context::SessionContext;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    system_prompt: Option<String>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            system_prompt: None,
        }
    }

    /// Use `prompt` instead of the built-in system prompt for fresh sessions.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds `session_id`. Path separators and other unusual
    /// characters in the id are replaced so the file stays inside `dir`.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Load `session_id` from disk, or start a fresh session.
    pub fn open(&self, session_id: &str) -> Session {
        let path = self.path_for(session_id);
        let context = match Self::load_context(&path) {
            Some(context) => context,
            None => {
                let mut context = SessionContext::default();
                if let Some(prompt) = &self.system_prompt {
                    context.system_prompt = Message::system(prompt.clone());
                }
                context
            }
        };
        debug!(
            session_id,
            path = %path.display(),
            history = context.qa_history.len(),
            "Session loaded"
        );
        Session::with_file(session_id, context, path, self.system_prompt.clone())
    }

    fn load_context(path: &Path) -> Option<SessionContext> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return None, // File doesn't exist yet, start fresh
        };

        let doc: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt session file, starting fresh");
                return None;
            }
        };

        match doc.get("context") {
            Some(context) => Some(SessionContext::from_value_lenient(context)),
            None => {
                warn!(path = %path.display(), "Session file has no context, starting fresh");
                None
            }
        }
    }
}
