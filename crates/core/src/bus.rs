//! The message exchanged between sessions over the bus.
//!
//! Wire format: `{"from": str, "to": str, "message": str, "ts": int, ...}`.
//! Extra fields survive a round trip untouched.

use serde::{Deserialize, Serialize};

/// Target that addresses every online session.
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(default)]
    pub from: String,

    #[serde(default)]
    pub to: String,

    #[serde(default)]
    pub message: String,

    /// Unix timestamp (seconds)
    #[serde(default)]
    pub ts: i64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BusMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message: message.into(),
            ts: chrono::Utc::now().timestamp(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Map<String, serde_json::Value>) -> Self {
        for (key, value) in extra {
            if !matches!(key.as_str(), "from" | "to" | "message" | "ts") {
                self.extra.insert(key, value);
            }
        }
        self
    }

    /// Whether this message should be delivered to `session_id`.
    ///
    /// Empty targets and broadcasts match every session; nothing the session
    /// sent itself ever matches.
    pub fn is_for(&self, session_id: &str) -> bool {
        let addressed = self.to.is_empty() || self.to == BROADCAST || self.to == session_id;
        addressed && self.from != session_id
    }
}
