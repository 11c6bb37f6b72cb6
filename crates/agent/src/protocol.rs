//! Payloads carried inside `<action>` and `<communication>` sections.

use parley_core::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::parser::{MAX_TAG_LEN, tag_name};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// A message the model wants delivered to another session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationPayload {
    pub target: String,
    pub message: String,
}

impl ActionPayload {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value = parse_object("action", raw)?;
        let tool = required_str("action", &value, "tool")?;
        let arguments = match value.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ProtocolError::InvalidJson {
                    section: "action".into(),
                    reason: "\"arguments\" must be an object".into(),
                });
            }
        };
        Ok(Self { tool, arguments })
    }

    /// Compact JSON form, as echoed into the scratchpad.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"tool\":\"{}\"}}", self.tool))
    }
}

impl CommunicationPayload {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value = parse_object("communication", raw)?;
        Ok(Self {
            target: required_str("communication", &value, "target")?,
            message: required_str("communication", &value, "message")?,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"target\":\"{}\"}}", self.target))
    }
}

fn parse_object(section: &str, raw: &str) -> Result<Map<String, Value>, ProtocolError> {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::InvalidJson {
            section: section.into(),
            reason: "expected a JSON object".into(),
        }),
        Err(e) => Err(ProtocolError::InvalidJson {
            section: section.into(),
            reason: e.to_string(),
        }),
    }
}

fn required_str(section: &str, map: &Map<String, Value>, field: &str) -> Result<String, ProtocolError> {
    match map.get(field).and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ProtocolError::MissingField {
            section: section.into(),
            field: field.into(),
        }),
    }
}

/// Strip a surrounding Markdown code fence (```json ... ```), if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") up to the first newline
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Remove `<action>` and `<communication>` blocks from a raw reply.
///
/// Each block runs to its closing tag, or to the end of the text when it was
/// never closed. What remains is the prose worth keeping on a failed turn.
pub fn strip_protocol_blocks(raw: &str) -> String {
    let mut out = raw.to_string();
    for tag in ["action", "communication"] {
        out = strip_block(&out, tag);
    }
    out.trim().to_string()
}

fn strip_block(text: &str, tag: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut kept = 0;
    let mut inside = false;
    let mut cursor = 0;

    while let Some(lt) = text[cursor..].find('<').map(|i| cursor + i) {
        let Some(gt) = text[lt..].find('>').map(|i| lt + i) else {
            break;
        };
        let body = &text[lt + 1..gt];
        // Same limits as the stream parser: no nested `<`, no newline, short
        if body.contains(['<', '\n']) || body.len() > MAX_TAG_LEN {
            cursor = lt + 1;
            continue;
        }
        let (closing, name) = tag_name(body);
        if name == tag {
            if !closing && !inside {
                out.push_str(&text[kept..lt]);
                inside = true;
            } else if closing && inside {
                kept = gt + 1;
                inside = false;
            }
        }
        cursor = gt + 1;
    }

    if !inside {
        out.push_str(&text[kept..]);
    }
    out
}
