//! Streaming classifier for the agent's tagged output.
//!
//! The model answers with `<thinking>`, `<action>`, `<communication>` and
//! `<final_answer>` sections. Replies arrive as arbitrary fragments, so the
//! parser is a character-level state machine that can resume mid-tag.
//!
//! Rules:
//! - Text outside any section is dropped.
//! - A closing tag that does not match the open section is swallowed.
//! - Any other tag inside a section (e.g. `<b>`) is passed through as text.
//! - A candidate tag longer than [`MAX_TAG_LEN`], or one broken by a newline
//!   or a second `<`, is abandoned and flushed as literal text.

use serde::{Deserialize, Serialize};

/// Longest tag body buffered before it is treated as plain text.
pub const MAX_TAG_LEN: usize = 64;

/// The section kinds the agent protocol knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Thinking,
    Action,
    Communication,
    FinalAnswer,
}

impl SectionKind {
    pub fn from_tag(name: &str) -> Option<Self> {
        match name {
            "thinking" => Some(Self::Thinking),
            "action" => Some(Self::Action),
            "communication" => Some(Self::Communication),
            "final_answer" => Some(Self::FinalAnswer),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Action => "action",
            Self::Communication => "communication",
            Self::FinalAnswer => "final_answer",
        }
    }

    /// Whether closing this section ends the useful part of a turn.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Thinking)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionEvent {
    Start(SectionKind),
    Text(SectionKind, String),
    End(SectionKind),
}

#[derive(Debug, Default)]
pub struct TagStreamParser {
    section: Option<SectionKind>,
    /// Body of a tag being read, without the leading `<`
    tag: Option<String>,
    /// Visible text not yet emitted
    text: String,
}

impl TagStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The section currently open, if any.
    pub fn current(&self) -> Option<SectionKind> {
        self.section
    }

    /// Consume one fragment and return the events it completes.
    ///
    /// Adjacent text is coalesced, so a fragment yields at most one `Text`
    /// event between structural events.
    pub fn feed(&mut self, fragment: &str) -> Vec<SectionEvent> {
        let mut events = Vec::new();

        for c in fragment.chars() {
            let Some(mut tag) = self.tag.take() else {
                if c == '<' {
                    self.tag = Some(String::new());
                } else {
                    self.literal_char(c);
                }
                continue;
            };

            match c {
                '>' => self.resolve(&tag, &mut events),
                '<' => {
                    self.literal_tag(&tag);
                    self.tag = Some(String::new());
                }
                '\n' => {
                    self.literal_tag(&tag);
                    self.literal_char('\n');
                }
                _ => {
                    tag.push(c);
                    if tag.len() > MAX_TAG_LEN {
                        self.literal_tag(&tag);
                    } else {
                        self.tag = Some(tag);
                    }
                }
            }
        }

        self.flush_text(&mut events);
        events
    }

    /// Flush a dangling partial tag at end of stream.
    pub fn finish(&mut self) -> Vec<SectionEvent> {
        let mut events = Vec::new();
        if let Some(tag) = self.tag.take() {
            self.literal_tag(&tag);
        }
        self.flush_text(&mut events);
        events
    }

    fn resolve(&mut self, body: &str, events: &mut Vec<SectionEvent>) {
        let (closing, name) = tag_name(body);
        let kind = SectionKind::from_tag(&name);

        if closing {
            // Mismatched or unknown closers vanish without a trace
            if let Some(kind) = kind.filter(|k| self.section == Some(*k)) {
                self.flush_text(events);
                events.push(SectionEvent::End(kind));
                self.section = None;
            }
            return;
        }

        match kind {
            Some(kind) if self.section == Some(kind) => {}
            Some(kind) => {
                // A new section implicitly replaces an unclosed one
                self.flush_text(events);
                events.push(SectionEvent::Start(kind));
                self.section = Some(kind);
            }
            None => {
                self.literal_char('<');
                self.literal_str(body);
                self.literal_char('>');
            }
        }
    }

    fn literal_tag(&mut self, body: &str) {
        self.literal_char('<');
        self.literal_str(body);
    }

    fn literal_str(&mut self, s: &str) {
        if self.section.is_some() {
            self.text.push_str(s);
        }
    }

    fn literal_char(&mut self, c: char) {
        if self.section.is_some() {
            self.text.push(c);
        }
    }

    fn flush_text(&mut self, events: &mut Vec<SectionEvent>) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        if let Some(kind) = self.section {
            events.push(SectionEvent::Text(kind, text));
        }
    }
}

/// Per-section text accumulated over one turn.
#[derive(Debug, Default, Clone)]
pub struct SectionBuffers {
    pub thinking: String,
    pub action: String,
    pub communication: String,
    pub final_answer: String,
    opened: Vec<SectionKind>,
    closed: Vec<SectionKind>,
}

impl SectionBuffers {
    pub fn apply(&mut self, event: &SectionEvent) {
        match event {
            SectionEvent::Start(kind) => {
                if !self.opened.contains(kind) {
                    self.opened.push(*kind);
                }
            }
            SectionEvent::Text(kind, text) => self.buffer_mut(*kind).push_str(text),
            SectionEvent::End(kind) => {
                if !self.closed.contains(kind) {
                    self.closed.push(*kind);
                }
            }
        }
    }

    pub fn get(&self, kind: SectionKind) -> &str {
        match kind {
            SectionKind::Thinking => &self.thinking,
            SectionKind::Action => &self.action,
            SectionKind::Communication => &self.communication,
            SectionKind::FinalAnswer => &self.final_answer,
        }
    }

    fn buffer_mut(&mut self, kind: SectionKind) -> &mut String {
        match kind {
            SectionKind::Thinking => &mut self.thinking,
            SectionKind::Action => &mut self.action,
            SectionKind::Communication => &mut self.communication,
            SectionKind::FinalAnswer => &mut self.final_answer,
        }
    }

    pub fn opened(&self, kind: SectionKind) -> bool {
        self.opened.contains(&kind)
    }

    pub fn closed(&self, kind: SectionKind) -> bool {
        self.closed.contains(&kind)
    }

    /// Trimmed text of `kind` if the section was opened and is non-empty.
    pub fn present(&self, kind: SectionKind) -> Option<&str> {
        let text = self.get(kind).trim();
        (self.opened(kind) && !text.is_empty()).then_some(text)
    }
}

/// Split the text between `<` and `>` into a closing flag and a lowercase
/// tag name. Attributes after the name are ignored.
pub(crate) fn tag_name(body: &str) -> (bool, String) {
    let trimmed = body.trim();
    let (closing, rest) = match trimmed.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let name = rest
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    (closing, name)
}
