//! Terminal rendering of agent events.

use std::io::Write;

use parley_agent::{AgentEvent, SectionKind};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const PREVIEW_CHARS: usize = 200;

/// Prints the events of the foreground run as they stream in.
///
/// Thinking is dimmed, the final answer is printed plain, and tool calls,
/// observations and messages get a one-line summary each.
#[derive(Debug, Default)]
pub struct EventPrinter {
    dimmed: bool,
    answered: bool,
}

impl EventPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous run.
    pub fn reset(&mut self) {
        self.undim();
        self.answered = false;
    }

    /// Whether any final-answer text has been printed since the last reset.
    pub fn answered(&self) -> bool {
        self.answered
    }

    pub fn print(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::SectionStart { section } => {
                self.undim();
                match section {
                    SectionKind::Thinking => {
                        print!("  {DIM}");
                        self.dimmed = true;
                    }
                    SectionKind::FinalAnswer => print!("\n  Assistant > "),
                    SectionKind::Action | SectionKind::Communication => {}
                }
            }
            AgentEvent::SectionText { section, text } => match section {
                SectionKind::Thinking => print!("{text}"),
                SectionKind::FinalAnswer => {
                    if !text.trim().is_empty() {
                        self.answered = true;
                    }
                    print!("{text}");
                }
                SectionKind::Action | SectionKind::Communication => {}
            },
            AgentEvent::SectionEnd { section } => match section {
                SectionKind::Thinking => self.undim(),
                SectionKind::FinalAnswer => println!(),
                SectionKind::Action | SectionKind::Communication => {}
            },
            AgentEvent::ToolCall { tool, arguments } => {
                self.undim();
                println!("  {DIM}→ {tool} {arguments}{RESET}");
            }
            AgentEvent::Observation { content, success } => {
                let mark = if *success { "←" } else { "✗" };
                println!("  {DIM}{mark} {}{RESET}", preview(content));
            }
            AgentEvent::MessageSent { target, subscribers } => {
                println!("  {DIM}✉ sent to {target} ({subscribers} subscriber(s)){RESET}");
            }
            AgentEvent::Corrective { iteration } => {
                self.undim();
                println!("  {DIM}(turn {iteration} did not follow the protocol, retrying){RESET}");
            }
            AgentEvent::Done { iterations, usage, .. } => {
                self.undim();
                println!(
                    "  {DIM}({iterations} step(s), {} tokens){RESET}",
                    usage.total_tokens
                );
            }
            AgentEvent::IterationStart { .. } | AgentEvent::FinalAnswer { .. } | AgentEvent::Error { .. } => {}
        }
        let _ = std::io::stdout().flush();
    }

    fn undim(&mut self) {
        if self.dimmed {
            println!("{RESET}");
            self.dimmed = false;
        }
    }
}

/// Prints what background runs (inbox deliveries) did, one line each.
///
/// Runs of different sessions can overlap, so every line is tagged with the
/// session that most recently started an iteration.
#[derive(Debug, Default)]
pub struct BackgroundPrinter {
    session: String,
}

impl BackgroundPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&mut self, event: &AgentEvent) {
        let line = match event {
            AgentEvent::IterationStart { session_id, .. } => {
                self.session = session_id.clone();
                return;
            }
            AgentEvent::ToolCall { tool, .. } => format!("{DIM}→ {tool}{RESET}"),
            AgentEvent::MessageSent { target, subscribers } => {
                format!("{DIM}✉ sent to {target} ({subscribers} subscriber(s)){RESET}")
            }
            AgentEvent::FinalAnswer { content } => format!("> {content}"),
            AgentEvent::Error { message } => format!("[Error] {message}"),
            _ => return,
        };
        println!("\n  [{}] {line}", self.session);
        let _ = std::io::stdout().flush();
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_flattens_and_cuts() {
        assert_eq!(preview("a\nb"), "a b");
        let long = "x".repeat(PREVIEW_CHARS + 10);
        let out = preview(&long);
        assert_eq!(out.chars().count(), PREVIEW_CHARS + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn answered_only_after_final_answer_text() {
        let mut printer = EventPrinter::new();
        printer.print(&AgentEvent::SectionText {
            section: SectionKind::Thinking,
            text: "hmm".into(),
        });
        assert!(!printer.answered());

        printer.print(&AgentEvent::SectionText {
            section: SectionKind::FinalAnswer,
            text: "  ".into(),
        });
        assert!(!printer.answered());

        printer.print(&AgentEvent::SectionText {
            section: SectionKind::FinalAnswer,
            text: "42".into(),
        });
        assert!(printer.answered());

        printer.reset();
        assert!(!printer.answered());
    }

    #[test]
    fn background_printer_tracks_session() {
        let mut printer = BackgroundPrinter::new();
        printer.print(&AgentEvent::IterationStart {
            session_id: "B".into(),
            iteration: 1,
        });
        assert_eq!(printer.session, "B");
    }
}
