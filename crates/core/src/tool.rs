//! ToolProvider trait: the abstraction over external tool servers.
//!
//! A tool provider is an external process (or anything else) that exposes
//! named tools taking JSON arguments. The gateway discovers tools through
//! `list_tools()` and routes calls to whichever provider owns a name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// A tool as advertised by its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The unique name of this tool (e.g., "echo", "quote_lookup")
    pub name: String,

    /// A description of what this tool does (sent to the LLM)
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's arguments
    #[serde(default = "empty_schema", rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A discovered tool together with the provider that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Name of the owning provider
    pub provider: String,
}

impl CachedTool {
    pub fn from_descriptor(descriptor: ToolDescriptor, provider: impl Into<String>) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            provider: provider.into(),
        }
    }

    /// Render this tool as the plain-text block shown to the model.
    pub fn format_for_llm(&self) -> String {
        let mut out = format!("Tool: {}\nDescription: {}\nArguments:", self.name, self.description);

        let required: Vec<&str> = self.input_schema["required"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        match self.input_schema["properties"].as_object() {
            Some(props) if !props.is_empty() => {
                for (param, info) in props {
                    let desc = info["description"].as_str().unwrap_or("No description");
                    out.push_str(&format!("\n- {param}: {desc}"));
                    if required.contains(&param.as_str()) {
                        out.push_str(" (required)");
                    }
                }
            }
            _ => out.push_str("\n- (none)"),
        }
        out
    }
}

/// The core ToolProvider trait.
///
/// Implementations must be safe for concurrent use: several sessions may
/// call tools on the same provider at once.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The configured name of this provider.
    fn name(&self) -> &str;

    /// Whether the underlying session is still usable.
    fn is_connected(&self) -> bool;

    /// Ask the provider which tools it exposes.
    async fn list_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, ToolError>;

    /// Invoke a tool by name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Release every resource held by the provider.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_tool() -> CachedTool {
        CachedTool {
            name: "quote".into(),
            description: "Look up a quote".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol" },
                    "days": { "type": "integer" }
                },
                "required": ["symbol"]
            }),
            provider: "market".into(),
        }
    }

    #[test]
    fn format_for_llm_marks_required_arguments() {
        let text = quote_tool().format_for_llm();
        assert!(text.starts_with("Tool: quote\nDescription: Look up a quote\nArguments:"));
        assert!(text.contains("- symbol: Ticker symbol (required)"));
        assert!(text.contains("- days: No description"));
        assert!(!text.contains("days: No description (required)"));
    }

    #[test]
    fn format_for_llm_without_arguments() {
        let mut tool = quote_tool();
        tool.input_schema = serde_json::json!({});
        assert!(tool.format_for_llm().ends_with("- (none)"));
    }

    #[test]
    fn descriptor_accepts_mcp_field_names() {
        let d: ToolDescriptor = serde_json::from_str(
            r#"{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}"#,
        )
        .unwrap();
        assert_eq!(d.input_schema["type"], "object");

        let d: ToolDescriptor = serde_json::from_str(r#"{"name":"bare"}"#).unwrap();
        assert_eq!(d.description, "");
        assert_eq!(d.input_schema["type"], "object");
    }
}
