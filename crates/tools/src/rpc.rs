//! JSON-RPC 2.0 frames for the tool provider protocol.
//!
//! One JSON object per line in each direction. Requests carry a numeric id;
//! responses echo it with either `result` or `error`.

use parley_core::tool::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Anything the provider may write: a response, a notification, or a
/// request of its own.
#[derive(Debug, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Incoming {
    /// The request id this frame answers, if it is a response.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() || (self.result.is_none() && self.error.is_none()) {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallResult {
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl CallResult {
    /// Joined text when every part is text; `None` if any part is not.
    pub fn text(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(self.content.len());
        for part in &self.content {
            if part.kind != "text" {
                return None;
            }
            parts.push(part.text.as_deref().unwrap_or(""));
        }
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_detection() {
        let resp: Incoming = serde_json::from_value(json!({"jsonrpc":"2.0","id":7,"result":{}})).unwrap();
        assert_eq!(resp.response_id(), Some(7));

        let err: Incoming =
            serde_json::from_value(json!({"id":8,"error":{"code":-32601,"message":"nope"}})).unwrap();
        assert_eq!(err.response_id(), Some(8));

        let note: Incoming =
            serde_json::from_value(json!({"method":"notifications/progress","params":{}})).unwrap();
        assert_eq!(note.response_id(), None);

        let server_req: Incoming = serde_json::from_value(json!({"id":1,"method":"ping"})).unwrap();
        assert_eq!(server_req.response_id(), None);
    }

    #[test]
    fn call_result_text_join() {
        let r: CallResult = serde_json::from_value(json!({
            "content": [{"type":"text","text":"a"},{"type":"text","text":"b"}]
        }))
        .unwrap();
        assert_eq!(r.text().as_deref(), Some("a\nb"));
        assert!(!r.is_error);

        let mixed: CallResult = serde_json::from_value(json!({
            "content": [{"type":"text","text":"a"},{"type":"image","data":"..."}],
            "isError": true
        }))
        .unwrap();
        assert!(mixed.text().is_none());
        assert!(mixed.is_error);
    }

    #[test]
    fn request_serializes_as_jsonrpc() {
        let req = Request {
            jsonrpc: "2.0",
            id: 3,
            method: "tools/list",
            params: json!({}),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"jsonrpc":"2.0","id":3,"method":"tools/list","params":{}}));
    }
}
