//! Shared test helpers for agent tests.

use async_trait::async_trait;
use parley_core::error::{ProviderError, ToolError};
use parley_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, Usage};
use parley_core::tool::{ToolDescriptor, ToolProvider};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// A mock provider that streams a sequence of scripted replies.
///
/// Each call to `stream` sends the next reply in chunks of `chunk_size`
/// characters, followed by a done chunk carrying usage.
/// Panics if more calls are made than replies provided, unless built with
/// [`SequentialMockProvider::repeating`].
pub struct SequentialMockProvider {
    replies: Mutex<Vec<String>>,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<ProviderRequest>>,
    repeat_last: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    slow_calls: Option<usize>,
    failures: Mutex<VecDeque<ProviderError>>,
    failed_calls: AtomicUsize,
}

impl SequentialMockProvider {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
            repeat_last: false,
            chunk_size: 7,
            chunk_delay: None,
            slow_calls: None,
            failures: Mutex::new(VecDeque::new()),
            failed_calls: AtomicUsize::new(0),
        }
    }

    /// A provider that gives the same reply on every call.
    pub fn repeating(reply: &str) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![reply])
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sleep before every chunk, to exercise time budgets.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Sleep before every chunk of the first `calls` calls only.
    pub fn with_slow_calls(mut self, delay: Duration, calls: usize) -> Self {
        self.chunk_delay = Some(delay);
        self.slow_calls = Some(calls);
        self
    }

    /// Fail the first calls with `errors`, in order, before replying.
    pub fn with_failures(self, errors: Vec<ProviderError>) -> Self {
        *self.failures.lock().unwrap() = errors.into();
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap() + self.failed_calls.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn mock_usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            return Err(error);
        }
        let mut count = self.call_count.lock().unwrap();
        let replies = self.replies.lock().unwrap();
        let delay = self
            .chunk_delay
            .filter(|_| self.slow_calls.map_or(true, |calls| *count < calls));

        let reply = match replies.get(*count) {
            Some(reply) => reply.clone(),
            None if self.repeat_last && !replies.is_empty() => replies[replies.len() - 1].clone(),
            None => panic!(
                "SequentialMockProvider: no more replies (call #{}, have {})",
                *count,
                replies.len()
            ),
        };
        *count += 1;
        self.requests.lock().unwrap().push(request);

        let chars: Vec<char> = reply.chars().collect();
        let chunks: Vec<String> = chars
            .chunks(self.chunk_size)
            .map(|c| c.iter().collect())
            .collect();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(StreamChunk::text(chunk))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::done(Some(mock_usage())))).await;
        });
        Ok(rx)
    }
}

/// A provider whose stream fails straight away.
pub struct FailingProvider;

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing_mock"
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        Err(ProviderError::ApiError {
            status_code: 500,
            message: "upstream exploded".into(),
        })
    }
}

/// A tool provider with `echo`, `clock` and an always-failing `broken` tool.
pub struct MockToolProvider {
    list_calls: AtomicUsize,
    call_calls: AtomicUsize,
}

impl MockToolProvider {
    pub fn new() -> Self {
        Self {
            list_calls: AtomicUsize::new(0),
            call_calls: AtomicUsize::new(0),
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn call_calls(&self) -> usize {
        self.call_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for MockToolProvider {
    fn name(&self) -> &str {
        "mock_tools"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ToolDescriptor {
                name: "echo".into(),
                description: "Echo the given text".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string", "description": "Text to echo"}},
                    "required": ["text"]
                }),
            },
            ToolDescriptor {
                name: "clock".into(),
                description: "Current time".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "broken".into(),
                description: "Always fails".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        self.call_calls.fetch_add(1, Ordering::SeqCst);
        match name {
            "echo" => Ok(arguments.get("text").cloned().unwrap_or(Value::Null)),
            "clock" => Ok(json!("2024-03-09T14:05:00Z")),
            _ => Err(ToolError::ExecutionFailed {
                tool_name: name.into(),
                reason: "tool is broken".into(),
            }),
        }
    }
}
