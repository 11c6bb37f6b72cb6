//! Tool provider subprocess speaking JSON-RPC over stdio.
//!
//! The child is spawned with piped stdin/stdout and `kill_on_drop`, so it
//! never outlives the provider. A reader task routes each response line to
//! the request waiting on its id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_config::ToolProviderConfig;
use parley_core::error::ToolError;
use parley_core::tool::{ToolDescriptor, ToolProvider};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::rpc::{CallResult, Incoming, Notification, PROTOCOL_VERSION, Request, RpcError, ToolsPage};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_PAGES: usize = 100;

pub struct StdioToolProvider {
    name: String,
    writer: tokio::sync::Mutex<Writer>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl StdioToolProvider {
    /// Spawn the configured command and complete the initialize handshake.
    pub async fn spawn(config: &ToolProviderConfig, request_timeout: Duration) -> Result<Self, ToolError> {
        info!(provider = %config.name, command = %config.command, "Spawning tool provider");

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolError::ProviderUnavailable(format!(
                    "{}: failed to spawn '{}': {e}",
                    config.name, config.command
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(ToolError::ProviderUnavailable(format!(
                "{}: stdio was not piped",
                config.name
            )));
        };

        let provider = Self::start(config.name.clone(), Box::new(stdin), stdout, request_timeout);
        *provider.child.lock().await = Some(child);

        if let Err(e) = provider.initialize().await {
            provider.shutdown().await;
            return Err(e);
        }
        Ok(provider)
    }

    /// Connect over an arbitrary byte transport and run the handshake.
    pub async fn connect<R>(
        name: impl Into<String>,
        writer: Writer,
        reader: R,
        request_timeout: Duration,
    ) -> Result<Self, ToolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let provider = Self::start(name.into(), writer, reader, request_timeout);
        provider.initialize().await?;
        Ok(provider)
    }

    fn start<R>(name: String, writer: Writer, reader: R, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(read_loop(
            name.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        Self {
            name,
            writer: tokio::sync::Mutex::new(writer),
            child: tokio::sync::Mutex::new(None),
            pending,
            next_id: AtomicU64::new(1),
            connected,
            reader: Mutex::new(Some(handle)),
            request_timeout,
        }
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "parley", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await?;
        let server = result["serverInfo"]["name"].as_str().unwrap_or("unknown");
        debug!(provider = %self.name, server, "Tool provider initialized");
        self.notify("notifications/initialized").await
    }

    async fn write_line(&self, line: String) -> Result<(), ToolError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ToolError::ProviderUnavailable(format!("{}: write failed: {e}", self.name))
        })
    }

    async fn notify(&self, method: &str) -> Result<(), ToolError> {
        let frame = Notification {
            jsonrpc: "2.0",
            method,
            params: None,
        };
        let line = serde_json::to_string(&frame).map_err(|e| self.rpc_error(e.to_string()))?;
        self.write_line(line).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        if !self.is_connected() {
            return Err(ToolError::ProviderUnavailable(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);

        let frame = Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&frame).map_err(|e| self.rpc_error(e.to_string()))?;
        trace!(provider = %self.name, id, method, "RPC request");

        if let Err(e) = self.write_line(line).await {
            self.pending_map().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(self.rpc_error(format!("{} (code {})", err.message, err.code))),
            Ok(Err(_)) => Err(ToolError::ProviderUnavailable(format!(
                "{}: connection closed",
                self.name
            ))),
            Err(_) => {
                self.pending_map().remove(&id);
                Err(ToolError::Timeout {
                    provider: self.name.clone(),
                    timeout_secs: self.request_timeout.as_secs(),
                })
            }
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rpc_error(&self, message: String) -> ToolError {
        ToolError::Rpc {
            provider: self.name.clone(),
            message,
        }
    }
}

async fn read_loop<R>(name: String, reader: R, pending: Pending, connected: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match serde_json::from_str::<Incoming>(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(provider = %name, error = %e, "Ignoring malformed RPC line");
                        continue;
                    }
                };
                let Some(id) = frame.response_id() else {
                    debug!(provider = %name, method = ?frame.method, "Ignoring provider-initiated message");
                    continue;
                };
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = match frame.error {
                            Some(err) => Err(err),
                            None => Ok(frame.result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!(provider = %name, id, "Response for unknown or expired request"),
                }
            }
            Ok(None) => {
                debug!(provider = %name, "Tool provider stdout closed");
                break;
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "Error reading tool provider stdout");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-connection error
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

#[async_trait]
impl ToolProvider for StdioToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            let page: ToolsPage =
                serde_json::from_value(result).map_err(|e| self.rpc_error(format!("bad tools/list result: {e}")))?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(provider = %self.name, "tools/list pagination did not terminate, truncating");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let call: CallResult = serde_json::from_value(result.clone()).unwrap_or_default();

        if call.is_error {
            return Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: call.text().unwrap_or_else(|| result.to_string()),
            });
        }

        Ok(match call.text() {
            Some(text) if !call.content.is_empty() => Value::String(text),
            _ => result,
        })
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.pending_map().clear();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(provider = %self.name, error = %e, "Tool provider already exited");
            }
        }
        info!(provider = %self.name, "Tool provider shut down");
    }
}

impl Drop for StdioToolProvider {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
