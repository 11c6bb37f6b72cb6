//! ToolGateway: a cached, retrying front for every tool provider.
//!
//! The gateway keeps a name → tool map with a single timestamp and TTL.
//! Refreshes are single-flight: concurrent callers that find the cache stale
//! queue on one mutex and re-check freshness once they hold it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use parley_config::{ToolProviderConfig, ToolsConfig};
use parley_core::error::ToolError;
use parley_core::tool::{CachedTool, ToolProvider};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::stdio::StdioToolProvider;

/// Cache and retry knobs for a [`ToolGateway`].
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub cache_ttl: Duration,
    /// Extra attempts after the first failed call
    pub retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

impl GatewayPolicy {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[derive(Default)]
struct ToolCache {
    tools: HashMap<String, CachedTool>,
    refreshed_at: Option<Instant>,
}

pub struct ToolGateway {
    providers: Vec<Arc<dyn ToolProvider>>,
    policy: GatewayPolicy,
    cache: RwLock<ToolCache>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl ToolGateway {
    /// Spawn every configured provider concurrently.
    ///
    /// Providers that fail to start are logged and left out. It is an error
    /// only when providers were configured and none of them came up.
    pub async fn start(configs: &[ToolProviderConfig], policy: GatewayPolicy) -> Result<Self, ToolError> {
        let timeout = policy.request_timeout;
        let results = join_all(
            configs
                .iter()
                .map(|config| StdioToolProvider::spawn(config, timeout)),
        )
        .await;

        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
        for (config, result) in configs.iter().zip(results) {
            match result {
                Ok(provider) => providers.push(Arc::new(provider)),
                Err(e) => warn!(provider = %config.name, error = %e, "Tool provider failed to start"),
            }
        }

        info!("Tool gateway initialized {}/{} providers", providers.len(), configs.len());

        if !configs.is_empty() && providers.is_empty() {
            return Err(ToolError::ProviderUnavailable(
                "no tool provider could be started".into(),
            ));
        }
        Ok(Self::from_providers(providers, policy))
    }

    /// Build a gateway over providers that are already connected.
    pub fn from_providers(providers: Vec<Arc<dyn ToolProvider>>, policy: GatewayPolicy) -> Self {
        Self {
            providers,
            policy,
            cache: RwLock::new(ToolCache::default()),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// How many times the cache has been rebuilt.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Every known tool, sorted by name.
    pub async fn list_tools(&self) -> Result<Vec<CachedTool>, ToolError> {
        self.ensure_fresh().await;
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut tools: Vec<CachedTool> = cache.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    /// Call `name` on whichever provider owns it.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        self.ensure_fresh().await;

        let owner = {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            cache
                .tools
                .get(name)
                .map(|tool| tool.provider.clone())
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?
        };

        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == owner)
            .filter(|p| p.is_connected())
            .ok_or_else(|| ToolError::ProviderUnavailable(owner.clone()))?;

        let attempts = self.policy.retries + 1;
        let mut attempt = 1;
        loop {
            debug!(tool = name, provider = %owner, attempt, "Calling tool");
            match provider.call_tool(name, arguments.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts || !is_retryable(&e) => {
                    warn!(tool = name, provider = %owner, attempt, error = %e, "Tool call failed");
                    return Err(e);
                }
                Err(e) => {
                    debug!(tool = name, attempt, error = %e, "Tool call failed, retrying");
                    tokio::time::sleep(self.policy.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Mark the cache stale so the next lookup refreshes it.
    pub fn invalidate(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).refreshed_at = None;
    }

    /// Shut down every provider.
    pub async fn shutdown(&self) {
        join_all(self.providers.iter().map(|p| p.shutdown())).await;
        self.invalidate();
        info!("Tool gateway shut down");
    }

    fn is_fresh(&self) -> bool {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.policy.cache_ttl)
    }

    async fn ensure_fresh(&self) {
        if self.is_fresh() {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if self.is_fresh() {
            return;
        }
        self.refresh().await;
    }

    async fn refresh(&self) {
        let mut tools = HashMap::new();
        for provider in &self.providers {
            if !provider.is_connected() {
                warn!(provider = %provider.name(), "Skipping disconnected tool provider");
                continue;
            }
            match provider.list_tools().await {
                Ok(descriptors) => {
                    debug!(provider = %provider.name(), count = descriptors.len(), "Listed tools");
                    for descriptor in descriptors {
                        let tool = CachedTool::from_descriptor(descriptor, provider.name());
                        tools.insert(tool.name.clone(), tool);
                    }
                }
                Err(e) => warn!(provider = %provider.name(), error = %e, "Listing tools failed"),
            }
        }

        let count = tools.len();
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.tools = tools;
            cache.refreshed_at = Some(Instant::now());
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        info!(tools = count, "Tool cache refreshed");
    }
}

/// `ExecutionFailed` means the tool ran and said no; trying again won't help.
fn is_retryable(error: &ToolError) -> bool {
    !matches!(error, ToolError::ExecutionFailed { .. } | ToolError::NotFound(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::tool::ToolDescriptor;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicU32;

    struct FakeProvider {
        name: String,
        tools: Vec<&'static str>,
        list_calls: AtomicU32,
        call_calls: AtomicU32,
        /// Calls that fail with a transport error before one succeeds
        failures: AtomicU32,
        connected: AtomicBool,
    }

    impl FakeProvider {
        fn new(name: &str, tools: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                tools,
                list_calls: AtomicU32::new(0),
                call_calls: AtomicU32::new(0),
                failures: AtomicU32::new(0),
                connected: AtomicBool::new(true),
            })
        }

        fn failing(self: Arc<Self>, n: u32) -> Arc<Self> {
            self.failures.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl ToolProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self
                .tools
                .iter()
                .map(|t| ToolDescriptor {
                    name: t.to_string(),
                    description: format!("{t} from {}", self.name),
                    input_schema: json!({"type": "object"}),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            self.call_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ToolError::Rpc {
                    provider: self.name.clone(),
                    message: "broken pipe".into(),
                });
            }
            if name == "refuse" {
                return Err(ToolError::ExecutionFailed {
                    tool_name: name.into(),
                    reason: "no".into(),
                });
            }
            Ok(json!({ "tool": name, "args": arguments, "by": self.name }))
        }
    }

    fn policy() -> GatewayPolicy {
        GatewayPolicy {
            cache_ttl: Duration::from_secs(300),
            retries: 2,
            retry_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn lists_sorted_with_last_write_wins() {
        let a = FakeProvider::new("a", vec!["zeta", "shared"]);
        let b = FakeProvider::new("b", vec!["alpha", "shared"]);
        let gateway = ToolGateway::from_providers(vec![a, b], policy());

        let tools = gateway.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "shared", "zeta"]);
        assert_eq!(tools[1].provider, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn cache_respects_ttl() {
        let p = FakeProvider::new("p", vec!["echo"]);
        let gateway = ToolGateway::from_providers(vec![p.clone()], policy());

        gateway.list_tools().await.unwrap();
        gateway.list_tools().await.unwrap();
        assert_eq!(p.list_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        gateway.list_tools().await.unwrap();
        assert_eq!(p.list_calls.load(Ordering::SeqCst), 2);

        gateway.invalidate();
        gateway.list_tools().await.unwrap();
        assert_eq!(gateway.refresh_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_refresh_once() {
        let p = FakeProvider::new("p", vec!["echo"]);
        let gateway = Arc::new(ToolGateway::from_providers(vec![p.clone()], policy()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gw = Arc::clone(&gateway);
                tokio::spawn(async move { gw.list_tools().await.unwrap().len() })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(gateway.refresh_count(), 1);
        assert_eq!(p.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_retries_transport_errors() {
        let p = FakeProvider::new("p", vec!["echo"]).failing(2);
        let gateway = ToolGateway::from_providers(vec![p.clone()], policy());

        let started = Instant::now();
        let out = gateway.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out["args"]["text"], "hi");
        assert_eq!(p.call_calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn call_surfaces_last_error_after_budget() {
        let p = FakeProvider::new("p", vec!["echo"]).failing(5);
        let gateway = ToolGateway::from_providers(vec![p.clone()], policy());

        let err = gateway.call_tool("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Rpc { .. }));
        assert_eq!(p.call_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execution_failure_is_not_retried() {
        let p = FakeProvider::new("p", vec!["refuse"]);
        let gateway = ToolGateway::from_providers(vec![p.clone()], policy());

        let err = gateway.call_tool("refuse", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        assert_eq!(p.call_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tool_and_disconnected_provider() {
        let p = FakeProvider::new("p", vec!["echo"]);
        let gateway = ToolGateway::from_providers(vec![p.clone()], policy());

        assert!(matches!(
            gateway.call_tool("missing", json!({})).await,
            Err(ToolError::NotFound(_))
        ));

        gateway.list_tools().await.unwrap();
        p.connected.store(false, Ordering::SeqCst);
        assert!(matches!(
            gateway.call_tool("echo", json!({})).await,
            Err(ToolError::ProviderUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn start_with_nothing_configured_is_empty() {
        let gateway = ToolGateway::start(&[], policy()).await.unwrap();
        assert!(gateway.list_tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_fails_when_no_provider_comes_up() {
        let configs = vec![ToolProviderConfig {
            name: "ghost".into(),
            command: "/nonexistent/parley-tool-server".into(),
            args: vec![],
            env: HashMap::new(),
        }];
        let err = ToolGateway::start(&configs, policy()).await.err().unwrap();
        assert!(matches!(err, ToolError::ProviderUnavailable(_)));
    }
}
