//! Wiring shared by the commands: provider, tool gateway, bus and sessions.

use std::sync::Arc;
use std::time::Duration;

use parley_agent::{AgentEvent, AgentLoop, LoopConfig, SessionLocks};
use parley_bus::MessageBus;
use parley_config::AppConfig;
use parley_core::provider::Provider;
use parley_core::task::Task;
use parley_session::{SessionStore, SharedSession};
use parley_tools::{GatewayPolicy, ToolGateway};
use tokio::sync::mpsc;

/// Providers that run locally and accept requests without a key.
const KEYLESS_PROVIDERS: &[&str] = &["ollama", "vllm", "llamacpp", "llama.cpp"];

pub struct Runtime {
    pub config: AppConfig,
    pub gateway: Arc<ToolGateway>,
    pub bus: Arc<MessageBus>,
    pub store: SessionStore,
    provider: Arc<dyn Provider>,
    locks: SessionLocks,
}

impl Runtime {
    pub async fn start(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        require_api_key(&config)?;

        let provider = parley_providers::build_from_config(&config.llm);
        let gateway = start_gateway(&config).await?;
        let bus = Arc::new(
            MessageBus::local(config.bus.prefix.clone())
                .with_resubscribe_delay(Duration::from_millis(config.bus.resubscribe_delay_ms)),
        );
        let store = SessionStore::new(&config.session.dir)
            .with_system_prompt(config.session.system_prompt.clone());

        Ok(Self {
            config,
            gateway,
            bus,
            store,
            provider,
            locks: SessionLocks::new(),
        })
    }

    /// An agent loop on this runtime. All agents built here share one set
    /// of session locks, so a session never runs twice at once.
    pub fn agent(&self, events: Option<mpsc::Sender<AgentEvent>>) -> Arc<AgentLoop> {
        let mut agent = AgentLoop::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.gateway),
            LoopConfig::from_config(&self.config.llm, &self.config.agent),
        )
        .with_bus(Arc::clone(&self.bus))
        .with_locks(self.locks.clone());
        if let Some(tx) = events {
            agent = agent.with_events(tx);
        }
        Arc::new(agent)
    }

    pub fn open(&self, session_id: &str) -> SharedSession {
        self.store.open(session_id).into_shared()
    }

    pub fn task(&self, description: impl Into<String>) -> Task {
        Task::new(description)
            .with_max_iterations(self.config.agent.max_iterations)
            .with_timeout(self.config.agent.timeout())
    }

    /// Stop the tool providers and close the bus.
    pub async fn close(&self) {
        self.gateway.shutdown().await;
        self.bus.close().await;
    }
}

pub async fn start_gateway(config: &AppConfig) -> Result<Arc<ToolGateway>, Box<dyn std::error::Error>> {
    let gateway = ToolGateway::start(&config.tools.providers, GatewayPolicy::from_config(&config.tools))
        .await
        .map_err(|e| format!("Failed to start tool providers: {e}"))?;
    Ok(Arc::new(gateway))
}

fn require_api_key(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.has_api_key() || KEYLESS_PROVIDERS.contains(&config.llm.provider.as_str()) {
        return Ok(());
    }

    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    PARLEY_API_KEY=sk-...     (preferred)");
    eprintln!("    OPENAI_API_KEY=sk-...");
    eprintln!();
    eprintln!("  Or add `api_key` under [llm] in:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
    Err("No API key found. See above for setup instructions.".into())
}
