use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amcp_agent::{AgentRuntime, AgentServices};
use amcp_config::{Config, ServerConfig};
use amcp_context::{CompactionConfig, CompactionStrategy};
use amcp_core::EventBus;
use amcp_permission::{ApprovalRequest, PermissionEngine, PermissionRuleset};
use amcp_provider::{OpenAiCompatProvider, Provider, RetryConfig};
use amcp_session::SessionManager;
use amcp_tool::ToolRegistry;
use amcp_types::{default_agent_spec, AgentMode, AgentSpec, Event, EventKind};

pub const PROTOCOL_VERSION: &str = "1.0";
pub const SERVER_NAME: &str = "amcp-server";
pub const CAPABILITIES: &[&str] = &["sessions", "streaming", "websocket", "sse", "tools", "agents"];

const DEFAULT_BASE_URL: &str = "https://inference.baseten.co/v1";
const DEFAULT_MODEL: &str = "zai-org/GLM-4.6";

pub struct ServerState {
    pub runtime: Arc<AgentRuntime>,
    pub config: ServerConfig,
    pub agents: HashMap<String, AgentSpec>,
    pub started_at: Instant,
}

impl ServerState {
    /// Assemble every service from config, wire the bus forwarders, and
    /// return the shared state. This is the composition root: each service
    /// exists exactly once per process and everything downstream receives
    /// Arcs, not globals.
    pub async fn build(server_config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let cwd = server_config
            .work_dir
            .clone()
            .unwrap_or(std::env::current_dir()?);
        let (config, user_rules, project_rules) = amcp_config::load_config(&cwd);

        let api_key = config
            .chat
            .api_key
            .clone()
            .or_else(|| std::env::var("AMCP_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        let base_url = config
            .chat
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = config
            .chat
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let provider: Arc<dyn Provider> =
            Arc::new(OpenAiCompatProvider::new("openai-compat", base_url, api_key));

        Self::assemble(server_config, config, user_rules, project_rules, provider, model).await
    }

    /// Wire the state around an explicit provider; used by tests and
    /// embedders.
    pub async fn assemble(
        server_config: ServerConfig,
        config: Config,
        user_rules: PermissionRuleset,
        project_rules: PermissionRuleset,
        provider: Arc<dyn Provider>,
        default_model: String,
    ) -> anyhow::Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let tools = Arc::new(amcp_tool::create_default_registry().await);
        let permissions = Arc::new(PermissionEngine::new(user_rules, project_rules));

        // Approval requests surface on the bus; the engine stays a leaf.
        {
            let bus = Arc::clone(&bus);
            permissions
                .set_notifier(Arc::new(move |request: ApprovalRequest| {
                    let bus = Arc::clone(&bus);
                    bus.emit_sync(Event::for_session(
                        EventKind::ApprovalRequired,
                        request.session_id.clone(),
                        serde_json::json!({
                            "request_id": request.id,
                            "tool_name": request.tool_name,
                            "match_value": request.match_value,
                            "tool_call_id": request.tool_call_id,
                            "always_patterns": request.always_patterns,
                        }),
                    ));
                }))
                .await;
        }

        let catalog = amcp_context::models::ModelCatalog::load(&amcp_config::models_cache_path());
        let context_window = amcp_context::context_window(&default_model, &catalog);

        let compaction = compaction_config(&config);

        let services = Arc::new(AgentServices {
            bus: Arc::clone(&bus),
            tools,
            permissions,
            provider,
            compaction,
            retry: RetryConfig::default(),
            default_model,
            context_window,
            tool_timeout: Duration::from_secs(120),
        });

        let sessions = Arc::new(
            SessionManager::new(Arc::clone(&bus), server_config.max_sessions)
                .with_history_dir(amcp_config::sessions_dir()),
        );

        let runtime = Arc::new(AgentRuntime::new(services, sessions));

        Ok(Arc::new(Self {
            runtime,
            config: server_config,
            agents: builtin_agents(),
            started_at: Instant::now(),
        }))
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.runtime.sessions().bus()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.runtime.sessions()
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.runtime.services().tools)
    }

    pub fn permissions(&self) -> Arc<PermissionEngine> {
        Arc::clone(&self.runtime.services().permissions)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn resolve_agent(&self, name: Option<&str>) -> Option<AgentSpec> {
        match name {
            Some(name) => self.agents.get(name).cloned(),
            None => self.agents.get(&self.config.default_agent).cloned(),
        }
    }
}

fn compaction_config(config: &Config) -> CompactionConfig {
    let mut compaction = CompactionConfig::default();
    if let Some(strategy) = config
        .compaction
        .strategy
        .as_deref()
        .and_then(CompactionStrategy::parse)
    {
        compaction.strategy = strategy;
    }
    if let Some(ratio) = config.compaction.threshold_ratio {
        compaction.threshold_ratio = ratio;
    }
    if let Some(ratio) = config.compaction.target_ratio {
        compaction.target_ratio = ratio;
    }
    if let Some(preserve) = config.compaction.preserve_last {
        compaction.preserve_last = preserve;
    }
    if let Some(max_results) = config.compaction.max_tool_results {
        compaction.max_tool_results = max_results;
    }
    compaction
}

fn builtin_agents() -> HashMap<String, AgentSpec> {
    let mut agents = HashMap::new();

    let coder = default_agent_spec();
    agents.insert(coder.name.clone(), coder);

    agents.insert(
        "explorer".to_string(),
        AgentSpec {
            name: "explorer".to_string(),
            mode: AgentMode::Subagent,
            description: "Read-only codebase exploration".to_string(),
            system_prompt: "You explore the project in {work_dir} and report findings. \
                            Never modify files."
                .to_string(),
            tools: vec![
                "read_file".to_string(),
                "grep".to_string(),
                "think".to_string(),
                "todo".to_string(),
            ],
            exclude_tools: Vec::new(),
            max_steps: 50,
            model: String::new(),
            base_url: String::new(),
            can_delegate: false,
        },
    );

    agents.insert(
        "planner".to_string(),
        AgentSpec {
            name: "planner".to_string(),
            mode: AgentMode::Subagent,
            description: "Analysis and planning without side effects".to_string(),
            system_prompt: "You analyze the project in {work_dir} and produce a plan. \
                            Never modify files."
                .to_string(),
            tools: vec![
                "read_file".to_string(),
                "grep".to_string(),
                "think".to_string(),
                "todo".to_string(),
            ],
            exclude_tools: Vec::new(),
            max_steps: 30,
            model: String::new(),
            base_url: String::new(),
            can_delegate: false,
        },
    );

    agents
}
