use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use amcp_context::{CompactionConfig, Compactor, Summarizer};
use amcp_core::id::{self, Prefix};
use amcp_core::EventBus;
use amcp_hooks::{HookDecision, HookEvent, HookInput, HooksManager};
use amcp_permission::{PermissionCheck, PermissionEngine, PermissionError};
use amcp_provider::{
    with_retry, ChatRequest, Provider, ProviderError, ProviderToolDef, RetryConfig, StreamEvent,
};
use amcp_session::Session;
use amcp_tool::{DelegateRequest, PermissionProbe, ToolContext, ToolError, ToolRegistry};
use amcp_types::{AgentMode, AgentSpec, Event, EventKind, Message, ToolCall};

use crate::error::AgentError;

const MAX_TOOL_RESULT_CHARS: usize = 8_000;
const PER_CONVERSATION_READ_LIMIT: usize = 100;
const PER_SESSION_READ_LIMIT: usize = 600;
const PER_CONVERSATION_MCP_LIMIT: usize = 100;

/// Everything the loop needs, constructed once per process and shared.
pub struct AgentServices {
    pub bus: Arc<EventBus>,
    pub tools: Arc<ToolRegistry>,
    pub permissions: Arc<PermissionEngine>,
    pub provider: Arc<dyn Provider>,
    pub compaction: CompactionConfig,
    pub retry: RetryConfig,
    pub default_model: String,
    pub context_window: u64,
    pub tool_timeout: Duration,
}

impl AgentServices {
    pub fn model_for(&self, spec: &AgentSpec) -> String {
        if spec.model.is_empty() {
            self.default_model.clone()
        } else {
            spec.model.clone()
        }
    }
}

/// One collected assistant turn.
struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Drives prompt → model → tool cycles for one conversation. The same
/// executor runs main sessions (history synced into the `Session`) and
/// subagent conversations (local history only).
pub struct Executor {
    services: Arc<AgentServices>,
    hooks: Arc<HooksManager>,
    session_id: String,
    cwd: String,
    spec: AgentSpec,
    loop_token: CancellationToken,
    tool_token: CancellationToken,
    /// Present for main sessions; subagents keep history to themselves.
    sink: Option<Arc<Mutex<Session>>>,
    subagent: Option<String>,
    /// Tool-call counters for the doom-loop guard.
    session_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services: Arc<AgentServices>,
        hooks: Arc<HooksManager>,
        session_id: String,
        cwd: String,
        spec: AgentSpec,
        loop_token: CancellationToken,
        tool_token: CancellationToken,
        sink: Option<Arc<Mutex<Session>>>,
        session_counts: Arc<Mutex<HashMap<String, usize>>>,
    ) -> Self {
        Self {
            services,
            hooks,
            session_id,
            cwd,
            spec,
            loop_token,
            tool_token,
            sink,
            subagent: None,
            session_counts,
        }
    }

    fn with_subagent(mut self, tag: String) -> Self {
        self.subagent = Some(tag);
        self
    }

    fn event(&self, kind: EventKind, mut payload: serde_json::Value) -> Event {
        if let Some(tag) = &self.subagent {
            if let Some(object) = payload.as_object_mut() {
                object.insert("subagent".to_string(), serde_json::json!(tag));
            }
        }
        Event::for_session(kind, self.session_id.clone(), payload).with_source(self.spec.name.clone())
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.services.bus.emit(self.event(kind, payload)).await;
    }

    async fn append(&self, history: &mut Vec<Message>, message: Message) {
        history.push(message.clone());
        if let Some(sink) = &self.sink {
            sink.lock().await.append(message);
        }
    }

    async fn record_usage(&self, prompt_tokens: u64, completion_tokens: u64) {
        if let Some(sink) = &self.sink {
            sink.lock().await.add_usage(prompt_tokens, completion_tokens);
        }
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.loop_token.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run one prompt to completion. `history` is the working conversation;
    /// for main sessions every mutation is mirrored into the session record.
    pub async fn run(&self, history: &mut Vec<Message>, prompt: &str) -> Result<String, AgentError> {
        let result = self.run_inner(history, prompt).await;

        match &result {
            Err(AgentError::Cancelled) => {
                self.emit(
                    EventKind::MessageError,
                    serde_json::json!({"code": "CANCELLED", "message": "prompt cancelled"}),
                )
                .await;
            }
            Err(error) => {
                self.emit(
                    EventKind::MessageError,
                    serde_json::json!({"code": error.code(), "message": error.to_string()}),
                )
                .await;
            }
            Ok(_) => {}
        }

        result
    }

    async fn run_inner(
        &self,
        history: &mut Vec<Message>,
        prompt: &str,
    ) -> Result<String, AgentError> {
        self.check_cancelled()?;

        if history.is_empty() && !self.spec.system_prompt.is_empty() {
            let rendered = self.spec.system_prompt.replace("{work_dir}", &self.cwd);
            self.append(history, Message::system(rendered)).await;
        }

        self.append(history, Message::user(prompt)).await;
        self.emit(EventKind::MessageStart, serde_json::json!({})).await;

        // UserPromptSubmit hooks may veto the prompt or attach feedback.
        let mut input = HookInput::new(
            self.session_id.clone(),
            HookEvent::UserPromptSubmit.as_str(),
            self.cwd.clone(),
        );
        input.prompt = Some(prompt.to_string());
        let hook_output = self
            .hooks
            .execute(HookEvent::UserPromptSubmit, &input, None)
            .await;

        if !hook_output.continue_execution || hook_output.decision == HookDecision::Deny {
            let reason = hook_output
                .stop_reason
                .or(hook_output.decision_reason)
                .unwrap_or_else(|| "prompt blocked by hook".to_string());
            return Err(AgentError::PromptBlocked(reason));
        }
        if let Some(feedback) = hook_output.feedback {
            self.append(history, Message::system(format!("[hook] {feedback}")))
                .await;
        }

        self.maybe_compact(history, false).await;

        let mut conversation_counts: HashMap<String, usize> = HashMap::new();
        let mut last_text = String::new();

        let model = self.services.model_for(&self.spec);
        for _step in 0..self.spec.max_steps {
            self.check_cancelled()?;

            let tool_defs: Vec<ProviderToolDef> = self
                .services
                .tools
                .schemas_for(&self.spec)
                .await
                .into_iter()
                .map(|schema| ProviderToolDef {
                    name: schema.name,
                    description: schema.description,
                    parameters: schema.parameters,
                })
                .collect();

            let turn = self.model_turn(history, &model, &tool_defs).await?;
            self.record_usage(turn.prompt_tokens, turn.completion_tokens).await;

            if turn.tool_calls.is_empty() {
                self.append(history, Message::assistant(turn.text.clone())).await;
                self.emit(
                    EventKind::MessageComplete,
                    serde_json::json!({"content": turn.text}),
                )
                .await;
                return Ok(turn.text);
            }

            last_text = turn.text.clone();
            self.append(
                history,
                Message::assistant_with_tools(turn.text, turn.tool_calls.clone()),
            )
            .await;

            for call in &turn.tool_calls {
                self.check_cancelled()?;
                let result = self
                    .dispatch_tool_call(call, &mut conversation_counts)
                    .await?;
                self.append(history, result).await;
            }
        }

        self.emit(
            EventKind::MessageError,
            serde_json::json!({"code": "STEP_LIMIT", "message": "maximum steps reached"}),
        )
        .await;
        Ok(last_text)
    }

    /// One streamed model call. Retries transient failures; a context
    /// overflow forces a compaction and one more attempt.
    async fn model_turn(
        &self,
        history: &mut Vec<Message>,
        model: &str,
        tool_defs: &[ProviderToolDef],
    ) -> Result<Turn, AgentError> {
        match self.model_turn_once(history, model, tool_defs).await {
            Err(AgentError::Provider(error)) if error.is_context_overflow() => {
                tracing::warn!(session_id = %self.session_id, "context overflow, forcing compaction");
                self.maybe_compact(history, true).await;
                self.model_turn_once(history, model, tool_defs).await
            }
            other => other,
        }
    }

    async fn model_turn_once(
        &self,
        history: &[Message],
        model: &str,
        tool_defs: &[ProviderToolDef],
    ) -> Result<Turn, AgentError> {
        let services = &self.services;
        let request = ChatRequest::new(model, history.to_vec()).with_tools(tool_defs.to_vec());

        let acquire = with_retry(&services.retry, || {
            services.provider.chat_stream(request.clone())
        });
        let mut stream = tokio::select! {
            biased;
            _ = self.loop_token.cancelled() => return Err(AgentError::Cancelled),
            stream = acquire => stream?,
        };

        let mut turn = Turn {
            text: String::new(),
            tool_calls: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
        };
        let mut partial_args: HashMap<String, String> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.loop_token.cancelled() => return Err(AgentError::Cancelled),
                event = stream.next() => event,
            };

            let Some(event) = event else { break };
            match event? {
                StreamEvent::TextDelta(chunk) => {
                    self.emit(EventKind::MessageChunk, serde_json::json!({"content": chunk}))
                        .await;
                    turn.text.push_str(&chunk);
                }
                StreamEvent::ToolCallStart { id, name } => {
                    let id = if id.is_empty() {
                        id::create(Prefix::ToolCall)
                    } else {
                        id
                    };
                    partial_args.insert(id.clone(), String::new());
                    turn.tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: serde_json::Value::Null,
                    });
                }
                StreamEvent::ToolCallDelta { id, arguments } => {
                    partial_args.entry(id).or_default().push_str(&arguments);
                }
                StreamEvent::Usage(usage) => {
                    turn.prompt_tokens = usage.prompt_tokens;
                    turn.completion_tokens = usage.completion_tokens;
                }
                StreamEvent::Done => break,
            }
        }

        for call in &mut turn.tool_calls {
            if let Some(raw) = partial_args.get(&call.id) {
                call.arguments = serde_json::from_str(raw)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
            }
        }

        Ok(turn)
    }

    /// The hook/permission/dispatch bracket around one tool call. Always
    /// produces a tool-result message so the history pairing invariant
    /// holds, whatever went wrong.
    async fn dispatch_tool_call(
        &self,
        call: &ToolCall,
        conversation_counts: &mut HashMap<String, usize>,
    ) -> Result<Message, AgentError> {
        self.emit(
            EventKind::ToolCallStart,
            serde_json::json!({
                "tool_name": call.name,
                "arguments": call.arguments,
                "tool_call_id": call.id,
            }),
        )
        .await;

        if let Some(limit_note) = self
            .over_call_limit(&call.name, conversation_counts)
            .await
        {
            self.emit(
                EventKind::ToolCallError,
                serde_json::json!({
                    "tool_name": call.name,
                    "tool_call_id": call.id,
                    "reason": limit_note,
                }),
            )
            .await;
            return Ok(Message::tool_result(call.id.clone(), limit_note));
        }

        *conversation_counts.entry(call.name.clone()).or_insert(0) += 1;
        {
            let mut session_counts = self.session_counts.lock().await;
            *session_counts.entry(call.name.clone()).or_insert(0) += 1;
        }

        // PreToolUse hooks run before the permission engine so their
        // updatedInput is what the engine evaluates.
        let mut arguments = call.arguments.clone();
        let mut input = HookInput::new(
            self.session_id.clone(),
            HookEvent::PreToolUse.as_str(),
            self.cwd.clone(),
        );
        input.tool_name = Some(call.name.clone());
        input.tool_input = Some(arguments.clone());
        input.tool_use_id = Some(call.id.clone());

        let pre = self
            .hooks
            .execute(HookEvent::PreToolUse, &input, Some(&call.name))
            .await;

        if pre.decision == HookDecision::Deny {
            let reason = format!(
                "denied_by_hook: {}",
                pre.decision_reason.unwrap_or_else(|| "no reason given".to_string())
            );
            self.emit(
                EventKind::ToolCallError,
                serde_json::json!({
                    "tool_name": call.name,
                    "tool_call_id": call.id,
                    "reason": reason,
                }),
            )
            .await;
            return self
                .finish_tool_call(call, &arguments, reason.clone(), false)
                .await;
        }
        if let Some(updated) = pre.updated_input {
            arguments = updated;
        }

        // Permission engine; an `ask` suspends here until the client answers.
        let check = PermissionCheck {
            session_id: self.session_id.clone(),
            tool_name: call.name.clone(),
            arguments: arguments.clone(),
            tool_call_id: Some(call.id.clone()),
            agent_rules: Vec::new(),
        };

        let permitted = tokio::select! {
            _ = self.loop_token.cancelled() => return Err(AgentError::Cancelled),
            result = self.services.permissions.check(&check) => result,
        };

        if let Err(error) = permitted {
            let reason = match error {
                PermissionError::Rejected => "denied_by_policy: rejected by client".to_string(),
                other => format!("denied_by_policy: {other}"),
            };
            self.emit(
                EventKind::ToolCallError,
                serde_json::json!({
                    "tool_name": call.name,
                    "tool_call_id": call.id,
                    "reason": reason,
                }),
            )
            .await;
            return self
                .finish_tool_call(call, &arguments, reason.clone(), false)
                .await;
        }

        // Dispatch under the per-tool timeout.
        let ctx = self.tool_context(call);
        let execution = tokio::time::timeout(
            self.services.tool_timeout,
            self.services.tools.execute(&call.name, arguments.clone(), ctx),
        )
        .await;

        let result = match execution {
            Ok(result) => result,
            Err(_) => {
                let timeout_secs = self.services.tool_timeout.as_secs();
                amcp_tool::ToolResult::fail(format!(
                    "tool timed out after {timeout_secs} seconds"
                ))
                .with_metadata("code", serde_json::json!("TIMEOUT"))
            }
        };

        let success = result.success;
        let event_kind = if success {
            EventKind::ToolCallComplete
        } else {
            EventKind::ToolCallError
        };
        let mut payload = serde_json::json!({
            "tool_name": call.name,
            "tool_call_id": call.id,
            "success": success,
        });
        if success {
            payload["result"] = serde_json::json!(truncate(&result.content, 400));
        } else {
            payload["reason"] = serde_json::json!(result.content);
            if let Some(code) = result.metadata.get("code") {
                payload["code"] = code.clone();
            }
        }
        self.emit(event_kind, payload).await;

        self.finish_tool_call(call, &arguments, result.content, success).await
    }

    /// PostToolUse hooks plus history append, shared by every outcome.
    async fn finish_tool_call(
        &self,
        call: &ToolCall,
        arguments: &serde_json::Value,
        content: String,
        success: bool,
    ) -> Result<Message, AgentError> {
        let mut input = HookInput::new(
            self.session_id.clone(),
            HookEvent::PostToolUse.as_str(),
            self.cwd.clone(),
        );
        input.tool_name = Some(call.name.clone());
        input.tool_input = Some(arguments.clone());
        input.tool_response = Some(serde_json::json!({"success": success, "content": content}));
        input.tool_use_id = Some(call.id.clone());

        let post = self
            .hooks
            .execute(HookEvent::PostToolUse, &input, Some(&call.name))
            .await;

        let mut content = match post.updated_response {
            Some(updated) => updated
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| updated.to_string()),
            None => content,
        };
        if let Some(feedback) = post.feedback {
            content.push_str(&format!("\n\n[hook feedback: {feedback}]"));
        }

        let content = truncate(&content, MAX_TOOL_RESULT_CHARS);
        Ok(Message::tool_result(call.id.clone(), content))
    }

    fn tool_context(&self, call: &ToolCall) -> ToolContext {
        let permissions = Arc::clone(&self.services.permissions);
        let session_id = self.session_id.clone();
        let delegate_services = Arc::clone(&self.services);
        let delegate_hooks = Arc::clone(&self.hooks);
        let delegate_spec = self.spec.clone();
        let delegate_cwd = self.cwd.clone();
        let delegate_session = self.session_id.clone();
        let delegate_token = self.loop_token.clone();
        let delegate_tool_token = self.tool_token.clone();
        let delegate_counts = Arc::clone(&self.session_counts);
        let can_delegate = self.spec.can_delegate && self.spec.mode == AgentMode::Primary;

        let mut ctx = ToolContext::new(self.session_id.clone(), self.cwd.clone())
            .with_call_id(call.id.clone())
            .with_agent(self.spec.name.clone())
            .with_abort(self.tool_token.clone())
            .with_ask(move |probe: PermissionProbe| {
                let permissions = Arc::clone(&permissions);
                let session_id = session_id.clone();
                async move {
                    let check = PermissionCheck {
                        session_id,
                        tool_name: probe.permission.clone(),
                        arguments: serde_json::json!({"path": probe.value}),
                        tool_call_id: None,
                        agent_rules: Vec::new(),
                    };
                    permissions
                        .check(&check)
                        .await
                        .map_err(|e| ToolError::PermissionDenied(e.to_string()))
                }
            });

        if can_delegate {
            ctx = ctx.with_delegate(move |request: DelegateRequest| {
                let services = Arc::clone(&delegate_services);
                let hooks = Arc::clone(&delegate_hooks);
                let spec = delegate_spec.clone();
                let cwd = delegate_cwd.clone();
                let session_id = delegate_session.clone();
                let loop_token = delegate_token.clone();
                let tool_token = delegate_tool_token.clone();
                let counts = Arc::clone(&delegate_counts);
                async move {
                    let sub_spec = subagent_spec(&spec, &request);
                    let tag = request.description.clone();
                    let executor = Executor::new(
                        services,
                        hooks,
                        session_id,
                        cwd,
                        sub_spec,
                        loop_token,
                        tool_token,
                        None,
                        counts,
                    )
                    .with_subagent(tag);

                    let mut history = Vec::new();
                    executor
                        .run(&mut history, &request.prompt)
                        .await
                        .map_err(|e| ToolError::ExecutionError(format!("subagent failed: {e}")))
                }
            });
        }

        ctx
    }

    async fn over_call_limit(
        &self,
        tool_name: &str,
        conversation_counts: &HashMap<String, usize>,
    ) -> Option<String> {
        let conversation = conversation_counts.get(tool_name).copied().unwrap_or(0);

        if tool_name == "read_file" {
            if conversation >= PER_CONVERSATION_READ_LIMIT {
                return Some(
                    "read_file call limit reached for this conversation; \
                     answer with the information you already have"
                        .to_string(),
                );
            }
            let session_total = self
                .session_counts
                .lock()
                .await
                .get(tool_name)
                .copied()
                .unwrap_or(0);
            if session_total >= PER_SESSION_READ_LIMIT {
                return Some(
                    "read_file call limit reached for this session; \
                     answer with the information you already have"
                        .to_string(),
                );
            }
        } else if tool_name.starts_with("mcp.") && conversation >= PER_CONVERSATION_MCP_LIMIT {
            return Some(format!(
                "{tool_name} call limit reached for this conversation; \
                 answer with the information you already have"
            ));
        }

        None
    }

    async fn maybe_compact(&self, history: &mut Vec<Message>, force: bool) {
        let compactor = Compactor::new(self.services.context_window, self.services.compaction.clone());
        if !force && !compactor.should_compact(history) {
            return;
        }
        if history.len() <= 1 {
            return;
        }

        let model = self.services.model_for(&self.spec);
        let summarizer = ProviderSummarizer {
            provider: Arc::clone(&self.services.provider),
            model: model.clone(),
        };

        let (compacted, result) = compactor.compact(history, &summarizer).await;
        if result.messages_removed == 0 {
            return;
        }

        *history = compacted;
        if let Some(sink) = &self.sink {
            sink.lock().await.replace_history(history.clone());
        }

        self.emit(
            EventKind::ContextCompacted,
            serde_json::json!({
                "original_tokens": result.original_tokens,
                "compacted_tokens": result.compacted_tokens,
                "strategy": result.strategy.as_str(),
                "model": model,
            }),
        )
        .await;
    }
}

fn subagent_spec(parent: &AgentSpec, request: &DelegateRequest) -> AgentSpec {
    let (tools, max_steps) = match request.agent_type.as_str() {
        "explorer" => (
            vec![
                "read_file".to_string(),
                "grep".to_string(),
                "think".to_string(),
                "todo".to_string(),
            ],
            50,
        ),
        "planner" => (
            vec![
                "read_file".to_string(),
                "grep".to_string(),
                "think".to_string(),
                "todo".to_string(),
            ],
            30,
        ),
        _ => (request.tools.clone(), 100),
    };

    let tools = if request.tools.is_empty() {
        tools
    } else {
        request.tools.clone()
    };

    let mut spec = parent.subagent(request.description.clone(), tools);
    spec.max_steps = max_steps.min(parent.max_steps.max(1) * 4);
    spec
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}\n... [truncated]")
}

/// Compaction summaries reuse the session's provider.
struct ProviderSummarizer {
    provider: Arc<dyn Provider>,
    model: String,
}

#[async_trait::async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, prompt: &str, max_tokens: u64) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system("You compact conversation context for coding tasks."),
                Message::user(prompt),
            ],
            tools: Vec::new(),
            max_tokens: Some(max_tokens),
            temperature: Some(0.3),
        };

        let mut stream = self
            .provider
            .chat_stream(request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event.map_err(|e: ProviderError| anyhow::anyhow!(e.to_string()))? {
                StreamEvent::TextDelta(chunk) => summary.push_str(&chunk),
                StreamEvent::Done => break,
                _ => {}
            }
        }

        if summary.trim().is_empty() {
            anyhow::bail!("empty summary");
        }
        Ok(summary)
    }
}
