use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use amcp_hooks::HooksManager;
use amcp_session::SessionManager;
use amcp_types::{
    ConflictStrategy, Event, EventKind, Priority, QueuedMessage, SessionStatus,
};

use crate::error::AgentError;
use crate::executor::{AgentServices, Executor};

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub session_id: String,
    pub content: String,
    pub priority: Priority,
    pub conflict_strategy: ConflictStrategy,
}

#[derive(Debug)]
pub enum PromptOutcome {
    /// The prompt is running; `done` resolves with its final text.
    Started {
        message_id: String,
        done: oneshot::Receiver<Result<String, AgentError>>,
    },
    /// The session was busy; the prompt waits in the queue.
    Queued { message_id: String, position: usize },
}

struct ActiveRun {
    loop_token: CancellationToken,
    tool_token: CancellationToken,
}

/// Orchestrates prompts over sessions: queue acquire/drain, one executor
/// per running prompt, cancellation, and the prompt lifecycle events.
pub struct AgentRuntime {
    services: Arc<AgentServices>,
    sessions: Arc<SessionManager>,
    hooks_cache: Mutex<HashMap<String, Arc<HooksManager>>>,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
    /// Per-session tool-call counters shared by all prompts of a session.
    session_counts: Mutex<HashMap<String, Arc<Mutex<HashMap<String, usize>>>>>,
}

impl AgentRuntime {
    pub fn new(services: Arc<AgentServices>, sessions: Arc<SessionManager>) -> Self {
        Self {
            services,
            sessions,
            hooks_cache: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            session_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn services(&self) -> Arc<AgentServices> {
        Arc::clone(&self.services)
    }

    async fn hooks_for(&self, cwd: &str) -> Arc<HooksManager> {
        let mut cache = self.hooks_cache.lock().await;
        if let Some(hooks) = cache.get(cwd) {
            return Arc::clone(hooks);
        }
        let hooks = Arc::new(HooksManager::load(cwd));
        cache.insert(cwd.to_string(), Arc::clone(&hooks));
        hooks
    }

    async fn counts_for(&self, session_id: &str) -> Arc<Mutex<HashMap<String, usize>>> {
        let mut counts = self.session_counts.lock().await;
        Arc::clone(counts.entry(session_id.to_string()).or_default())
    }

    /// Submit one prompt. Returns immediately: either the prompt started
    /// (with a completion receiver) or it was queued. `Reject` on a busy
    /// session fails with `SessionBusy` and leaves no trace but a
    /// `prompt.rejected` event.
    pub async fn submit(&self, request: PromptRequest) -> Result<PromptOutcome, AgentError> {
        if request.content.trim().is_empty() {
            return Err(AgentError::EmptyPrompt);
        }
        // Resolve early so an unknown session never touches the queue.
        self.sessions.get(&request.session_id).await?;

        let bus = self.sessions.bus();
        let message = QueuedMessage::new(&request.session_id, &request.content, request.priority);

        let queues = self.sessions.queues();
        if !queues.acquire(&request.session_id, &message.id).await {
            match request.conflict_strategy {
                ConflictStrategy::Reject => {
                    // A rejected prompt leaves no trace: `prompt.rejected`
                    // is the only event, and neither queue nor history move.
                    bus.emit(Event::for_session(
                        EventKind::PromptRejected,
                        request.session_id.clone(),
                        serde_json::json!({"message_id": message.id, "reason": "SESSION_BUSY"}),
                    ))
                    .await;
                    return Err(AgentError::SessionBusy(request.session_id));
                }
                ConflictStrategy::Queue => {
                    bus.emit(Event::for_session(
                        EventKind::PromptReceived,
                        request.session_id.clone(),
                        serde_json::json!({"message_id": message.id, "content": message.prompt}),
                    ))
                    .await;

                    let message_id = message.id.clone();
                    queues.enqueue(message).await;
                    let position = queues.queued_count(&request.session_id).await;
                    bus.emit(Event::for_session(
                        EventKind::PromptQueued,
                        request.session_id.clone(),
                        serde_json::json!({"message_id": message_id, "position": position}),
                    ))
                    .await;

                    // The running drain may have released between our failed
                    // acquire and the enqueue; re-check so the message is
                    // never stranded in an idle queue.
                    if queues.acquire(&request.session_id, &message_id).await {
                        if let Some(next) = queues.release(&request.session_id).await {
                            let (orphan_tx, _orphan_rx) = oneshot::channel();
                            self.spawn_drain(next, orphan_tx).await;
                        }
                    }

                    return Ok(PromptOutcome::Queued {
                        message_id,
                        position,
                    });
                }
            }
        }

        // Acquired: this task owns the session until the queue drains.
        bus.emit(Event::for_session(
            EventKind::PromptReceived,
            request.session_id.clone(),
            serde_json::json!({"message_id": message.id, "content": message.prompt}),
        ))
        .await;
        bus.emit(Event::for_session(
            EventKind::SessionBusy,
            request.session_id.clone(),
            serde_json::json!({}),
        ))
        .await;
        let _ = self
            .sessions
            .set_status(&request.session_id, SessionStatus::Busy)
            .await;

        let (done_tx, done_rx) = oneshot::channel();
        let message_id = message.id.clone();
        self.spawn_drain(message, done_tx).await;

        Ok(PromptOutcome::Started {
            message_id,
            done: done_rx,
        })
    }

    async fn spawn_drain(
        &self,
        first: QueuedMessage,
        done_tx: oneshot::Sender<Result<String, AgentError>>,
    ) {
        let services = Arc::clone(&self.services);
        let sessions = Arc::clone(&self.sessions);
        let active = Arc::clone(&self.active);
        let session_id = first.session_id.clone();
        let hooks = {
            let cwd = match sessions.get(&session_id).await {
                Ok(handle) => handle.lock().await.cwd.clone(),
                Err(_) => String::new(),
            };
            self.hooks_for(&cwd).await
        };
        let counts = self.counts_for(&session_id).await;

        tokio::spawn(async move {
            let bus = sessions.bus();
            let mut current = Some(first);
            let mut done_tx = Some(done_tx);

            while let Some(message) = current.take() {
                bus.emit(Event::for_session(
                    EventKind::PromptStarted,
                    session_id.clone(),
                    serde_json::json!({"message_id": message.id, "content": message.prompt}),
                ))
                .await;

                let result = run_single_prompt(
                    &services,
                    &sessions,
                    &active,
                    Arc::clone(&hooks),
                    Arc::clone(&counts),
                    &session_id,
                    &message,
                )
                .await;

                match &result {
                    Err(AgentError::Cancelled) => {
                        let _ = sessions.set_status(&session_id, SessionStatus::Cancelled).await;
                    }
                    Err(_) => {
                        let _ = sessions.set_status(&session_id, SessionStatus::Error).await;
                    }
                    Ok(_) => {}
                }

                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(result);
                }

                // Pull the next queued message; the queue keeps the session
                // busy while one is available.
                if !sessions.contains(&session_id).await {
                    break;
                }
                current = sessions.queues().release(&session_id).await;
            }

            active.lock().await.remove(&session_id);
            if sessions.contains(&session_id).await {
                let _ = sessions.set_status(&session_id, SessionStatus::Idle).await;
                bus.emit(Event::for_session(
                    EventKind::SessionIdle,
                    session_id.clone(),
                    serde_json::json!({}),
                ))
                .await;
                bus.emit(Event::for_session(
                    EventKind::AgentIdle,
                    session_id.clone(),
                    serde_json::json!({}),
                ))
                .await;
            }
        });
    }

    /// Cancel the running prompt of a session. Non-force lets an in-flight
    /// tool finish and skips the remaining steps; `force` also trips the
    /// tool's own cancellation token. Queued prompts are unaffected.
    pub async fn cancel(&self, session_id: &str, force: bool) -> bool {
        let active = self.active.lock().await;
        let Some(run) = active.get(session_id) else {
            return false;
        };
        run.loop_token.cancel();
        if force {
            run.tool_token.cancel();
        }
        true
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_single_prompt(
    services: &Arc<AgentServices>,
    sessions: &Arc<SessionManager>,
    active: &Arc<Mutex<HashMap<String, ActiveRun>>>,
    hooks: Arc<HooksManager>,
    counts: Arc<Mutex<HashMap<String, usize>>>,
    session_id: &str,
    message: &QueuedMessage,
) -> Result<String, AgentError> {
    let handle = sessions.get(session_id).await?;
    let (cwd, spec, mut history) = {
        let session = handle.lock().await;
        (session.cwd.clone(), session.spec.clone(), session.history.clone())
    };

    // Fresh tokens per prompt: a cancelled prompt must not poison the
    // queued ones behind it.
    let loop_token = CancellationToken::new();
    let tool_token = CancellationToken::new();
    active.lock().await.insert(
        session_id.to_string(),
        ActiveRun {
            loop_token: loop_token.clone(),
            tool_token: tool_token.clone(),
        },
    );

    let _ = sessions.set_status(session_id, SessionStatus::Busy).await;

    let executor = Executor::new(
        Arc::clone(services),
        hooks,
        session_id.to_string(),
        cwd,
        spec,
        loop_token,
        tool_token,
        Some(handle),
        counts,
    );

    executor.run(&mut history, &message.prompt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_context::CompactionConfig;
    use amcp_core::{EventBus, EventPriority};
    use amcp_permission::{PermissionAction, PermissionEngine, PermissionRule};
    use amcp_provider::{
        ChatRequest, ChatStream, Provider, ProviderError, RetryConfig, ScriptedProvider,
        ScriptedTurn,
    };
    use amcp_session::SessionManager;
    use amcp_types::{default_agent_spec, Message, Role};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Provider gate: each model call consumes one permit, so tests can
    /// deterministically observe the busy window.
    struct GatedProvider {
        inner: ScriptedProvider,
        gate: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl Provider for GatedProvider {
        fn id(&self) -> &str {
            "gated"
        }

        async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
            self.gate
                .acquire()
                .await
                .expect("gate closed")
                .forget();
            self.inner.chat_stream(request).await
        }
    }

    struct Harness {
        runtime: Arc<AgentRuntime>,
        bus: Arc<EventBus>,
        session_id: String,
    }

    async fn harness_with(
        provider: Arc<dyn Provider>,
        permission_rules: Vec<PermissionRule>,
        compaction: CompactionConfig,
        context_window: u64,
    ) -> Harness {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionManager::new(Arc::clone(&bus), 100));
        let tools = Arc::new(amcp_tool::create_default_registry().await);
        let permissions = Arc::new(
            PermissionEngine::new(permission_rules, Vec::new())
                .with_ask_timeout(Duration::from_millis(100)),
        );

        let services = Arc::new(AgentServices {
            bus: Arc::clone(&bus),
            tools,
            permissions,
            provider,
            compaction,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                backoff_factor: 2,
                max_delay_ms: 4,
            },
            default_model: "test-model".to_string(),
            context_window,
            tool_timeout: Duration::from_secs(5),
        });

        let cwd = std::env::temp_dir().to_string_lossy().to_string();
        let mut spec = default_agent_spec();
        spec.system_prompt = String::new();
        let info = sessions.create(cwd, spec).await.unwrap();

        Harness {
            runtime: Arc::new(AgentRuntime::new(services, sessions)),
            bus,
            session_id: info.id,
        }
    }

    async fn harness(turns: Vec<ScriptedTurn>) -> Harness {
        harness_with(
            Arc::new(ScriptedProvider::new(turns)),
            vec![PermissionRule::new("bash", "**", PermissionAction::Allow)],
            CompactionConfig::default(),
            200_000,
        )
        .await
    }

    fn request(session_id: &str, content: &str) -> PromptRequest {
        PromptRequest {
            session_id: session_id.to_string(),
            content: content.to_string(),
            priority: Priority::Normal,
            conflict_strategy: ConflictStrategy::Queue,
        }
    }

    async fn drain_events(bus: &EventBus, session_id: &str) -> Vec<Event> {
        bus.history(None, Some(session_id), None)
            .await
            .into_iter()
            .rev()
            .collect()
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn single_turn_greeting() {
        let h = harness(vec![ScriptedTurn::text("hello")]).await;

        let outcome = h.runtime.submit(request(&h.session_id, "hi")).await.unwrap();
        let PromptOutcome::Started { done, .. } = outcome else {
            panic!("expected started");
        };
        assert_eq!(done.await.unwrap().unwrap(), "hello");

        // Allow the drain task to go idle.
        let mut info = h.runtime.sessions().info(&h.session_id).await.unwrap();
        for _ in 0..100 {
            if info.status == SessionStatus::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            info = h.runtime.sessions().info(&h.session_id).await.unwrap();
        }
        assert_eq!(info.message_count, 2);
        assert_eq!(info.status, SessionStatus::Idle);
        assert!(info.token_usage.prompt_tokens > 0);

        let events = drain_events(&h.bus, &h.session_id).await;
        let kinds = kinds(&events);
        let expect = [
            EventKind::PromptReceived,
            EventKind::PromptStarted,
            EventKind::MessageStart,
            EventKind::MessageChunk,
            EventKind::MessageComplete,
        ];
        let mut cursor = 0;
        for kind in &kinds {
            if cursor < expect.len() && *kind == expect[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, expect.len(), "event order mismatch: {kinds:?}");
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let h = harness(vec![
            ScriptedTurn::tool_call("bash", "call_ls", serde_json::json!({"command": "echo listing"})),
            ScriptedTurn::text("the directory contains listing"),
        ])
        .await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "list files in ."))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        let answer = done.await.unwrap().unwrap();
        assert!(answer.contains("listing"));

        let events = drain_events(&h.bus, &h.session_id).await;
        let kinds = kinds(&events);
        let start = kinds.iter().position(|k| *k == EventKind::ToolCallStart).unwrap();
        let complete = kinds.iter().position(|k| *k == EventKind::ToolCallComplete).unwrap();
        let message_complete = kinds
            .iter()
            .position(|k| *k == EventKind::MessageComplete)
            .unwrap();
        assert!(start < complete);
        assert!(complete < message_complete);

        // History pairing: the tool result follows its assistant call.
        let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
        let session = handle.lock().await;
        for (i, message) in session.history.iter().enumerate() {
            if message.role == Role::Tool {
                let id = message.tool_call_id.as_deref().unwrap();
                assert!(session.history[..i].iter().any(|m| {
                    m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == id)
                }));
            }
        }
    }

    #[tokio::test]
    async fn denied_tool_recovers_with_text() {
        let h = harness_with(
            Arc::new(ScriptedProvider::new(vec![
                ScriptedTurn::tool_call("bash", "call_ls", serde_json::json!({"command": "ls"})),
                ScriptedTurn::text("I cannot run commands, but here is what I know."),
            ])),
            vec![PermissionRule::new("bash", "**", PermissionAction::Deny)],
            CompactionConfig::default(),
            200_000,
        )
        .await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "list files in ."))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        let answer = done.await.unwrap().unwrap();
        assert!(!answer.is_empty());

        let events = drain_events(&h.bus, &h.session_id).await;
        let error = events
            .iter()
            .find(|e| e.kind == EventKind::ToolCallError)
            .expect("expected tool.call_error");
        assert!(error.payload["reason"]
            .as_str()
            .unwrap()
            .starts_with("denied_by_policy"));
        assert!(events.iter().any(|e| e.kind == EventKind::MessageComplete));

        // The denial reached the model as a failed tool result.
        let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
        let session = handle.lock().await;
        assert!(session
            .history
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("denied_by_policy")));
    }

    #[tokio::test]
    async fn queued_prompts_run_in_priority_order() {
        let gate = Arc::new(Semaphore::new(0));
        let provider = Arc::new(GatedProvider {
            inner: ScriptedProvider::new(vec![
                ScriptedTurn::text("first done"),
                ScriptedTurn::text("urgent done"),
                ScriptedTurn::text("normal done"),
            ]),
            gate: Arc::clone(&gate),
        });
        let h = harness_with(
            provider,
            Vec::new(),
            CompactionConfig::default(),
            200_000,
        )
        .await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "first"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };

        // While the first prompt is gated, queue a normal and an urgent one.
        let mut second = request(&h.session_id, "second");
        second.priority = Priority::Normal;
        let PromptOutcome::Queued { .. } = h.runtime.submit(second).await.unwrap() else {
            panic!("expected queued");
        };

        let mut third = request(&h.session_id, "third");
        third.priority = Priority::Urgent;
        let PromptOutcome::Queued { .. } = h.runtime.submit(third).await.unwrap() else {
            panic!("expected queued");
        };

        gate.add_permits(1);
        assert_eq!(done.await.unwrap().unwrap(), "first done");
        gate.add_permits(2);

        // Wait for the queue to drain.
        for _ in 0..200 {
            let info = h.runtime.sessions().info(&h.session_id).await.unwrap();
            if info.status == SessionStatus::Idle && info.queued_count == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let events = drain_events(&h.bus, &h.session_id).await;
        let started: Vec<String> = events
            .iter()
            .filter(|e| e.kind == EventKind::PromptStarted)
            .map(|e| e.payload["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["first", "third", "second"]);

        let info = h.runtime.sessions().info(&h.session_id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Idle);
        assert_eq!(info.queued_count, 0);
    }

    #[tokio::test]
    async fn reject_strategy_on_busy_session() {
        let gate = Arc::new(Semaphore::new(0));
        let provider = Arc::new(GatedProvider {
            inner: ScriptedProvider::new(vec![ScriptedTurn::text("done")]),
            gate: Arc::clone(&gate),
        });
        let h = harness_with(provider, Vec::new(), CompactionConfig::default(), 200_000).await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "first"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };

        // Wait until the running prompt has emitted `message.start`: past
        // that point it is parked at the gated model call and emits nothing
        // further until released.
        let mut started = false;
        for _ in 0..200 {
            if !h
                .bus
                .history(Some(EventKind::MessageStart), Some(&h.session_id), None)
                .await
                .is_empty()
            {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(started);

        let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
        let history_before = handle.lock().await.history.len();
        assert!(history_before > 0);

        // Capture exactly the events produced by the rejected submission.
        // The first prompt is parked at the gate, so nothing else can emit
        // in this window.
        let mut reject_rx = h.bus.subscribe_channel();

        let mut rejected = request(&h.session_id, "rejected");
        rejected.conflict_strategy = ConflictStrategy::Reject;
        let err = h.runtime.submit(rejected).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy(_)));

        // No queue mutation, no history mutation beyond the running prompt.
        assert_eq!(
            h.runtime
                .sessions()
                .queues()
                .queued_count(&h.session_id)
                .await,
            0
        );
        {
            let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
            let session = handle.lock().await;
            assert_eq!(session.history.len(), history_before);
            assert!(!session
                .history
                .iter()
                .any(|m| m.content.contains("rejected")));
        }

        // The reject path emits `prompt.rejected` and nothing else.
        let mut rejected_events = Vec::new();
        while let Ok(event) = reject_rx.try_recv() {
            if event.session_id.as_deref() == Some(h.session_id.as_str()) {
                rejected_events.push(event.kind);
            }
        }
        assert_eq!(rejected_events, vec![EventKind::PromptRejected]);

        gate.add_permits(1);
        done.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn enqueue_racing_a_release_is_not_stranded() {
        // Reproduces the window where a prompt fails the first acquire
        // against a running drain, and that drain releases the session
        // before the prompt lands in the queue. Without the re-acquire
        // recovery in `submit`, the message would sit in an idle queue
        // forever.
        let h = harness(vec![ScriptedTurn::text("recovered from race")]).await;
        let queues = h.runtime.sessions().queues();

        // A phantom owner stands in for the drain that is about to finish.
        assert!(queues.acquire(&h.session_id, "phantom").await);

        // `prompt.received` is emitted between the failed acquire and the
        // enqueue; releasing there recreates the exact interleaving. The
        // queue is still empty at that instant, so the release flips the
        // session idle.
        let release_queues = Arc::clone(&queues);
        let release_session = h.session_id.clone();
        h.bus
            .subscribe(
                Some(vec![EventKind::PromptReceived]),
                EventPriority::Normal,
                Some(h.session_id.clone()),
                true,
                move |_| {
                    let queues = Arc::clone(&release_queues);
                    let session_id = release_session.clone();
                    async move {
                        assert!(queues.release(&session_id).await.is_none());
                    }
                },
            )
            .await;

        let outcome = h.runtime.submit(request(&h.session_id, "raced")).await.unwrap();
        let PromptOutcome::Queued { .. } = outcome else {
            panic!("expected queued");
        };

        // The recovery drain must pick the message up and run it.
        for _ in 0..200 {
            let info = h.runtime.sessions().info(&h.session_id).await.unwrap();
            if info.status == SessionStatus::Idle
                && info.queued_count == 0
                && info.message_count == 2
            {
                let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
                let session = handle.lock().await;
                assert!(session
                    .history
                    .iter()
                    .any(|m| m.role == Role::Assistant && m.content == "recovered from race"));
                drop(session);

                let events = drain_events(&h.bus, &h.session_id).await;
                let started = events
                    .iter()
                    .find(|e| e.kind == EventKind::PromptStarted)
                    .expect("expected prompt.started for the recovered message");
                assert_eq!(started.payload["content"], "raced");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recovered prompt never ran");
    }

    #[tokio::test]
    async fn oversized_history_is_compacted() {
        let mut compaction = CompactionConfig::default();
        compaction.strategy = amcp_context::CompactionStrategy::Hybrid;
        compaction.min_tokens_to_compact = 0;

        let h = harness_with(
            Arc::new(ScriptedProvider::new(vec![
                // First call is the hybrid summarizer, second the reply.
                ScriptedTurn::text("summary of earlier work"),
                ScriptedTurn::text("fresh answer"),
            ])),
            Vec::new(),
            compaction,
            2_000,
        )
        .await;

        // Synthesize an oversized history.
        let tail: Vec<Message> = {
            let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
            let mut session = handle.lock().await;
            for i in 0..30 {
                session.append(Message::user(format!("request {i}: {}", "x".repeat(200))));
                session.append(Message::assistant(format!("answer {i}: {}", "y".repeat(200))));
            }
            session.history[session.history.len() - 5..].to_vec()
        };

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "continue"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        assert_eq!(done.await.unwrap().unwrap(), "fresh answer");

        let events = drain_events(&h.bus, &h.session_id).await;
        let compacted = events
            .iter()
            .find(|e| e.kind == EventKind::ContextCompacted)
            .expect("expected context.compacted");
        let original = compacted.payload["original_tokens"].as_u64().unwrap();
        let after = compacted.payload["compacted_tokens"].as_u64().unwrap();
        assert!(original > after);

        // The preserved tail survived verbatim.
        let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
        let session = handle.lock().await;
        for message in &tail {
            assert!(session.history.iter().any(|m| m.content == message.content));
        }
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let h = harness(vec![]).await;
        let err = h.runtime.submit(request(&h.session_id, "   ")).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyPrompt));
    }

    #[tokio::test]
    async fn zero_max_steps_returns_immediately() {
        let h = harness(vec![ScriptedTurn::text("unused")]).await;
        {
            let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
            handle.lock().await.spec.max_steps = 0;
        }

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "hi"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        assert_eq!(done.await.unwrap().unwrap(), "");

        let events = drain_events(&h.bus, &h.session_id).await;
        let error = events
            .iter()
            .find(|e| e.kind == EventKind::MessageError)
            .unwrap();
        assert_eq!(error.payload["code"], "STEP_LIMIT");
    }

    #[tokio::test]
    async fn provider_retry_then_success() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::text("recovered")])
            .with_errors(vec![ProviderError::Network("blip".to_string())]);
        let h = harness_with(
            Arc::new(provider),
            Vec::new(),
            CompactionConfig::default(),
            200_000,
        )
        .await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "hi"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        assert_eq!(done.await.unwrap().unwrap(), "recovered");
    }

    #[tokio::test]
    async fn cancellation_surfaces_and_session_recovers() {
        // The first prompt is cancelled while blocked on the gate, before it
        // consumes a scripted turn; the retry prompt gets the only turn.
        let gate = Arc::new(Semaphore::new(0));
        let provider = Arc::new(GatedProvider {
            inner: ScriptedProvider::new(vec![ScriptedTurn::text("after cancel")]),
            gate: Arc::clone(&gate),
        });
        let h = harness_with(provider, Vec::new(), CompactionConfig::default(), 200_000).await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "long task"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };

        assert!(h.runtime.cancel(&h.session_id, false).await);
        gate.add_permits(1);
        let result = done.await.unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));

        let events = drain_events(&h.bus, &h.session_id).await;
        let error = events
            .iter()
            .find(|e| e.kind == EventKind::MessageError)
            .unwrap();
        assert_eq!(error.payload["code"], "CANCELLED");

        // Wait for the session to return to idle before re-prompting.
        for _ in 0..200 {
            if !h.runtime.is_running(&h.session_id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A fresh prompt proceeds normally.
        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "try again"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        gate.add_permits(1);
        assert_eq!(done.await.unwrap().unwrap(), "after cancel");
    }

    #[tokio::test]
    async fn delegation_runs_subagent_and_returns_result() {
        let h = harness_with(
            Arc::new(ScriptedProvider::new(vec![
                ScriptedTurn::tool_call(
                    "task",
                    "call_task",
                    serde_json::json!({
                        "description": "explore",
                        "prompt": "look around",
                        "agent_type": "explorer"
                    }),
                ),
                // Subagent's own turn.
                ScriptedTurn::text("subagent findings"),
                // Parent's final turn.
                ScriptedTurn::text("done, the subagent found things"),
            ])),
            vec![PermissionRule::new("task", "**", PermissionAction::Allow)],
            CompactionConfig::default(),
            200_000,
        )
        .await;

        let PromptOutcome::Started { done, .. } = h
            .runtime
            .submit(request(&h.session_id, "delegate this"))
            .await
            .unwrap()
        else {
            panic!("expected started");
        };
        let answer = done.await.unwrap().unwrap();
        assert!(answer.contains("subagent found"));

        // The subagent result came back as the task tool's result.
        let handle = h.runtime.sessions().get(&h.session_id).await.unwrap();
        let session = handle.lock().await;
        assert!(session
            .history
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("subagent findings")));
        // Subagent history stayed out of the session.
        assert!(!session
            .history
            .iter()
            .any(|m| m.role == Role::User && m.content == "look around"));
    }
}
