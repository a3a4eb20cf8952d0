use chrono::{DateTime, Utc};
use std::path::PathBuf;

use amcp_types::{AgentSpec, Message, Role, SessionInfo, SessionStatus, TokenUsage};

/// One conversation scope. The history is owned by the session's agent
/// loop: only that loop appends while the session is busy.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cwd: String,
    pub spec: AgentSpec,
    pub history: Vec<Message>,
    pub status: SessionStatus,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connected_clients: usize,
    /// Advisory JSONL mirror of the history; `None` disables persistence.
    pub history_path: Option<PathBuf>,
}

impl Session {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>, spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            cwd: cwd.into(),
            spec,
            history: Vec::new(),
            status: SessionStatus::Idle,
            token_usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
            connected_clients: 0,
            history_path: None,
        }
    }

    /// Append to the history and mirror the message to the JSONL file.
    /// Persistence is advisory: write failures are logged, never surfaced.
    pub fn append(&mut self, message: Message) {
        if let Some(path) = &self.history_path {
            if let Ok(line) = serde_json::to_string(&message) {
                if let Err(error) = append_line(path, &line) {
                    tracing::warn!(session_id = %self.id, %error, "history mirror write failed");
                }
            }
        }
        self.history.push(message);
        self.updated_at = Utc::now();
    }

    /// Replace the history after compaction. The mirror stays append-only;
    /// compaction is recorded there as a marker line.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        if let Some(path) = &self.history_path {
            let marker = serde_json::json!({"compacted": true, "messages": history.len()});
            let _ = append_line(path, &marker.to_string());
        }
        self.history = history;
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn add_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.token_usage.add(prompt_tokens, completion_tokens);
        self.updated_at = Utc::now();
    }

    /// Conversation length as shown to clients: system messages are
    /// plumbing, not conversation.
    pub fn message_count(&self) -> usize {
        self.history.iter().filter(|m| m.role != Role::System).count()
    }

    pub fn info(&self, queued_count: usize) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            cwd: self.cwd.clone(),
            agent_name: self.spec.name.clone(),
            status: self.status,
            message_count: self.message_count(),
            token_usage: self.token_usage,
            queued_count,
            connected_clients: self.connected_clients,
        }
    }
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
