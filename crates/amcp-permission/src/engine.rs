use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::arity;
use crate::ruleset::{
    self, match_value, PermissionAction, PermissionMode, PermissionRule, PermissionRuleset,
};

/// A permission request that needs a client answer before the tool call can
/// proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub match_value: String,
    pub tool_call_id: Option<String>,
    pub always_patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResponse {
    AllowOnce,
    AllowAlways,
    Deny,
}

/// One tool call to be checked.
#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub tool_call_id: Option<String>,
    /// AgentSpec-level rules, merged between project config and session
    /// always-allow memory.
    pub agent_rules: PermissionRuleset,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("denied_by_policy: {reason}")]
    Denied { reason: String },

    #[error("permission request rejected by client")]
    Rejected,

    #[error("no pending permission request {0}")]
    NotFound(String),
}

/// Callback the session manager installs to surface `approval_required`
/// events; the engine itself holds no bus reference.
pub type ApprovalNotifier = Arc<dyn Fn(ApprovalRequest) + Send + Sync>;

pub struct PermissionEngine {
    base_layers: RwLock<Vec<PermissionRuleset>>,
    session_rules: RwLock<HashMap<String, PermissionRuleset>>,
    session_modes: RwLock<HashMap<String, PermissionMode>>,
    default_mode: RwLock<PermissionMode>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
    notifier: RwLock<Option<ApprovalNotifier>>,
    ask_timeout: Duration,
    delegate_timeout: Duration,
}

impl PermissionEngine {
    /// Engine over the built-in defaults plus user and project config layers,
    /// in that merge order.
    pub fn new(user_rules: PermissionRuleset, project_rules: PermissionRuleset) -> Self {
        Self {
            base_layers: RwLock::new(vec![ruleset::default_ruleset(), user_rules, project_rules]),
            session_rules: RwLock::new(HashMap::new()),
            session_modes: RwLock::new(HashMap::new()),
            default_mode: RwLock::new(PermissionMode::Normal),
            pending: Mutex::new(HashMap::new()),
            notifier: RwLock::new(None),
            ask_timeout: Duration::from_secs(300),
            delegate_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn with_delegate_timeout(mut self, timeout: Duration) -> Self {
        self.delegate_timeout = timeout;
        self
    }

    pub async fn set_notifier(&self, notifier: ApprovalNotifier) {
        *self.notifier.write().await = Some(notifier);
    }

    pub async fn set_default_mode(&self, mode: PermissionMode) {
        *self.default_mode.write().await = mode;
    }

    pub async fn set_session_mode(&self, session_id: &str, mode: PermissionMode) {
        self.session_modes
            .write()
            .await
            .insert(session_id.to_string(), mode);
    }

    pub async fn session_mode(&self, session_id: &str) -> PermissionMode {
        self.session_modes
            .read()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(*self.default_mode.read().await)
    }

    pub async fn approve_session_pattern(&self, session_id: &str, permission: &str, pattern: &str) {
        self.session_rules
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(PermissionRule::new(permission, pattern, PermissionAction::Allow));
    }

    /// Drop a session's always-allow memory, mode override, and pending asks.
    pub async fn clear_session(&self, session_id: &str) {
        self.session_rules.write().await.remove(session_id);
        self.session_modes.write().await.remove(session_id);

        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .keys()
            .filter(|id| id.starts_with(&format!("{session_id}/")))
            .cloned()
            .collect();
        for id in ids {
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(ApprovalResponse::Deny);
            }
        }
    }

    /// Decide the base action for a request without any blocking side
    /// effects. Mode overrides are applied on top of the rule decision.
    pub async fn evaluate(&self, check: &PermissionCheck) -> (PermissionAction, PermissionRule) {
        let value = match_value(&check.tool_name, &check.arguments);
        let rule = {
            let base = self.base_layers.read().await;
            let session_rules = self.session_rules.read().await;
            let mut layers: Vec<PermissionRuleset> = base.clone();
            layers.push(check.agent_rules.clone());
            if let Some(session_layer) = session_rules.get(&check.session_id) {
                layers.push(session_layer.clone());
            }
            ruleset::evaluate(&check.tool_name, &value, &layers)
        };

        let action = match self.session_mode(&check.session_id).await {
            PermissionMode::Normal => rule.action,
            PermissionMode::Yolo if rule.action != PermissionAction::Deny => PermissionAction::Allow,
            PermissionMode::Strict if rule.action != PermissionAction::Deny => PermissionAction::Ask,
            _ => rule.action,
        };

        (action, rule)
    }

    /// Full check: evaluate, then run the delegate helper or suspend on a
    /// client answer as required. `Ok(())` means the tool may run.
    pub async fn check(&self, check: &PermissionCheck) -> Result<(), PermissionError> {
        let (action, rule) = self.evaluate(check).await;

        match action {
            PermissionAction::Allow => Ok(()),
            PermissionAction::Deny => Err(PermissionError::Denied {
                reason: format!(
                    "{} blocked by rule `{} = {}`",
                    check.tool_name, rule.permission, rule.pattern
                ),
            }),
            PermissionAction::Delegate => match self.delegate(check, &rule).await {
                DelegateVerdict::Allow => Ok(()),
                DelegateVerdict::Deny(reason) => Err(PermissionError::Denied { reason }),
                DelegateVerdict::Ask => self.ask(check).await,
            },
            PermissionAction::Ask => self.ask(check).await,
        }
    }

    async fn ask(&self, check: &PermissionCheck) -> Result<(), PermissionError> {
        let notifier = self.notifier.read().await.clone();
        let Some(notifier) = notifier else {
            // Non-interactive process: nobody can answer, so asks pass.
            return Ok(());
        };

        let value = match_value(&check.tool_name, &check.arguments);
        let request_id = format!(
            "{}/per_{}",
            check.session_id,
            uuid::Uuid::new_v4().simple()
        );
        let request = ApprovalRequest {
            id: request_id.clone(),
            session_id: check.session_id.clone(),
            tool_name: check.tool_name.clone(),
            match_value: value,
            tool_call_id: check.tool_call_id.clone(),
            always_patterns: self.always_patterns(check),
            created_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        notifier(request.clone());

        let response = match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(response)) => response,
            // Deadline or dropped sender: treated as deny.
            _ => {
                self.pending.lock().await.remove(&request_id);
                ApprovalResponse::Deny
            }
        };

        match response {
            ApprovalResponse::AllowOnce => Ok(()),
            ApprovalResponse::AllowAlways => {
                if let Some(pattern) = request.always_patterns.first() {
                    self.approve_session_pattern(&check.session_id, &check.tool_name, pattern)
                        .await;
                }
                Ok(())
            }
            ApprovalResponse::Deny => Err(PermissionError::Rejected),
        }
    }

    /// Answer a pending approval. The `request_id` is the id carried by the
    /// `approval_required` event.
    pub async fn respond(
        &self,
        request_id: &str,
        response: ApprovalResponse,
    ) -> Result<(), PermissionError> {
        let tx = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| PermissionError::NotFound(request_id.to_string()))?;
        let _ = tx.send(response);
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn always_patterns(&self, check: &PermissionCheck) -> Vec<String> {
        let mut patterns = Vec::new();
        match check.tool_name.as_str() {
            "bash" => {
                let command = check
                    .arguments
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if let Some(pattern) = arity::always_pattern(command) {
                    patterns.push(pattern);
                }
                patterns.push(command.to_string());
            }
            "read_file" | "write_file" | "edit_file" => {
                let path = check
                    .arguments
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if let Some((dir, _)) = path.rsplit_once('/') {
                    patterns.push(format!("{dir}/*"));
                }
                if let Some((_, ext)) = path.rsplit_once('.') {
                    patterns.push(format!("**.{ext}"));
                }
                patterns.push(path.to_string());
            }
            "grep" => {
                let pattern = check
                    .arguments
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("*");
                patterns.push(pattern.to_string());
            }
            _ => patterns.push("*".to_string()),
        }
        patterns.retain(|p| !p.is_empty());
        patterns
    }

    async fn delegate(&self, check: &PermissionCheck, rule: &PermissionRule) -> DelegateVerdict {
        let Some(program) = rule.delegate_to.as_deref() else {
            return DelegateVerdict::Ask;
        };

        let input = serde_json::json!({
            "tool": check.tool_name,
            "arguments": check.arguments,
            "session_id": check.session_id,
        });

        let spawn = tokio::process::Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("AMCP_TOOL_NAME", &check.tool_name)
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(program, %error, "permission delegate failed to spawn");
                return DelegateVerdict::Ask;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.to_string().as_bytes()).await;
        }

        let output = match tokio::time::timeout(self.delegate_timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                tracing::warn!(program, %error, "permission delegate failed");
                return DelegateVerdict::Ask;
            }
            Err(_) => {
                tracing::warn!(program, "permission delegate timed out");
                return DelegateVerdict::Ask;
            }
        };

        match output.status.code() {
            Some(0) => DelegateVerdict::Allow,
            Some(1) => DelegateVerdict::Ask,
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let reason = if stderr.is_empty() {
                    format!("denied by delegate {program}")
                } else {
                    stderr
                };
                DelegateVerdict::Deny(reason)
            }
        }
    }
}

enum DelegateVerdict {
    Allow,
    Ask,
    Deny(String),
}
