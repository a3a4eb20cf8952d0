use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::{HookEvent, HookHandler, HooksConfig};
use crate::output::{HookDecision, HookInput, HookOutput};

/// Runs configured hooks for one project directory.
pub struct HooksManager {
    project_dir: PathBuf,
    config: HooksConfig,
}

impl HooksManager {
    pub fn load(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let config = HooksConfig::load(&project_dir);
        Self {
            project_dir,
            config,
        }
    }

    pub fn with_config(project_dir: impl Into<PathBuf>, config: HooksConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
        }
    }

    pub fn has_handlers(&self, event: HookEvent) -> bool {
        !self.config.handlers_for(event, None).is_empty()
            || self
                .config
                .handlers
                .get(&event)
                .is_some_and(|h| h.iter().any(|handler| handler.enabled))
    }

    /// Run every matching handler in configured order, merging outputs.
    /// Processing stops early when a handler denies or asks to stop.
    pub async fn execute(
        &self,
        event: HookEvent,
        input: &HookInput,
        tool_name: Option<&str>,
    ) -> HookOutput {
        let handlers = self.config.handlers_for(event, tool_name);
        let mut combined = HookOutput::passthrough();

        for handler in handlers {
            let output = self.run_handler(handler, input).await;
            let deny = output.decision == HookDecision::Deny;
            let stop = !output.continue_execution;
            combined.merge(output);
            if deny || stop {
                break;
            }
        }

        combined
    }

    async fn run_handler(&self, handler: &HookHandler, input: &HookInput) -> HookOutput {
        let payload = match serde_json::to_string(input) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "hook input failed to serialize");
                return HookOutput::passthrough();
            }
        };

        let mut command = shell_command(&handler.command);
        command
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("AMCP_PROJECT_DIR", &self.project_dir)
            .env("AMCP_SESSION_ID", &input.session_id)
            .env("AMCP_HOOK_EVENT", &input.hook_event_name);
        if let Some(tool_name) = &input.tool_name {
            command.env("AMCP_TOOL_NAME", tool_name);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(command = %handler.command, %error, "hook failed to spawn");
                return HookOutput::passthrough();
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
        }

        let timeout = Duration::from_secs(handler.timeout);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                tracing::warn!(command = %handler.command, %error, "hook wait failed");
                return HookOutput::passthrough();
            }
            Err(_) => {
                // Timeouts degrade open: logged, treated as a non-blocking
                // error, the pipeline continues.
                tracing::warn!(
                    command = %handler.command,
                    timeout_secs = handler.timeout,
                    "hook timed out"
                );
                return HookOutput::passthrough();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        HookOutput::from_exit(output.status.code().unwrap_or(-1), &stdout, &stderr)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manager_with(handlers: Vec<(HookEvent, HookHandler)>) -> HooksManager {
        let mut map: HashMap<HookEvent, Vec<HookHandler>> = HashMap::new();
        for (event, handler) in handlers {
            map.entry(event).or_default().push(handler);
        }
        HooksManager::with_config(
            std::env::temp_dir(),
            HooksConfig { handlers: map },
        )
    }

    fn handler(command: &str) -> HookHandler {
        HookHandler {
            matcher: "*".to_string(),
            command: command.to_string(),
            timeout: 5,
            enabled: true,
        }
    }

    fn input() -> HookInput {
        let mut input = HookInput::new("ses_hooks", "PreToolUse", "/tmp");
        input.tool_name = Some("bash".to_string());
        input.tool_input = Some(serde_json::json!({"command": "ls"}));
        input
    }

    #[tokio::test]
    async fn no_handlers_passes_through() {
        let manager = manager_with(vec![]);
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert!(out.continue_execution);
        assert_eq!(out.decision, HookDecision::Continue);
    }

    #[tokio::test]
    async fn handler_reads_stdin_and_env() {
        // The handler echoes the tool name from its environment; the
        // pipeline should surface it as feedback.
        let manager = manager_with(vec![(
            HookEvent::PreToolUse,
            handler("printf '%s' \"$AMCP_TOOL_NAME\""),
        )]);
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert_eq!(out.feedback.as_deref(), Some("bash"));
    }

    #[tokio::test]
    async fn exit_two_denies_with_stderr() {
        let manager = manager_with(vec![(
            HookEvent::PreToolUse,
            handler("echo 'refused by policy' >&2; exit 2"),
        )]);
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert_eq!(out.decision, HookDecision::Deny);
        assert_eq!(out.decision_reason.as_deref(), Some("refused by policy"));
    }

    #[tokio::test]
    async fn json_output_updates_input() {
        let script = r#"printf '{"hookSpecificOutput":{"hookEventName":"PreToolUse","updatedInput":{"command":"ls -la"}}}'"#;
        let manager = manager_with(vec![(HookEvent::PreToolUse, handler(script))]);
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert_eq!(out.updated_input.unwrap()["command"], "ls -la");
    }

    #[tokio::test]
    async fn deny_stops_later_handlers() {
        let manager = manager_with(vec![
            (HookEvent::PreToolUse, handler("exit 2")),
            (HookEvent::PreToolUse, handler("printf 'should not run'")),
        ]);
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert_eq!(out.decision, HookDecision::Deny);
        // Feedback comes only from the denying handler.
        assert_ne!(out.feedback.as_deref(), Some("should not run"));
    }

    #[tokio::test]
    async fn timeout_degrades_open() {
        let mut slow = handler("sleep 5");
        slow.timeout = 1;
        let manager = manager_with(vec![(HookEvent::PreToolUse, slow)]);

        let started = std::time::Instant::now();
        let out = manager
            .execute(HookEvent::PreToolUse, &input(), Some("bash"))
            .await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(out.continue_execution);
        assert_eq!(out.decision, HookDecision::Continue);
    }

    #[tokio::test]
    async fn nonzero_exit_is_non_blocking() {
        let manager = manager_with(vec![(HookEvent::PostToolUse, handler("exit 7"))]);
        let out = manager
            .execute(HookEvent::PostToolUse, &input(), Some("bash"))
            .await;
        assert!(out.continue_execution);
        assert_eq!(out.decision, HookDecision::Continue);
    }
}
