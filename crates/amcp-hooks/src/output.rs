use serde::{Deserialize, Serialize};

/// The JSON document handlers receive on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInput {
    pub session_id: String,
    pub hook_event_name: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl HookInput {
    pub fn new(
        session_id: impl Into<String>,
        event_name: impl Into<String>,
        cwd: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            hook_event_name: event_name.into(),
            cwd: cwd.into(),
            tool_name: None,
            tool_input: None,
            tool_response: None,
            tool_use_id: None,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    #[default]
    Continue,
    Allow,
    Ask,
    Deny,
}

/// Combined result of one or more handlers.
#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    pub continue_execution: bool,
    pub stop_reason: Option<String>,
    pub decision: HookDecision,
    pub decision_reason: Option<String>,
    pub updated_input: Option<serde_json::Value>,
    pub updated_response: Option<serde_json::Value>,
    pub feedback: Option<String>,
    pub system_message: Option<String>,
    pub suppress_output: bool,
}

impl HookOutput {
    pub fn passthrough() -> Self {
        Self {
            continue_execution: true,
            ..Default::default()
        }
    }

    /// Interpret a finished handler process.
    pub fn from_exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        let mut output = Self::passthrough();

        match exit_code {
            0 => {
                let trimmed = stdout.trim();
                if trimmed.is_empty() {
                    return output;
                }
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(json) => output.apply_json(&json),
                    Err(_) => output.feedback = Some(trimmed.to_string()),
                }
            }
            2 => {
                let reason = {
                    let trimmed = stderr.trim();
                    if trimmed.is_empty() {
                        "hook returned blocking error".to_string()
                    } else {
                        trimmed.to_string()
                    }
                };
                output.decision = HookDecision::Deny;
                output.decision_reason = Some(reason.clone());
                output.feedback = Some(reason);
            }
            code => {
                tracing::warn!(code, stderr = stderr.trim(), "hook exited with non-blocking error");
            }
        }

        output
    }

    fn apply_json(&mut self, data: &serde_json::Value) {
        if let Some(cont) = data.get("continue").and_then(|v| v.as_bool()) {
            self.continue_execution = cont;
        }
        if let Some(reason) = data.get("stopReason").and_then(|v| v.as_str()) {
            self.stop_reason = Some(reason.to_string());
        }
        if let Some(suppress) = data.get("suppressOutput").and_then(|v| v.as_bool()) {
            self.suppress_output = suppress;
        }
        if let Some(message) = data.get("systemMessage").and_then(|v| v.as_str()) {
            self.system_message = Some(message.to_string());
        }
        if let Some(feedback) = data.get("feedback").and_then(|v| v.as_str()) {
            self.feedback = Some(feedback.to_string());
        }

        let Some(specific) = data.get("hookSpecificOutput") else {
            return;
        };

        if let Some(decision) = specific.get("permissionDecision").and_then(|v| v.as_str()) {
            self.decision = match decision.to_ascii_lowercase().as_str() {
                "allow" => HookDecision::Allow,
                "deny" => HookDecision::Deny,
                "ask" => HookDecision::Ask,
                _ => HookDecision::Continue,
            };
        }
        if let Some(reason) = specific
            .get("permissionDecisionReason")
            .and_then(|v| v.as_str())
        {
            self.decision_reason = Some(reason.to_string());
        }
        if let Some(updated) = specific.get("updatedInput") {
            self.updated_input = Some(updated.clone());
        }
        if let Some(updated) = specific.get("updatedResponse") {
            self.updated_response = Some(updated.clone());
        }
    }

    /// Fold a later handler's output into this one. Later handlers override
    /// earlier ones except feedback, which accumulates.
    pub fn merge(&mut self, other: HookOutput) {
        if let Some(feedback) = other.feedback {
            self.feedback = match self.feedback.take() {
                Some(existing) => Some(format!("{existing}\n{feedback}")),
                None => Some(feedback),
            };
        }
        if other.system_message.is_some() {
            self.system_message = other.system_message;
        }
        if other.updated_input.is_some() {
            self.updated_input = other.updated_input;
        }
        if other.updated_response.is_some() {
            self.updated_response = other.updated_response;
        }
        if other.decision != HookDecision::Continue {
            self.decision = other.decision;
            self.decision_reason = other.decision_reason;
        }
        if !other.continue_execution {
            self.continue_execution = false;
            self.stop_reason = other.stop_reason;
        }
        if other.suppress_output {
            self.suppress_output = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_empty_is_passthrough() {
        let out = HookOutput::from_exit(0, "", "");
        assert!(out.continue_execution);
        assert_eq!(out.decision, HookDecision::Continue);
        assert!(out.feedback.is_none());
    }

    #[test]
    fn exit_zero_plain_text_becomes_feedback() {
        let out = HookOutput::from_exit(0, "looks fine\n", "");
        assert_eq!(out.feedback.as_deref(), Some("looks fine"));
    }

    #[test]
    fn exit_zero_json_fields() {
        let stdout = r#"{
            "continue": false,
            "stopReason": "not today",
            "systemMessage": "blocked",
            "hookSpecificOutput": {
                "hookEventName": "PreToolUse",
                "permissionDecision": "deny",
                "permissionDecisionReason": "dangerous",
                "updatedInput": {"command": "ls"}
            }
        }"#;
        let out = HookOutput::from_exit(0, stdout, "");
        assert!(!out.continue_execution);
        assert_eq!(out.stop_reason.as_deref(), Some("not today"));
        assert_eq!(out.decision, HookDecision::Deny);
        assert_eq!(out.decision_reason.as_deref(), Some("dangerous"));
        assert_eq!(out.updated_input.unwrap()["command"], "ls");
    }

    #[test]
    fn exit_two_is_blocking_deny() {
        let out = HookOutput::from_exit(2, "", "rm of / refused");
        assert_eq!(out.decision, HookDecision::Deny);
        assert_eq!(out.decision_reason.as_deref(), Some("rm of / refused"));
    }

    #[test]
    fn other_exit_codes_are_non_blocking() {
        let out = HookOutput::from_exit(1, "", "boom");
        assert!(out.continue_execution);
        assert_eq!(out.decision, HookDecision::Continue);
    }

    #[test]
    fn merge_accumulates_feedback_and_overrides_decision() {
        let mut combined = HookOutput::passthrough();
        combined.merge(HookOutput::from_exit(0, "first", ""));
        combined.merge(HookOutput::from_exit(0, "second", ""));
        assert_eq!(combined.feedback.as_deref(), Some("first\nsecond"));

        combined.merge(HookOutput::from_exit(2, "", "no"));
        assert_eq!(combined.decision, HookDecision::Deny);
    }
}
