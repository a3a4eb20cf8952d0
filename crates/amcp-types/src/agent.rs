use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
}

/// Resolved configuration of one agent. `tools` empty means every registered
/// tool is available; `exclude_tools` is subtracted afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub mode: AgentMode,
    pub description: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub exclude_tools: Vec<String>,
    pub max_steps: u32,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub can_delegate: bool,
}

impl AgentSpec {
    pub fn allows_tool(&self, name: &str) -> bool {
        if self.exclude_tools.iter().any(|t| t == name) {
            return false;
        }
        self.tools.is_empty() || self.tools.iter().any(|t| t == name)
    }

    /// A conservative subagent derived from this spec for `task` delegation.
    pub fn subagent(&self, description: impl Into<String>, tools: Vec<String>) -> Self {
        let mut exclude = self.exclude_tools.clone();
        if !exclude.iter().any(|t| t == "task") {
            exclude.push("task".to_string());
        }
        Self {
            name: format!("{}-subagent", self.name),
            mode: AgentMode::Subagent,
            description: description.into(),
            system_prompt: self.system_prompt.clone(),
            tools,
            exclude_tools: exclude,
            max_steps: self.max_steps,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            can_delegate: false,
        }
    }
}

pub fn default_agent_spec() -> AgentSpec {
    AgentSpec {
        name: "coder".to_string(),
        mode: AgentMode::Primary,
        description: "General-purpose coding agent".to_string(),
        system_prompt: "You are a coding assistant working in {work_dir}. \
                        Use the available tools to inspect and modify the project, \
                        then answer with a final text response."
            .to_string(),
        tools: Vec::new(),
        exclude_tools: Vec::new(),
        max_steps: 25,
        model: String::new(),
        base_url: String::new(),
        can_delegate: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tool_list_allows_everything() {
        let spec = default_agent_spec();
        assert!(spec.allows_tool("bash"));
        assert!(spec.allows_tool("mcp.fs.read"));
    }

    #[test]
    fn exclusions_beat_allowlist() {
        let mut spec = default_agent_spec();
        spec.tools = vec!["bash".into(), "read_file".into()];
        spec.exclude_tools = vec!["bash".into()];
        assert!(!spec.allows_tool("bash"));
        assert!(spec.allows_tool("read_file"));
        assert!(!spec.allows_tool("write_file"));
    }

    #[test]
    fn subagent_cannot_delegate_again() {
        let spec = default_agent_spec();
        let sub = spec.subagent("explore the repo", vec!["read_file".into()]);
        assert_eq!(sub.mode, AgentMode::Subagent);
        assert!(!sub.can_delegate);
        assert!(!sub.allows_tool("task"));
    }
}
