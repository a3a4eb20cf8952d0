use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    SessionStart,
    SessionEnd,
    Stop,
    PreCompact,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::Stop => "Stop",
            HookEvent::PreCompact => "PreCompact",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "PreToolUse" => Some(Self::PreToolUse),
            "PostToolUse" => Some(Self::PostToolUse),
            "UserPromptSubmit" => Some(Self::UserPromptSubmit),
            "SessionStart" => Some(Self::SessionStart),
            "SessionEnd" => Some(Self::SessionEnd),
            "Stop" => Some(Self::Stop),
            "PreCompact" => Some(Self::PreCompact),
            _ => None,
        }
    }
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookHandler {
    #[serde(default = "default_matcher")]
    pub matcher: String,
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_matcher() -> String {
    "*".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

impl HookHandler {
    /// Does this handler apply to the given tool? The matcher is a name
    /// regex (anchored), with `*` and the empty string matching everything.
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        if self.matcher.is_empty() || self.matcher == "*" {
            return true;
        }
        let Some(tool_name) = tool_name else {
            return false;
        };

        match regex::Regex::new(&format!("^(?:{})$", self.matcher)) {
            Ok(re) => re.is_match(tool_name),
            Err(_) => self.matcher == tool_name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HooksConfig {
    pub handlers: HashMap<HookEvent, Vec<HookHandler>>,
}

#[derive(Debug, Deserialize)]
struct HooksFile {
    #[serde(default)]
    hooks: HashMap<String, EventSection>,
}

#[derive(Debug, Deserialize)]
struct EventSection {
    #[serde(default)]
    handlers: Vec<HookHandler>,
}

impl HooksConfig {
    /// Merge another config after this one; later handlers run later.
    pub fn extend(&mut self, other: HooksConfig) {
        for (event, handlers) in other.handlers {
            self.handlers.entry(event).or_default().extend(handlers);
        }
    }

    pub fn from_toml(raw: &str, project_dir: &Path) -> Result<Self, toml::de::Error> {
        let file: HooksFile = toml::from_str(raw)?;
        Ok(Self::from_file(file, project_dir))
    }

    pub fn from_json(raw: &str, project_dir: &Path) -> Result<Self, serde_json::Error> {
        let file: HooksFile = serde_json::from_str(raw)?;
        Ok(Self::from_file(file, project_dir))
    }

    fn from_file(file: HooksFile, project_dir: &Path) -> Self {
        let mut config = HooksConfig::default();
        for (name, section) in file.hooks {
            let Some(event) = HookEvent::parse(&name) else {
                tracing::warn!(event = %name, "unknown hook event in config");
                continue;
            };
            let handlers = section
                .handlers
                .into_iter()
                .map(|mut handler| {
                    handler.command = handler
                        .command
                        .replace("$AMCP_PROJECT_DIR", &project_dir.to_string_lossy());
                    handler
                })
                .collect::<Vec<_>>();
            config.handlers.entry(event).or_default().extend(handlers);
        }
        config
    }

    /// User config (`<root>/hooks.toml`) then project config
    /// (`<cwd>/.amcp/hooks.toml`, `<cwd>/.amcp/hooks.json`), project last.
    pub fn load(project_dir: &Path) -> Self {
        let mut config = HooksConfig::default();

        let user_path = amcp_config::config_root().join("hooks.toml");
        if let Ok(raw) = std::fs::read_to_string(&user_path) {
            match Self::from_toml(&raw, project_dir) {
                Ok(parsed) => config.extend(parsed),
                Err(error) => {
                    tracing::warn!(path = %user_path.display(), %error, "invalid hooks.toml")
                }
            }
        }

        let project_toml = amcp_config::project_config_dir(project_dir).join("hooks.toml");
        if let Ok(raw) = std::fs::read_to_string(&project_toml) {
            match Self::from_toml(&raw, project_dir) {
                Ok(parsed) => config.extend(parsed),
                Err(error) => {
                    tracing::warn!(path = %project_toml.display(), %error, "invalid hooks.toml")
                }
            }
        }

        let project_json = amcp_config::project_config_dir(project_dir).join("hooks.json");
        if let Ok(raw) = std::fs::read_to_string(&project_json) {
            match Self::from_json(&raw, project_dir) {
                Ok(parsed) => config.extend(parsed),
                Err(error) => {
                    tracing::warn!(path = %project_json.display(), %error, "invalid hooks.json")
                }
            }
        }

        config
    }

    pub fn handlers_for(&self, event: HookEvent, tool_name: Option<&str>) -> Vec<&HookHandler> {
        self.handlers
            .get(&event)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|h| h.enabled && h.matches(tool_name))
                    .collect()
            })
            .unwrap_or_default()
    }
}
