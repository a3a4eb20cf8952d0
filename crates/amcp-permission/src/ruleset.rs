use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Ask,
    Deny,
    Delegate,
}

impl Default for PermissionAction {
    fn default() -> Self {
        Self::Ask
    }
}

/// Session-scoped override applied on top of the rule decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    #[default]
    Normal,
    Yolo,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Tool-name pattern, e.g. `bash`, `mcp.*`.
    pub permission: String,
    /// Argument pattern matched against the tool's match value.
    pub pattern: String,
    pub action: PermissionAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_to: Option<String>,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
            delegate_to: None,
        }
    }

    pub fn matches(&self, permission: &str, value: &str) -> bool {
        glob_match(permission, &self.permission) && glob_match(value, &self.pattern)
    }
}

pub type PermissionRuleset = Vec<PermissionRule>;

/// The `[permissions]` table of `config.toml`. Either a bare action per
/// tool pattern, a `{ action = "delegate", to = "helper" }` table, or a
/// nested pattern → action map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Action(PermissionAction),
    Delegate { action: PermissionAction, to: String },
    Patterns(HashMap<String, PermissionAction>),
}

pub type ConfigPermissions = HashMap<String, ConfigValue>;

pub fn from_config(permissions: &ConfigPermissions) -> PermissionRuleset {
    let mut ruleset = PermissionRuleset::new();

    for (key, value) in permissions {
        match value {
            ConfigValue::Action(action) => {
                ruleset.push(PermissionRule::new(key.clone(), "*", *action));
            }
            ConfigValue::Delegate { action, to } => {
                if *action != PermissionAction::Delegate {
                    tracing::warn!(permission = %key, "malformed delegate rule skipped");
                    continue;
                }
                ruleset.push(PermissionRule {
                    permission: key.clone(),
                    pattern: "*".to_string(),
                    action: PermissionAction::Delegate,
                    delegate_to: Some(to.clone()),
                });
            }
            ConfigValue::Patterns(patterns) => {
                for (pattern, action) in patterns {
                    ruleset.push(PermissionRule::new(key.clone(), pattern.clone(), *action));
                }
            }
        }
    }

    ruleset
}

pub fn merge(layers: &[PermissionRuleset]) -> PermissionRuleset {
    layers.iter().flat_map(|r| r.iter().cloned()).collect()
}

/// Evaluate a request against merged layers. The last matching rule wins;
/// an unmatched request defaults to `ask`.
pub fn evaluate(permission: &str, value: &str, layers: &[PermissionRuleset]) -> PermissionRule {
    let merged = merge(layers);

    merged
        .iter()
        .rev()
        .find(|rule| rule.matches(permission, value))
        .cloned()
        .unwrap_or(PermissionRule::new(
            permission.to_string(),
            "*",
            PermissionAction::Ask,
        ))
}

/// The value a tool request is matched against. Command-like tools match
/// their command line, path tools their path, everything else the JSON of
/// its arguments.
pub fn match_value(tool_name: &str, arguments: &serde_json::Value) -> String {
    let str_arg = |key: &str| {
        arguments
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    match tool_name {
        "bash" => str_arg("command"),
        "read_file" | "write_file" | "edit_file" => str_arg("path"),
        "grep" => str_arg("pattern"),
        "apply_patch" => {
            let patch = str_arg("patch");
            let files = extract_patch_files(&patch);
            if files.is_empty() {
                "*".to_string()
            } else {
                files.join(" ")
            }
        }
        _ => serde_json::to_string(arguments).unwrap_or_default(),
    }
}

fn extract_patch_files(patch: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in patch.lines() {
        let line = line.trim();
        for header in ["*** Add File:", "*** Update File:", "*** Delete File:"] {
            if let Some(rest) = line.strip_prefix(header) {
                files.push(rest.trim().to_string());
            }
        }
        if let Some(rest) = line.strip_prefix("*** Move to:") {
            files.push(rest.trim().to_string());
        }
    }
    files
}

/// Glob matching for permission patterns: `*` matches anything except `/`,
/// `**` crosses separators, `?` is one non-separator character, `[set]`
/// matches a character class. Matching is case-insensitive.
pub fn glob_match(value: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }

    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    regex.push_str(".*");
                    i += 2;
                } else {
                    regex.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j < chars.len() {
                    regex.extend(&chars[i..=j]);
                    i = j + 1;
                } else {
                    regex.push_str(regex::escape("[").as_str());
                    i += 1;
                }
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    regex.push('$');

    match regex::RegexBuilder::new(&regex).case_insensitive(true).build() {
        Ok(re) => re.is_match(value),
        Err(error) => {
            tracing::warn!(pattern, %error, "unparsable permission pattern");
            false
        }
    }
}

/// Built-in defaults: read-only tools allowed, env files protected, every
/// side-effectful tool asks.
pub fn default_ruleset() -> PermissionRuleset {
    vec![
        PermissionRule::new("read_file", "**", PermissionAction::Allow),
        PermissionRule::new("grep", "**", PermissionAction::Allow),
        PermissionRule::new("think", "**", PermissionAction::Allow),
        PermissionRule::new("todo", "**", PermissionAction::Allow),
        PermissionRule::new("read_file", "**.env", PermissionAction::Deny),
        PermissionRule::new("read_file", "**.env.*", PermissionAction::Deny),
        PermissionRule::new("read_file", "**.env.example", PermissionAction::Allow),
        PermissionRule::new("bash", "**", PermissionAction::Ask),
        PermissionRule::new("write_file", "**", PermissionAction::Ask),
        PermissionRule::new("edit_file", "**", PermissionAction::Ask),
        PermissionRule::new("apply_patch", "**", PermissionAction::Ask),
        PermissionRule::new("task", "**", PermissionAction::Ask),
        PermissionRule::new("mcp.*", "**", PermissionAction::Ask),
        PermissionRule::new("external_path", "**", PermissionAction::Ask),
        PermissionRule::new("doom_loop", "**", PermissionAction::Ask),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star_stops_at_separator() {
        assert!(glob_match("src/main.rs", "src/*"));
        assert!(!glob_match("src/amcp/main.rs", "src/*"));
        assert!(glob_match("src/amcp/main.rs", "src/**"));
    }

    #[test]
    fn test_glob_question_and_set() {
        assert!(glob_match("a.rs", "?.rs"));
        assert!(!glob_match("ab.rs", "?.rs"));
        assert!(glob_match("v1", "v[123]"));
        assert!(!glob_match("v4", "v[123]"));
    }

    #[test]
    fn test_glob_case_insensitive() {
        assert!(glob_match("Makefile", "makefile"));
        assert!(glob_match("GIT STATUS", "git status*"));
    }

    #[test]
    fn test_last_match_wins() {
        let layers = vec![
            vec![
                PermissionRule::new("bash", "**", PermissionAction::Ask),
                PermissionRule::new("bash", "git *", PermissionAction::Allow),
            ],
            vec![PermissionRule::new("bash", "git push*", PermissionAction::Deny)],
        ];

        assert_eq!(evaluate("bash", "ls", &layers).action, PermissionAction::Ask);
        assert_eq!(
            evaluate("bash", "git status", &layers).action,
            PermissionAction::Allow
        );
        assert_eq!(
            evaluate("bash", "git push origin", &layers).action,
            PermissionAction::Deny
        );
    }

    #[test]
    fn test_unmatched_defaults_to_ask() {
        let rule = evaluate("webfetch", "https://example.com", &[]);
        assert_eq!(rule.action, PermissionAction::Ask);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let layers = vec![default_ruleset()];
        let first = evaluate("read_file", "src/lib.rs", &layers);
        let second = evaluate("read_file", "src/lib.rs", &layers);
        assert_eq!(first.action, second.action);
        assert_eq!(first.permission, second.permission);
        assert_eq!(first.pattern, second.pattern);
    }

    #[test]
    fn test_default_rules_protect_env_files() {
        let layers = vec![default_ruleset()];
        assert_eq!(
            evaluate("read_file", "deploy/.env", &layers).action,
            PermissionAction::Deny
        );
        assert_eq!(
            evaluate("read_file", ".env.production", &layers).action,
            PermissionAction::Deny
        );
        assert_eq!(
            evaluate("read_file", ".env.example", &layers).action,
            PermissionAction::Allow
        );
        assert_eq!(
            evaluate("read_file", "src/lib.rs", &layers).action,
            PermissionAction::Allow
        );
    }

    #[test]
    fn test_match_value_per_tool() {
        assert_eq!(
            match_value("bash", &serde_json::json!({"command": "git status"})),
            "git status"
        );
        assert_eq!(
            match_value("write_file", &serde_json::json!({"path": "a.txt", "content": "x"})),
            "a.txt"
        );
        let patch = "*** Begin Patch\n*** Update File: src/a.rs\n*** End Patch";
        assert_eq!(
            match_value("apply_patch", &serde_json::json!({"patch": patch})),
            "src/a.rs"
        );
    }

    #[test]
    fn test_from_config_shapes() {
        let toml_src = r#"
            bash = "ask"
            webfetch = { action = "delegate", to = "./check.sh" }

            [read_file]
            "*.secret" = "deny"
        "#;
        let parsed: ConfigPermissions = toml::from_str(toml_src).unwrap();
        let rules = from_config(&parsed);
        assert_eq!(rules.len(), 3);
        let delegate = rules
            .iter()
            .find(|r| r.action == PermissionAction::Delegate)
            .unwrap();
        assert_eq!(delegate.delegate_to.as_deref(), Some("./check.sh"));
    }
}
