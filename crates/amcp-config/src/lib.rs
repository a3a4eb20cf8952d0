use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use amcp_permission::{ConfigPermissions, PermissionRuleset};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Process config root: `$AMCP_CONFIG_DIR` override, else
/// `<user-config>/amcp/`.
pub fn config_root() -> PathBuf {
    if let Ok(path) = std::env::var("AMCP_CONFIG_DIR") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("amcp")
}

/// Project-scoped config directory under the working directory.
pub fn project_config_dir(cwd: &Path) -> PathBuf {
    cwd.join(".amcp")
}

pub fn sessions_dir() -> PathBuf {
    config_root().join("sessions")
}

pub fn models_cache_path() -> PathBuf {
    config_root().join("cache").join("models.json")
}

/// Chat/provider settings from the `[chat]` table of `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub tool_loop_limit: Option<u32>,
    pub default_max_lines: Option<usize>,
    pub mcp_tools_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompactionSettings {
    pub strategy: Option<String>,
    pub threshold_ratio: Option<f64>,
    pub target_ratio: Option<f64>,
    pub preserve_last: Option<usize>,
    pub max_tool_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub permissions: ConfigPermissions,
}

impl Config {
    pub fn permission_rules(&self) -> PermissionRuleset {
        amcp_permission::from_config(&self.permissions)
    }
}

/// Load `config.toml` from one directory, tolerating a missing file.
pub fn load_config_file(dir: &Path) -> Result<Config, ConfigError> {
    let path = dir.join("config.toml");
    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path,
        message: e.to_string(),
    })
}

/// User config from the config root plus project overrides from
/// `<cwd>/.amcp/`. Project values win field-by-field; permission rules are
/// kept as separate layers so the project layer merges after the user layer.
pub fn load_config(cwd: &Path) -> (Config, PermissionRuleset, PermissionRuleset) {
    let user = load_config_file(&config_root()).unwrap_or_else(|error| {
        tracing::warn!(%error, "user config unreadable, using defaults");
        Config::default()
    });
    let project = load_config_file(&project_config_dir(cwd)).unwrap_or_else(|error| {
        tracing::warn!(%error, "project config unreadable, ignoring");
        Config::default()
    });

    let user_rules = user.permission_rules();
    let project_rules = project.permission_rules();

    let merged = Config {
        chat: ChatConfig {
            base_url: project.chat.base_url.or(user.chat.base_url),
            model: project.chat.model.or(user.chat.model),
            api_key: project.chat.api_key.or(user.chat.api_key),
            tool_loop_limit: project.chat.tool_loop_limit.or(user.chat.tool_loop_limit),
            default_max_lines: project
                .chat
                .default_max_lines
                .or(user.chat.default_max_lines),
            mcp_tools_enabled: project
                .chat
                .mcp_tools_enabled
                .or(user.chat.mcp_tools_enabled),
        },
        compaction: CompactionSettings {
            strategy: project.compaction.strategy.or(user.compaction.strategy),
            threshold_ratio: project
                .compaction
                .threshold_ratio
                .or(user.compaction.threshold_ratio),
            target_ratio: project
                .compaction
                .target_ratio
                .or(user.compaction.target_ratio),
            preserve_last: project
                .compaction
                .preserve_last
                .or(user.compaction.preserve_last),
            max_tool_results: project
                .compaction
                .max_tool_results
                .or(user.compaction.max_tool_results),
        },
        permissions: Default::default(),
    };

    (merged, user_rules, project_rules)
}

/// Bind/serve settings from `server.yaml` in the config root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    pub work_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4096
}

fn default_max_sessions() -> usize {
    100
}

fn default_agent() -> String {
    "coder".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_sessions: default_max_sessions(),
            default_agent: default_agent(),
            shutdown_grace_secs: default_shutdown_grace(),
            work_dir: None,
        }
    }
}

pub fn load_server_config() -> ServerConfig {
    let path = config_root().join("server.yaml");
    if !path.exists() {
        return ServerConfig::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_else(|error| {
            tracing::warn!(path = %path.display(), %error, "invalid server.yaml, using defaults");
            ServerConfig::default()
        }),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "unreadable server.yaml, using defaults");
            ServerConfig::default()
        }
    }
}
