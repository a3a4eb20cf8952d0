use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_CONTEXT_WINDOW: u64 = 32_000;

/// Known context windows for models we are likely to be pointed at. The
/// catalog cache, when present, takes precedence.
const BUILTIN_WINDOWS: &[(&str, u64)] = &[
    ("gpt-5.1-codex", 400_000),
    ("gpt-5.2", 400_000),
    ("claude-4.5-sonnet", 200_000),
    ("claude-4.5-opus", 200_000),
    ("gemini-3-pro", 1_048_576),
    ("glm-4.6", 204_800),
    ("glm-4.7", 204_800),
    ("minimax-m2.1", 204_800),
];

/// Optional `cache/models.json` catalog: `{ "<model-id>": { "context": N } }`
/// entries, written by whatever fetches the provider catalog.
#[derive(Debug, Default, Clone)]
pub struct ModelCatalog {
    windows: HashMap<String, u64>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };

        let parsed: Result<HashMap<String, serde_json::Value>, _> = serde_json::from_str(&raw);
        match parsed {
            Ok(entries) => {
                let windows = entries
                    .into_iter()
                    .filter_map(|(model, entry)| {
                        entry
                            .get("context")
                            .and_then(|v| v.as_u64())
                            .map(|context| (model.to_lowercase(), context))
                    })
                    .collect();
                Self { windows }
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "invalid models cache, ignoring");
                Self::default()
            }
        }
    }

    pub fn context_window(&self, model: &str) -> Option<u64> {
        self.windows.get(&model.to_lowercase()).copied()
    }
}

/// Resolve the context window for a model: catalog, then the built-in
/// table (longest-name match first), then family heuristics.
pub fn context_window(model: &str, catalog: &ModelCatalog) -> u64 {
    if let Some(window) = catalog.context_window(model) {
        return window;
    }

    let model_lower = model.to_lowercase();

    let mut known: Vec<&(&str, u64)> = BUILTIN_WINDOWS.iter().collect();
    known.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
    for (name, window) in known {
        if model_lower.contains(name) {
            return *window;
        }
    }

    for (family, window) in [
        ("claude", 200_000),
        ("gemini", 1_000_000),
        ("deepseek", 64_000),
        ("qwen", 128_000),
        ("glm", 128_000),
        ("llama", 128_000),
        ("mistral", 32_000),
        ("mixtral", 32_000),
    ] {
        if model_lower.contains(family) {
            return window;
        }
    }

    if model_lower.contains("gpt-4") {
        return if model_lower.contains("turbo") || model_lower.contains("4o") {
            128_000
        } else {
            8_192
        };
    }

    tracing::debug!(model, "unknown model, using default context window");
    DEFAULT_CONTEXT_WINDOW
}
