use amcp_types::{Message, Role};
use async_trait::async_trait;

use crate::estimate::{estimate_message, estimate_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    Summary,
    Truncate,
    SlidingWindow,
    Hybrid,
}

impl CompactionStrategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "summary" => Some(Self::Summary),
            "truncate" => Some(Self::Truncate),
            "sliding_window" => Some(Self::SlidingWindow),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Truncate => "truncate",
            Self::SlidingWindow => "sliding_window",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategy,
    /// Compact once usage exceeds this share of the usable window.
    pub threshold_ratio: f64,
    /// Aim for this share of the usable window after compaction.
    pub target_ratio: f64,
    /// Recent user/assistant messages preserved verbatim.
    pub preserve_last: usize,
    /// Recent tool results preserved in addition to the exchanges.
    pub max_tool_results: usize,
    pub min_tokens_to_compact: u64,
    /// Share of the window held back for the next response.
    pub safety_margin: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Summary,
            threshold_ratio: 0.7,
            target_ratio: 0.3,
            preserve_last: 6,
            max_tool_results: 10,
            min_tokens_to_compact: 5_000,
            safety_margin: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub original_tokens: u64,
    pub compacted_tokens: u64,
    pub messages_removed: usize,
    pub messages_preserved: usize,
    pub strategy: CompactionStrategy,
    pub summary: Option<String>,
}

/// The model sub-call seam. The agent supplies an implementation backed by
/// its provider; tests supply scripted ones.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, max_tokens: u64) -> anyhow::Result<String>;
}

const COMPACT_PROMPT: &str = r#"You are compacting a coding conversation so the work can continue in less context.

Rules:
- MUST KEEP: error messages, working solutions, current task state, file paths
- MERGE similar discussions into a single summary
- REMOVE redundant explanations and failed attempts (keep lessons learned)
- CONDENSE long file content to signatures and key structure

Input context ({token_count} tokens):

{context}

Output a concise summary (aim for {target_tokens} tokens) in this structure:

<current_task>
[what is being worked on now, specific files and goals]
</current_task>

<completed>
- [task]: [outcome and key changes]
</completed>

<code_state>
[key files and their current state]
</code_state>

<important>
[errors, decisions, constraints, blockers]
</important>
"#;

pub struct Compactor {
    config: CompactionConfig,
    context_window: u64,
    threshold_tokens: u64,
    target_tokens: u64,
}

impl Compactor {
    pub fn new(context_window: u64, config: CompactionConfig) -> Self {
        let available = (context_window as f64 * (1.0 - config.safety_margin)) as u64;
        let threshold_tokens = (available as f64 * config.threshold_ratio) as u64;
        let target_tokens =
            ((available as f64 * config.target_ratio) as u64).max(config.min_tokens_to_compact);

        Self {
            config,
            context_window,
            threshold_tokens,
            target_tokens,
        }
    }

    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    pub fn threshold_tokens(&self) -> u64 {
        self.threshold_tokens
    }

    pub fn target_tokens(&self) -> u64 {
        self.target_tokens
    }

    pub fn should_compact(&self, messages: &[Message]) -> bool {
        let current = estimate_tokens(messages);
        if current < self.config.min_tokens_to_compact {
            return false;
        }
        current > self.threshold_tokens
    }

    /// Rewrite `messages` according to the configured strategy. The last
    /// `preserve_last` user/assistant messages (and their adjacent tool
    /// results) survive verbatim; history is never left empty; a tool result
    /// is never separated from the assistant call that produced it.
    pub async fn compact(
        &self,
        messages: &[Message],
        summarizer: &dyn Summarizer,
    ) -> (Vec<Message>, CompactionResult) {
        let original_tokens = estimate_tokens(messages);

        if messages.len() <= 1 {
            let result = CompactionResult {
                original_tokens,
                compacted_tokens: original_tokens,
                messages_removed: 0,
                messages_preserved: messages.len(),
                strategy: self.config.strategy,
                summary: None,
            };
            return (messages.to_vec(), result);
        }

        let split = self.split_point(messages);
        let (to_compact, to_preserve) = messages.split_at(split);

        if to_compact.is_empty() {
            let result = CompactionResult {
                original_tokens,
                compacted_tokens: original_tokens,
                messages_removed: 0,
                messages_preserved: messages.len(),
                strategy: self.config.strategy,
                summary: None,
            };
            return (messages.to_vec(), result);
        }

        let preserved_tokens = estimate_tokens(to_preserve);
        // Reserve room for the marker/summary message itself.
        let budget = self
            .target_tokens
            .saturating_sub(preserved_tokens)
            .saturating_sub(32);

        let (mut prefix, summary) = match self.config.strategy {
            CompactionStrategy::Summary => match self.summarize(to_compact, summarizer).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(%error, "summary compaction failed, falling back to hybrid");
                    self.hybrid(to_compact, budget, summarizer).await
                }
            },
            CompactionStrategy::Truncate => self.truncate(to_compact),
            CompactionStrategy::SlidingWindow => self.sliding_window(to_compact, budget),
            CompactionStrategy::Hybrid => self.hybrid(to_compact, budget, summarizer).await,
        };

        // The prefix must not end in an assistant turn whose tool results
        // were dropped.
        drop_dangling_tool_edges(&mut prefix);

        let mut compacted: Vec<Message> = prefix;
        compacted.extend_from_slice(to_preserve);
        if compacted.is_empty() {
            compacted.push(Message::system("[conversation history compacted]"));
        }

        let compacted_tokens = estimate_tokens(&compacted);
        let result = CompactionResult {
            original_tokens,
            compacted_tokens,
            messages_removed: to_compact.len(),
            messages_preserved: compacted.len(),
            strategy: self.config.strategy,
            summary,
        };

        tracing::info!(
            original = original_tokens,
            compacted = compacted_tokens,
            removed = result.messages_removed,
            strategy = result.strategy.as_str(),
            "history compacted"
        );

        (compacted, result)
    }

    /// Index of the first preserved message. Walks back `preserve_last`
    /// user/assistant messages, extends over up to `max_tool_results`
    /// adjacent tool results, then retreats past any tool-result run so the
    /// preserved suffix starts at (or after) the assistant that issued it.
    fn split_point(&self, messages: &[Message]) -> usize {
        let mut preserve_idx = messages.len();
        let mut exchanges = 0;

        for (i, message) in messages.iter().enumerate().rev() {
            if message.is_exchange() {
                exchanges += 1;
                if exchanges >= self.config.preserve_last {
                    preserve_idx = i;
                    break;
                }
            }
        }

        if preserve_idx == messages.len() && exchanges < self.config.preserve_last {
            // Short history: everything is preserved.
            return 0;
        }

        let mut tool_results = 0;
        while preserve_idx > 0
            && messages[preserve_idx - 1].role == Role::Tool
            && tool_results < self.config.max_tool_results
        {
            preserve_idx -= 1;
            tool_results += 1;
        }

        while preserve_idx > 0 && messages[preserve_idx].role == Role::Tool {
            preserve_idx -= 1;
        }

        preserve_idx
    }

    async fn summarize(
        &self,
        to_compact: &[Message],
        summarizer: &dyn Summarizer,
    ) -> anyhow::Result<(Vec<Message>, Option<String>)> {
        let context = messages_to_text(to_compact);
        let prompt = COMPACT_PROMPT
            .replace("{token_count}", &estimate_tokens(to_compact).to_string())
            .replace("{target_tokens}", &self.target_tokens.to_string())
            .replace("{context}", &context);

        let max_tokens = self.target_tokens.min(4_000);
        let summary = summarizer.summarize(&prompt, max_tokens).await?;

        let prefix = vec![Message::system(format!(
            "[Previous context compacted - {} messages summarized]\n\n{}",
            to_compact.len(),
            summary
        ))];
        Ok((prefix, Some(summary)))
    }

    fn truncate(&self, to_compact: &[Message]) -> (Vec<Message>, Option<String>) {
        let mut prefix = Vec::new();
        if let Some(first) = to_compact.first() {
            if first.role == Role::System {
                prefix.push(first.clone());
            }
        }
        let removed = to_compact.len() - prefix.len();
        let marker = format!("[... {removed} messages truncated ...]");
        prefix.push(Message::system(marker.clone()));
        (prefix, Some(marker))
    }

    fn sliding_window(&self, to_compact: &[Message], budget: u64) -> (Vec<Message>, Option<String>) {
        let mut kept: Vec<Message> = Vec::new();
        let mut total = 0u64;

        for message in to_compact.iter().rev() {
            let tokens = estimate_message(message);
            if total + tokens > budget {
                break;
            }
            kept.insert(0, message.clone());
            total += tokens;
        }

        // Never start the window on an orphaned tool result.
        while kept.first().is_some_and(|m| m.role == Role::Tool) {
            kept.remove(0);
        }

        let removed = to_compact.len() - kept.len();
        if removed == 0 {
            return (kept, None);
        }
        let marker = format!("[... {removed} older messages removed ...]");
        kept.insert(0, Message::system(marker.clone()));
        (kept, Some(marker))
    }

    async fn hybrid(
        &self,
        to_compact: &[Message],
        budget: u64,
        summarizer: &dyn Summarizer,
    ) -> (Vec<Message>, Option<String>) {
        let (mut kept, _) = self.sliding_window(to_compact, budget / 2);
        // Drop the marker; the summary replaces it.
        if kept
            .first()
            .is_some_and(|m| m.role == Role::System && m.content.starts_with("[..."))
        {
            kept.remove(0);
        }

        let removed = &to_compact[..to_compact.len() - kept.len()];
        if removed.is_empty() {
            return (kept, None);
        }

        let context: String = messages_to_text(removed).chars().take(10_000).collect();
        let prompt = format!(
            "Summarize this conversation context in two or three short paragraphs:\n\n{context}"
        );
        let summary = match summarizer.summarize(&prompt, 500).await {
            Ok(summary) => summary,
            Err(error) => {
                tracing::warn!(%error, "hybrid summary failed, using marker");
                format!("[{} older messages summarized]", removed.len())
            }
        };

        let mut prefix = vec![Message::system(format!("[Earlier context summary]\n{summary}"))];
        prefix.append(&mut kept);
        (prefix, Some(summary))
    }
}

fn drop_dangling_tool_edges(prefix: &mut Vec<Message>) {
    while prefix
        .last()
        .is_some_and(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
    {
        prefix.pop();
    }
    while prefix.first().is_some_and(|m| m.role == Role::Tool) {
        prefix.remove(0);
    }
}

fn messages_to_text(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        if !message.content.trim().is_empty() {
            parts.push(format!("## Message {} ({role})\n{}", i + 1, message.content));
        }
        for call in &message.tool_calls {
            let args: String = call.arguments.to_string().chars().take(500).collect();
            parts.push(format!("[Tool call: {}]\nArgs: {args}", call.name));
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::ToolCall;

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _prompt: &str, _max_tokens: u64) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _prompt: &str, _max_tokens: u64) -> anyhow::Result<String> {
            anyhow::bail!("model unavailable")
        }
    }

    fn config(strategy: CompactionStrategy) -> CompactionConfig {
        CompactionConfig {
            strategy,
            min_tokens_to_compact: 0,
            ..Default::default()
        }
    }

    fn long_history(pairs: usize) -> Vec<Message> {
        let mut history = vec![Message::system("you are a coding assistant")];
        for i in 0..pairs {
            history.push(Message::user(format!("request {i}: {}", "x".repeat(400))));
            history.push(Message::assistant(format!("response {i}: {}", "y".repeat(400))));
        }
        history
    }

    fn history_with_tool_run() -> Vec<Message> {
        let mut history = long_history(8);
        history.push(Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_ls".into(),
                name: "bash".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        ));
        history.push(Message::tool_result("call_ls", "Cargo.toml\nsrc"));
        for i in 0..4 {
            history.push(Message::user(format!("follow-up {i}")));
            history.push(Message::assistant(format!("answer {i}")));
        }
        history
    }

    #[test]
    fn threshold_scales_with_window() {
        let compactor = Compactor::new(100_000, CompactionConfig::default());
        assert_eq!(compactor.threshold_tokens(), 63_000);
        assert_eq!(compactor.target_tokens(), 27_000);
    }

    #[test]
    fn tiny_histories_never_compact() {
        let compactor = Compactor::new(32_000, CompactionConfig::default());
        assert!(!compactor.should_compact(&[Message::user("hello")]));
    }

    #[tokio::test]
    async fn one_message_history_is_a_noop() {
        let compactor = Compactor::new(1_000, config(CompactionStrategy::Truncate));
        let history = vec![Message::user("hi")];
        let (compacted, result) = compactor.compact(&history, &FixedSummarizer("s")).await;
        assert_eq!(compacted.len(), 1);
        assert_eq!(result.messages_removed, 0);
    }

    #[tokio::test]
    async fn preserves_last_exchanges_verbatim() {
        let compactor = Compactor::new(4_000, config(CompactionStrategy::Truncate));
        let history = long_history(12);
        let (compacted, result) = compactor.compact(&history, &FixedSummarizer("s")).await;

        assert!(result.messages_removed > 0);
        let preserved: Vec<&Message> =
            compacted.iter().filter(|m| m.is_exchange()).collect();
        let original: Vec<&Message> =
            history.iter().filter(|m| m.is_exchange()).collect();
        let tail = &original[original.len() - 6..];
        let kept_tail = &preserved[preserved.len() - 6..];
        for (kept, orig) in kept_tail.iter().zip(tail.iter()) {
            assert_eq!(kept.content, orig.content);
        }
    }

    #[tokio::test]
    async fn summary_strategy_produces_system_prefix() {
        let compactor = Compactor::new(4_000, config(CompactionStrategy::Summary));
        let history = long_history(12);
        let (compacted, result) = compactor
            .compact(&history, &FixedSummarizer("<current_task>work</current_task>"))
            .await;

        assert_eq!(compacted[0].role, Role::System);
        assert!(compacted[0].content.contains("<current_task>"));
        assert!(result.summary.is_some());
    }

    #[tokio::test]
    async fn summary_failure_falls_back_to_hybrid() {
        let compactor = Compactor::new(4_000, config(CompactionStrategy::Summary));
        let history = long_history(12);
        let (compacted, result) = compactor.compact(&history, &FailingSummarizer).await;

        assert!(!compacted.is_empty());
        assert!(result.compacted_tokens < result.original_tokens);
    }

    #[tokio::test]
    async fn sliding_window_hits_target() {
        let compactor = Compactor::new(4_000, config(CompactionStrategy::SlidingWindow));
        let history = long_history(40);
        let (compacted, result) = compactor.compact(&history, &FixedSummarizer("s")).await;

        assert!(result.compacted_tokens <= compactor.target_tokens());
        assert!(!compacted.is_empty());
    }

    #[tokio::test]
    async fn tool_results_stay_with_their_calls() {
        let mut cfg = config(CompactionStrategy::Truncate);
        cfg.preserve_last = 9;
        let compactor = Compactor::new(2_000, cfg);
        let history = history_with_tool_run();
        let (compacted, _) = compactor.compact(&history, &FixedSummarizer("s")).await;

        for (i, message) in compacted.iter().enumerate() {
            if message.role == Role::Tool {
                let call_id = message.tool_call_id.as_deref().unwrap();
                let has_call = compacted[..i].iter().any(|m| {
                    m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == call_id)
                });
                assert!(has_call, "tool result {call_id} lost its call");
            }
        }
    }

    #[tokio::test]
    async fn compaction_never_leaves_history_empty() {
        let mut cfg = config(CompactionStrategy::SlidingWindow);
        cfg.preserve_last = 0;
        let compactor = Compactor::new(100, cfg);
        let history = long_history(5);
        let (compacted, _) = compactor.compact(&history, &FixedSummarizer("s")).await;
        assert!(!compacted.is_empty());
    }
}
