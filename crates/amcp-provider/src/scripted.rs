use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;

use amcp_types::ToolCall;

use crate::provider::{
    ChatRequest, ChatStream, Provider, ProviderError, StreamEvent, TurnUsage,
};

/// One scripted assistant turn: text chunks, then tool calls.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, id: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: args,
            }],
        }
    }
}

/// Deterministic provider for tests: pops one scripted turn per call and
/// streams it the way a real backend would (word-sized text deltas, a
/// start/delta pair per tool call, usage, done). Errors can be injected
/// ahead of turns to exercise the retry path.
pub struct ScriptedProvider {
    turns: Arc<Mutex<Vec<ScriptedTurn>>>,
    errors: Arc<Mutex<Vec<ProviderError>>>,
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
            errors: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `chat_stream` calls with these errors, in order,
    /// before serving scripted turns.
    pub fn with_errors(self, errors: Vec<ProviderError>) -> Self {
        *self.errors.try_lock().unwrap() = errors;
        self
    }

    pub async fn remaining_turns(&self) -> usize {
        self.turns.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        self.requests.lock().await.push(request);

        {
            let mut errors = self.errors.lock().await;
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        let turn = {
            let mut turns = self.turns.lock().await;
            if turns.is_empty() {
                ScriptedTurn::text("(script exhausted)")
            } else {
                turns.remove(0)
            }
        };

        let mut events: Vec<Result<StreamEvent, ProviderError>> = Vec::new();
        let mut completion_tokens = 0;

        for word in split_chunks(&turn.text) {
            completion_tokens += 1;
            events.push(Ok(StreamEvent::TextDelta(word)));
        }
        for call in &turn.tool_calls {
            events.push(Ok(StreamEvent::ToolCallStart {
                id: call.id.clone(),
                name: call.name.clone(),
            }));
            events.push(Ok(StreamEvent::ToolCallDelta {
                id: call.id.clone(),
                arguments: call.arguments.to_string(),
            }));
        }
        events.push(Ok(StreamEvent::Usage(TurnUsage {
            prompt_tokens: 10,
            completion_tokens: completion_tokens.max(1),
        })));
        events.push(Ok(StreamEvent::Done));

        Ok(futures::stream::iter(events).boxed())
    }
}

fn split_chunks(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let words: Vec<&str> = text.split_inclusive(' ').collect();
    words.into_iter().map(str::to_string).collect()
}
