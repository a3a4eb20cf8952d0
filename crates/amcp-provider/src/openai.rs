use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use amcp_types::{Message, Role};

use crate::provider::{
    ChatRequest, ChatStream, Provider, ProviderError, StreamEvent, TurnUsage,
};

/// Streaming client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request.messages.iter().map(wire_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect::<Vec<_>>());
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        body
    }
}

fn wire_message(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = json!({"role": role, "content": message.content});

    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = json!(message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect::<Vec<_>>());
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(tool_call_id);
    }

    wire
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<DeltaToolCall>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: DeltaFunction,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn classify_api_error(status: u16, message: String) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited;
    }
    let lowered = message.to_lowercase();
    if lowered.contains("context length")
        || lowered.contains("maximum context")
        || lowered.contains("context window")
        || lowered.contains("too many tokens")
    {
        return ProviderError::ContextOverflow(message);
    }
    ProviderError::Api { status, message }
}

#[async_trait::async_trait]
impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut http = self.client.post(&url).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status.as_u16(), message));
        }

        // Track tool-call ids by stream index so argument deltas can be
        // correlated after the id was announced.
        let stream = async_stream_events(response);
        Ok(stream)
    }
}

fn async_stream_events(response: reqwest::Response) -> ChatStream {
    let byte_stream = response.bytes_stream();

    let stream = futures::stream::unfold(
        SseState {
            bytes: Box::pin(byte_stream),
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            call_ids: Vec::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        drain_sse_lines(&mut state);
                    }
                    Some(Err(error)) => {
                        state.finished = true;
                        state
                            .pending
                            .push_back(Err(ProviderError::Network(error.to_string())));
                    }
                    None => {
                        state.finished = true;
                        state.pending.push_back(Ok(StreamEvent::Done));
                    }
                }
            }
        },
    );

    stream.boxed()
}

struct SseState {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
    pending: std::collections::VecDeque<Result<StreamEvent, ProviderError>>,
    call_ids: Vec<String>,
    finished: bool,
}

fn drain_sse_lines(state: &mut SseState) {
    while let Some(newline) = state.buffer.find('\n') {
        let line: String = state.buffer.drain(..=newline).collect();
        let line = line.trim();

        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };

        if data == "[DONE]" {
            state.finished = true;
            state.pending.push_back(Ok(StreamEvent::Done));
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::debug!(%error, "skipping unparsable stream chunk");
                continue;
            }
        };

        if let Some(usage) = chunk.usage {
            state.pending.push_back(Ok(StreamEvent::Usage(TurnUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })));
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    state.pending.push_back(Ok(StreamEvent::TextDelta(content)));
                }
            }

            for call in choice.delta.tool_calls {
                if let Some(id) = call.id {
                    while state.call_ids.len() <= call.index {
                        state.call_ids.push(String::new());
                    }
                    state.call_ids[call.index] = id.clone();
                    state.pending.push_back(Ok(StreamEvent::ToolCallStart {
                        id,
                        name: call.function.name.clone().unwrap_or_default(),
                    }));
                }
                if let Some(arguments) = call.function.arguments {
                    if !arguments.is_empty() {
                        let id = state
                            .call_ids
                            .get(call.index)
                            .cloned()
                            .unwrap_or_default();
                        state
                            .pending
                            .push_back(Ok(StreamEvent::ToolCallDelta { id, arguments }));
                    }
                }
            }
        }
    }
}
