pub mod openai;
pub mod provider;
pub mod retry;
pub mod scripted;

pub use openai::OpenAiCompatProvider;
pub use provider::{
    ChatRequest, ChatStream, Provider, ProviderError, ProviderToolDef, StreamEvent, TurnUsage,
};
pub use retry::{with_retry, RetryConfig};
pub use scripted::{ScriptedProvider, ScriptedTurn};
