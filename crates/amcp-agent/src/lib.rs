pub mod error;
pub mod executor;
pub mod runtime;

pub use error::AgentError;
pub use executor::{AgentServices, Executor};
pub use runtime::{AgentRuntime, PromptOutcome, PromptRequest};
