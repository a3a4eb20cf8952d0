//! External hook pipeline. Hooks are user-configured programs invoked at
//! fixed lifecycle points; they receive a JSON document on stdin and speak
//! back through their exit code and stdout. The contract:
//!
//! - exit 0, empty stdout: no change
//! - exit 0, JSON stdout: parsed for `continue`, `stopReason`, `feedback`,
//!   `systemMessage` and `hookSpecificOutput`
//! - exit 0, other stdout: used as feedback text
//! - exit 2: blocking error; stderr becomes the denial reason
//! - anything else: non-blocking error, logged

pub mod config;
pub mod output;
pub mod pipeline;

pub use config::{HookEvent, HookHandler, HooksConfig};
pub use output::{HookDecision, HookInput, HookOutput};
pub use pipeline::HooksManager;
