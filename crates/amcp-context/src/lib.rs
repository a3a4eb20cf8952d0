pub mod compactor;
pub mod estimate;
pub mod models;

pub use compactor::{
    CompactionConfig, CompactionResult, CompactionStrategy, Compactor, Summarizer,
};
pub use estimate::estimate_tokens;
pub use models::context_window;
