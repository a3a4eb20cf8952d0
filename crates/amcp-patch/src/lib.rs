//! Context-anchored multi-file patch engine.
//!
//! The wire format is framed by `*** Begin Patch` / `*** End Patch` and
//! contains `Add File`, `Delete File` and `Update File` operations. Update
//! hunks locate their position through `@@ ` anchor lines followed by
//! context (` `), delete (`-`) and insert (`+`) lines. Application is
//! staged: nothing is written until every hunk of every operation has
//! validated against the filesystem.

pub mod apply;
pub mod parser;

pub use apply::{apply, stage, FileOutcome, StagedOp};
pub use parser::{parse, render, FileOp, Hunk, HunkLine, LineKind, Patch};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch parse error: {0}")]
    Parse(String),

    #[error("failed to apply patch to {path}: {message}")]
    Apply {
        path: String,
        message: String,
        /// The first few lines the engine was looking for, for the model to
        /// correct its context.
        searched: Vec<String>,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
