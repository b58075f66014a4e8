//! Error types for the execution engine.
//!
//! Each subsystem owns a `thiserror` enum; [`EngineError`] folds them
//! together at the engine boundary.

use std::io;
use thiserror::Error;

use crate::compiler::CompileError;
use crate::script::ScriptError;

use super::dependency::DependencyError;
use super::transport::TransportError;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Compilation failed
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// A generated unit could not be loaded
    #[error("Load error in unit `{unit}`: {source}")]
    Load {
        /// Unit identifier
        unit: String,
        /// Parse failure
        #[source]
        source: ScriptError,
    },

    /// Dependency resolution failed
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unit id not present in the compiled project
    #[error("Unknown unit `{0}`")]
    UnknownUnit(String),

    /// Breakpoint on a flow line with no generated code
    #[error("Line {line} of unit `{unit}` has no generated code")]
    UnmappedLine {
        /// Unit identifier
        unit: String,
        /// Flow line
        line: usize,
    },

    /// Debug command that needs a paused execution
    #[error("Execution is not paused")]
    NotPaused,

    /// Command issued after the execution finished
    #[error("Execution has already finished")]
    Finished,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
