//! Weft – a compiler and stepping runtime for visual automation flows
//!
//! This crate turns step-list flows into small indented programs and runs them:
//! - Flow JSON is lexed, parsed and checked, then lowered to generated code
//! - A line map ties every generated line back to the step it came from
//! - The engine runs generated code with breakpoints, stepping and force-stop
//! - Atomic operations are delegated to a backend, local or over a transport
//! - Progress is published through a bounded, non-blocking report sink

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Flow compiler: tokens, AST, code generation and line maps
pub mod compiler;

/// Execution engine and its collaborators
pub mod runtime;

/// Loader and interpreter for generated programs
pub mod script;

// Re-export key types for convenience
pub use compiler::{CompileOptions, CompiledProject, Project, compile_project};
pub use runtime::{Engine, EngineConfig};

/// Current version of the Weft runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the transport envelope format
pub const PROTOCOL_VERSION: &str = "1.0.0";
