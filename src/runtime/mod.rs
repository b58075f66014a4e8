//! Execution runtime and public API
//!
//! This module provides the [`Engine`] that runs compiled projects, its
//! configuration, and the collaborators it talks to: the atomic operation
//! backend, the request/reply transport, the reporting sink and the
//! dependency resolver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::CompileOptions;

// Submodules
pub mod atomic;
pub mod breakpoints;
pub mod cancel;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod report;
pub mod translate;
pub mod transport;

pub use atomic::{AtomicBackend, AtomicError, AtomicRequest, LocalBackend, RemoteBackend};
pub use cancel::CancelToken;
pub use dependency::{CommandInstaller, DependencyResolver, DependencySpec, Installer};
pub use engine::{Engine, ExecutionHandle, ExecutionState, Outcome, PauseInfo, PauseReason};
pub use error::{EngineError, EngineResult};
pub use report::{EventKind, ReportEvent, ReportLevel, ReportObserver, ReportSink};
pub use transport::{Envelope, Inbound, Transport, TransportError};

/// Language of user-facing failure summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    /// English
    #[default]
    En,
    /// Simplified Chinese
    Zh,
}

/// Configuration for the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Honour breakpoints and stepping
    pub debug_mode: bool,

    /// In debug mode, pause at the first line of the entry process
    pub break_on_entry: bool,

    /// Language of failure summaries
    pub locale: Locale,

    /// Name of the default entry process
    pub main_process_name: String,

    /// Spaces per indent level in generated code
    pub indent_width: usize,

    /// Seconds to wait for an atomic operation reply
    pub call_timeout_secs: u64,

    /// Seconds allowed for each package manager command
    pub dependency_timeout_secs: u64,

    /// Directory packages are downloaded into
    pub package_cache_dir: PathBuf,

    /// Capacity of each execution's report queue
    pub report_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            break_on_entry: true,
            locale: Locale::En,
            main_process_name: "main".to_string(),
            indent_width: 4,
            call_timeout_secs: 600,
            dependency_timeout_secs: 600,
            package_cache_dir: PathBuf::from(".weft/packages"),
            report_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        if config.indent_width == 0 {
            return Err(EngineError::Config("indent_width must be positive".to_string()));
        }
        Ok(config)
    }

    /// Compiler options matching this configuration.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            main_process_name: self.main_process_name.clone(),
            debug_mode: self.debug_mode,
            indent_width: self.indent_width,
            ..CompileOptions::default()
        }
    }

    /// Atomic reply timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Package manager timeout.
    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }
}
