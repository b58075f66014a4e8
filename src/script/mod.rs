//! Loader and interpreter for generated programs.
//!
//! Generated programs are written in a small indented statement language.
//! The engine parses them back into a [`Script`] and runs them through an
//! [`Interpreter`] whose [`ScriptHost`] receives a checkpoint before every
//! statement; pausing, stepping and force-stop all happen inside that call.

use thiserror::Error;

pub mod ast;
pub mod builtins;
pub mod interpreter;
pub mod parser;
pub mod value;

pub use ast::Script;
pub use interpreter::{AtomicCall, Interpreter, Scope, ScriptHost};
pub use parser::parse_script;
pub use value::Value;

/// Failure categories of a running program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// Unbound name.
    #[error("name '{name}' is not defined")]
    Name {
        /// Missing name.
        name: String,
    },
    /// Attribute or method missing on a value.
    #[error("'{type_name}' object has no attribute '{attr}'")]
    Attribute {
        /// Receiver type.
        type_name: String,
        /// Missing attribute.
        attr: String,
    },
    /// Operation applied to a value of the wrong type.
    #[error("{0}")]
    Type(TypeIssue),
    /// Sequence index outside its bounds.
    #[error("{type_name} index out of range")]
    Index {
        /// Sequence type.
        type_name: String,
    },
    /// Missing map key.
    #[error("key '{key}' not found")]
    Key {
        /// Missing key.
        key: String,
    },
    /// Value of the right type but unacceptable content.
    #[error("{message}")]
    Value {
        /// Description.
        message: String,
    },
    /// Division or modulo by zero.
    #[error("division by zero")]
    ZeroDivision,
    /// `import` of an unavailable module or call into an unknown namespace.
    #[error("no module named '{module}'")]
    Import {
        /// Module or namespace name.
        module: String,
    },
    /// Program text could not be parsed.
    #[error("invalid syntax at line {line}: {message}")]
    Syntax {
        /// 1-based line.
        line: usize,
        /// Parser message.
        message: String,
    },
    /// Declared literal could not be coerced.
    #[error("parameter '{name}': {value} is not a valid {expected}")]
    Param {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
        /// Expected type.
        expected: String,
    },
    /// Remote reply did not arrive in time.
    #[error("no reply within {seconds}s")]
    Timeout {
        /// Timeout that elapsed.
        seconds: f64,
    },
    /// Failure reported by an atomic operation.
    #[error("{message}")]
    Atomic {
        /// Message from the worker.
        message: String,
    },
    /// Explicit `raise value` or other runtime failure.
    #[error("{message}")]
    Runtime {
        /// Description.
        message: String,
    },
    /// Execution was force-stopped; never caught by `except`.
    #[error("execution stopped")]
    Halted,
}

/// Specific type errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeIssue {
    /// Operator not defined for the operand types.
    #[error("unsupported operand type(s) for {op}: '{left}' and '{right}'")]
    UnsupportedOperand {
        /// Operator spelling.
        op: String,
        /// Left operand type.
        left: String,
        /// Right operand type.
        right: String,
    },
    /// Subscript on a value that has none.
    #[error("'{0}' object is not subscriptable")]
    NotSubscriptable(String),
    /// Iteration over a non-iterable value.
    #[error("'{0}' object is not iterable")]
    NotIterable(String),
    /// Call of something that is not callable.
    #[error("'{0}' object is not callable")]
    NotCallable(String),
    /// Wrong arguments for a function.
    #[error("{func}() {message}")]
    BadArguments {
        /// Function name.
        func: String,
        /// What was wrong.
        message: String,
    },
}

/// Position of an error in one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Unit the frame belongs to.
    pub unit: String,
    /// Generated line.
    pub line: usize,
}

/// Failure raised while running a program.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}")]
pub struct ScriptError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Frames from innermost to outermost.
    pub trace: Vec<TraceFrame>,
    located: bool,
}

impl ScriptError {
    /// New error with an empty trace.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
            located: false,
        }
    }

    /// Force-stop marker.
    pub fn halted() -> Self {
        Self::new(ErrorKind::Halted)
    }

    /// Type error shorthand.
    pub fn type_error(issue: TypeIssue) -> Self {
        Self::new(ErrorKind::Type(issue))
    }

    /// Runtime error shorthand.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime {
            message: message.into(),
        })
    }

    /// Whether `except` clauses may handle the error.
    pub fn is_catchable(&self) -> bool {
        self.kind != ErrorKind::Halted
    }

    /// Whether the error came from a force-stop.
    pub fn is_halted(&self) -> bool {
        self.kind == ErrorKind::Halted
    }

    /// Record the statement that raised the error, once per call level.
    pub(crate) fn locate(mut self, unit: &str, line: usize) -> Self {
        if !self.located {
            self.trace.push(TraceFrame {
                unit: unit.to_string(),
                line,
            });
            self.located = true;
        }
        self
    }

    /// Allow the caller's statement to add its own frame.
    pub(crate) fn unwind(mut self) -> Self {
        self.located = false;
        self
    }
}

/// Result alias used by the interpreter.
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;
