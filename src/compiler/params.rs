//! Parameter expression compiler.
//!
//! Each declared input is a list of tagged fragments. When nothing in the
//! value refers to a variable or an expression the fragments collapse into a
//! literal at compile time; otherwise they become one script expression
//! that is evaluated when the step runs.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::flow::{Fragment, FragmentKind, OnError, StepInput, VariableDef, fragments_from_json};

/// Errors raised while coercing declared literals.
#[derive(Debug, Error)]
pub enum ParamError {
    /// A literal could not be read as the expected type.
    #[error("parameter `{name}`: `{value}` is not a valid {expected}")]
    Coercion {
        /// Parameter name.
        name: String,
        /// Offending literal.
        value: String,
        /// Expected type.
        expected: &'static str,
    },
    /// A structured input held malformed JSON.
    #[error("parameter `{name}`: invalid JSON: {source}")]
    Json {
        /// Parameter name.
        name: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Argument kinds that the runtime resolves specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    /// UI element reference.
    Element,
    /// Sub-flow reference resolved by unit id.
    SubFlow,
    /// Sub-module reference resolved by unit id.
    SubModule,
}

impl SpecialKind {
    fn wrapper(self) -> &'static str {
        match self {
            SpecialKind::Element => "element",
            SpecialKind::SubFlow => "process",
            SpecialKind::SubModule => "module",
        }
    }
}

/// Compiled form of a declared value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Precomputed literal.
    Literal(JsonValue),
    /// Script expression evaluated at run time.
    Expression(String),
}

/// One compiled input.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledParam {
    /// Argument name.
    pub name: String,
    /// Compiled value.
    pub value: ParamValue,
    /// Special runtime handling, if any.
    pub special: Option<SpecialKind>,
}

impl CompiledParam {
    /// Whether the value is evaluated at run time.
    pub fn needs_evaluation(&self) -> bool {
        matches!(self.value, ParamValue::Expression(_))
    }

    /// Script source for the value.
    pub fn code(&self) -> String {
        let inner = match &self.value {
            ParamValue::Literal(value) => render_literal(value),
            ParamValue::Expression(expr) => expr.clone(),
        };
        match self.special {
            Some(kind) => format!("{}({})", kind.wrapper(), inner),
            None => inner,
        }
    }
}

/// Text of a literal as it would appear when concatenated.
pub fn literal_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Bool(true) => "True".to_string(),
        JsonValue::Bool(false) => "False".to_string(),
        JsonValue::Number(num) => num.to_string(),
        other => render_literal(other),
    }
}

/// Quote a string as a script string literal.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Render a JSON value as a script literal.
pub fn render_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "None".to_string(),
        JsonValue::Bool(true) => "True".to_string(),
        JsonValue::Bool(false) => "False".to_string(),
        JsonValue::Number(num) => num.to_string(),
        JsonValue::String(text) => quote(text),
        JsonValue::Array(items) => {
            let inner: Vec<String> = items.iter().map(render_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        JsonValue::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote(k), render_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Expression for a global variable lookup.
pub fn global_ref(name: &str) -> String {
    format!("gv[{}]", quote(name))
}

/// Compiler bound to the set of declared globals.
pub struct ParamCompiler<'a> {
    globals: &'a BTreeSet<String>,
}

impl<'a> ParamCompiler<'a> {
    /// Create a compiler that knows which names are globals.
    pub fn new(globals: &'a BTreeSet<String>) -> Self {
        Self { globals }
    }

    /// Compile a fragment list into a literal or an expression.
    pub fn compile_fragments(&self, fragments: &[Fragment]) -> ParamValue {
        let needs_eval = fragments.iter().any(|f| f.kind.requires_evaluation());
        if !needs_eval {
            return match fragments {
                [] => ParamValue::Literal(JsonValue::String(String::new())),
                [single] => ParamValue::Literal(single.data.clone()),
                many => ParamValue::Literal(JsonValue::String(
                    many.iter().map(|f| literal_text(&f.data)).collect(),
                )),
            };
        }

        let pieces: Vec<String> = fragments
            .iter()
            .map(|fragment| match fragment.kind {
                FragmentKind::Str | FragmentKind::Other | FragmentKind::Element => {
                    render_literal(&fragment.data)
                }
                FragmentKind::GVar => global_ref(&literal_text(&fragment.data)),
                FragmentKind::Python | FragmentKind::Var | FragmentKind::PVar => {
                    literal_text(&fragment.data)
                }
            })
            .collect();
        if pieces.len() == 1 {
            ParamValue::Expression(pieces.into_iter().collect())
        } else {
            ParamValue::Expression(
                pieces
                    .iter()
                    .map(|piece| format!("str({piece})"))
                    .collect::<Vec<_>>()
                    .join(" + "),
            )
        }
    }

    /// Compile one declared input of a step with operation `step_key`.
    pub fn compile_input(&self, step_key: &str, input: &StepInput) -> Result<CompiledParam, ParamError> {
        if input.need_parse.as_deref() == Some("json_str") {
            let raw = input
                .value
                .first()
                .map(|f| literal_text(&f.data))
                .unwrap_or_default();
            let value = if raw.trim().is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_str(&raw).map_err(|source| ParamError::Json {
                    name: input.name.clone(),
                    source,
                })?
            };
            return Ok(CompiledParam {
                name: input.name.clone(),
                value: ParamValue::Literal(value),
                special: None,
            });
        }

        let special = match (step_key, input.name.as_str()) {
            _ if input.value.len() == 1 && input.value[0].kind == FragmentKind::Element => {
                Some(SpecialKind::Element)
            }
            ("Script.process", "process") => Some(SpecialKind::SubFlow),
            ("Script.module", "content") => Some(SpecialKind::SubModule),
            _ => None,
        };

        Ok(CompiledParam {
            name: input.name.clone(),
            value: self.compile_fragments(&input.value),
            special,
        })
    }

    /// Compile a declared parameter or global default value.
    pub fn compile_default(&self, var: &VariableDef) -> ParamValue {
        let value = match &var.var_value {
            // Stored values are sometimes JSON-encoded fragment lists.
            JsonValue::String(text) if text.trim_start().starts_with('[') => {
                serde_json::from_str::<JsonValue>(text).unwrap_or_else(|_| var.var_value.clone())
            }
            other => other.clone(),
        };
        self.compile_fragments(&fragments_from_json(&value))
    }

    /// Target of an output binding; globals use the index form.
    pub fn output_target(&self, variable: &str) -> String {
        if self.globals.contains(variable) {
            global_ref(variable)
        } else {
            variable.to_string()
        }
    }
}

/// Render a compiled default as script source.
pub fn value_code(value: &ParamValue) -> String {
    match value {
        ParamValue::Literal(literal) => render_literal(literal),
        ParamValue::Expression(expr) => expr.clone(),
    }
}

/// Keyword arguments describing a call's error policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    /// Policy passed as `__on_error__`.
    pub on_error: OnError,
    /// Attempts granted by the retry wrapper.
    pub retry_count: u32,
    /// Seconds slept between attempts.
    pub retry_interval: f64,
    /// The call runs inside a generated retry wrapper.
    pub in_retry: bool,
}
