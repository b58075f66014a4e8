//! Flow documents: projects, processes, and the steps they contain.
//!
//! A project document is the JSON handed over by the flow storage service.
//! Steps arrive in their wire form ([`StepRecord`]) and are turned into
//! immutable [`FlowStep`]s once their flow-line is known.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::params::{ParamError, literal_text};
use crate::runtime::dependency::DependencySpec;

/// Tag carried by each fragment of a declared value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Expression text evaluated at run time.
    Python,
    /// Flow variable reference.
    Var,
    /// Sub-flow parameter reference.
    PVar,
    /// Global variable reference.
    GVar,
    /// Raw string literal.
    Str,
    /// Literal of any JSON type.
    Other,
    /// UI element reference.
    Element,
}

impl FragmentKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "python" => Some(Self::Python),
            "var" => Some(Self::Var),
            "p_var" => Some(Self::PVar),
            "g_var" => Some(Self::GVar),
            "str" => Some(Self::Str),
            "other" => Some(Self::Other),
            "element" => Some(Self::Element),
            _ => None,
        }
    }

    /// Whether a fragment of this kind forces the whole value onto the
    /// expression path.
    pub fn requires_evaluation(self) -> bool {
        matches!(self, Self::Python | Self::Var | Self::PVar | Self::GVar)
    }
}

/// One tagged piece of a declared value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Fragment tag.
    pub kind: FragmentKind,
    /// Raw fragment payload.
    pub data: JsonValue,
}

impl Fragment {
    /// Build a literal fragment from any JSON value.
    pub fn literal(data: JsonValue) -> Self {
        Self {
            kind: FragmentKind::Other,
            data,
        }
    }

    fn is_blank(&self) -> bool {
        matches!(&self.data, JsonValue::String(text) if text.is_empty())
    }
}

/// Split a declared value into fragments.
///
/// Tagged arrays (`[{"type": "var", "value": "x"}, ...]`) keep their tags and
/// drop blank pieces (keeping the first one if nothing else survives); any
/// other JSON value becomes a single literal fragment.
pub fn fragments_from_json(value: &JsonValue) -> Vec<Fragment> {
    let tagged = match value {
        JsonValue::Array(items) => items
            .first()
            .and_then(|first| first.get("type"))
            .and_then(JsonValue::as_str)
            .and_then(FragmentKind::from_tag)
            .is_some(),
        _ => false,
    };
    if !tagged {
        return vec![Fragment::literal(value.clone())];
    }

    let JsonValue::Array(items) = value else {
        return Vec::new();
    };
    let all: Vec<Fragment> = items
        .iter()
        .map(|item| {
            let kind = item
                .get("type")
                .and_then(JsonValue::as_str)
                .and_then(FragmentKind::from_tag)
                .unwrap_or(FragmentKind::Str);
            let data = item
                .get("data")
                .or_else(|| item.get("value"))
                .cloned()
                .unwrap_or_else(|| JsonValue::String(String::new()));
            Fragment { kind, data }
        })
        .collect();

    let kept: Vec<Fragment> = all.iter().filter(|f| !f.is_blank()).cloned().collect();
    if kept.is_empty() {
        all.into_iter().take(1).collect()
    } else {
        kept
    }
}

/// Wire form of an input entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    /// Input key.
    pub key: String,
    /// Optional argument name, defaults to the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display title used in atomic metadata.
    #[serde(default)]
    pub title: String,
    /// Declared value, tagged fragments or a bare JSON value.
    #[serde(default)]
    pub value: JsonValue,
    /// Hidden inputs are not passed to the call.
    #[serde(default = "default_true")]
    pub show: bool,
    /// Parse directive for structured inputs (`json_str`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_parse: Option<String>,
}

/// Wire form of an output binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Output key.
    #[serde(default)]
    pub key: String,
    /// Bound variable, tagged fragments or a bare name.
    #[serde(default)]
    pub value: JsonValue,
    /// Hidden outputs are not bound.
    #[serde(default = "default_true")]
    pub show: bool,
}

/// Wire form of one flow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Stable step identifier.
    #[serde(default)]
    pub id: String,
    /// Operation key or control-flow keyword.
    #[serde(default)]
    pub key: String,
    /// User-facing alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Fallback title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Declared inputs.
    #[serde(default, rename = "inputList")]
    pub input_list: Vec<InputRecord>,
    /// Declared outputs.
    #[serde(default, rename = "outputList")]
    pub output_list: Vec<OutputRecord>,
    /// Disabled steps keep their line number but are not compiled.
    #[serde(default)]
    pub disabled: bool,
    /// Design-time breakpoint.
    #[serde(default)]
    pub breakpoint: bool,
}

fn default_true() -> bool {
    true
}

/// What an atomic call does when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Propagate the failure.
    #[default]
    Exit,
    /// Retry up to `retry_count` times.
    Retry,
    /// Swallow the failure and continue with empty outputs.
    Skip,
}

impl OnError {
    /// Keyword used in generated code.
    pub fn as_str(self) -> &'static str {
        match self {
            OnError::Exit => "exit",
            OnError::Retry => "retry",
            OnError::Skip => "skip",
        }
    }

    /// Parse the keyword used in flows and generated code.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "exit" | "" => Some(OnError::Exit),
            "retry" => Some(OnError::Retry),
            "skip" => Some(OnError::Skip),
            _ => None,
        }
    }
}

/// Advanced options attached to an atomic step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Advanced {
    /// Failure policy.
    pub on_error: OnError,
    /// Number of retries when `on_error` is [`OnError::Retry`].
    pub retry_count: u32,
    /// Seconds to sleep between retries.
    pub retry_interval: f64,
    /// Seconds to wait before the call.
    pub delay_before: f64,
    /// Seconds to wait after the call.
    pub delay_after: f64,
    /// Emit the call result as a report event.
    pub print_result: bool,
}

impl Advanced {
    /// Input keys that carry advanced options on the wire.
    pub const KEYS: [&'static str; 6] = [
        "__skip_err__",
        "__retry_time__",
        "__retry_interval__",
        "__delay_before__",
        "__delay_after__",
        "__res_print__",
    ];

    /// Whether a step with these options gets the retry wrapper.
    pub fn wants_retry(&self) -> bool {
        self.on_error == OnError::Retry && self.retry_count > 0
    }

    fn apply(&mut self, key: &str, value: &JsonValue) -> Result<(), ParamError> {
        let fragments = fragments_from_json(value);
        let text = fragments
            .iter()
            .map(|f| literal_text(&f.data))
            .collect::<String>();
        let number = |expected: &'static str| -> Result<f64, ParamError> {
            if text.trim().is_empty() {
                return Ok(0.0);
            }
            text.trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .ok_or_else(|| ParamError::Coercion {
                    name: key.to_string(),
                    value: text.clone(),
                    expected,
                })
        };
        match key {
            "__skip_err__" => {
                self.on_error = OnError::parse(text.trim()).ok_or_else(|| ParamError::Coercion {
                    name: key.to_string(),
                    value: text.clone(),
                    expected: "error policy (exit, retry, skip)",
                })?;
            }
            "__retry_time__" => self.retry_count = number("retry count")? as u32,
            "__retry_interval__" => self.retry_interval = number("interval in seconds")?,
            "__delay_before__" => self.delay_before = number("delay in seconds")?,
            "__delay_after__" => self.delay_after = number("delay in seconds")?,
            "__res_print__" => {
                self.print_result = match value {
                    JsonValue::Bool(flag) => *flag,
                    _ => matches!(text.trim(), "true" | "True" | "1"),
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A declared input of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// Argument name.
    pub name: String,
    /// Display title.
    pub title: String,
    /// Declared value split into fragments.
    pub value: Vec<Fragment>,
    /// Hidden inputs are not passed.
    pub show: bool,
    /// Parse directive for structured values.
    pub need_parse: Option<String>,
}

/// A declared output binding of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Output key.
    pub name: String,
    /// Variable receiving the output.
    pub variable: String,
}

/// One compiled-ready step of a sub-flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowStep {
    /// Stable step identifier.
    pub id: String,
    /// Operation key or control-flow keyword.
    pub key: String,
    /// Alias or title shown to users.
    pub label: String,
    /// 1-based position within the owning sub-flow.
    pub flow_line: usize,
    /// Visible and hidden inputs, advanced options removed.
    pub inputs: Vec<StepInput>,
    /// Visible output bindings.
    pub outputs: Vec<StepOutput>,
    /// Disabled flag from the source record.
    pub disabled: bool,
    /// Design-time breakpoint flag.
    pub has_breakpoint: bool,
    /// Advanced options.
    pub advanced: Advanced,
}

impl FlowStep {
    /// Build a step from its wire record at the given flow-line.
    pub fn from_record(record: &StepRecord, flow_line: usize) -> Result<Self, ParamError> {
        let mut advanced = Advanced::default();
        let mut inputs = Vec::new();
        for input in &record.input_list {
            if Advanced::KEYS.contains(&input.key.as_str()) {
                advanced.apply(&input.key, &input.value)?;
                continue;
            }
            inputs.push(StepInput {
                name: input.name.clone().unwrap_or_else(|| input.key.clone()),
                title: input.title.clone(),
                value: fragments_from_json(&input.value),
                show: input.show,
                need_parse: input.need_parse.clone(),
            });
        }

        let outputs = record
            .output_list
            .iter()
            .filter(|output| output.show)
            .filter_map(|output| {
                let variable = fragments_from_json(&output.value)
                    .first()
                    .map(|f| literal_text(&f.data))
                    .unwrap_or_default();
                (!variable.is_empty()).then(|| StepOutput {
                    name: output.key.clone(),
                    variable,
                })
            })
            .collect();

        let label = record
            .alias
            .clone()
            .filter(|alias| !alias.is_empty())
            .or_else(|| record.title.clone())
            .unwrap_or_default();

        Ok(Self {
            id: record.id.clone(),
            key: record.key.clone(),
            label,
            flow_line,
            inputs,
            outputs,
            disabled: record.disabled,
            has_breakpoint: record.breakpoint,
            advanced,
        })
    }

    /// Find a visible input by name.
    pub fn input(&self, name: &str) -> Option<&StepInput> {
        self.inputs.iter().find(|input| input.show && input.name == name)
    }

    /// Visible inputs in declaration order.
    pub fn visible_inputs(&self) -> impl Iterator<Item = &StepInput> {
        self.inputs.iter().filter(|input| input.show)
    }
}

/// Kind of compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitCategory {
    /// Sub-flow compiled from steps.
    #[default]
    Process,
    /// Sub-module written directly as script.
    Module,
}

/// Whether a declared parameter is read from or written back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Direction {
    /// Loaded from the argument map.
    #[default]
    Input,
    /// Loaded and written back on exit.
    Output,
}

impl From<u8> for Direction {
    fn from(value: u8) -> Self {
        if value == 1 {
            Direction::Output
        } else {
            Direction::Input
        }
    }
}

impl From<Direction> for u8 {
    fn from(value: Direction) -> Self {
        match value {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

/// A declared sub-flow parameter or global variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    /// Variable name.
    pub var_name: String,
    /// Declared type label, informational.
    #[serde(default)]
    pub var_type: String,
    /// Declared default value.
    #[serde(default)]
    pub var_value: JsonValue,
    /// Parameter direction.
    #[serde(default)]
    pub var_direction: Direction,
}

/// A process or module of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDef {
    /// Unit identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Unit category.
    #[serde(default)]
    pub category: UnitCategory,
    /// Steps of a process unit.
    #[serde(default)]
    pub flow: Vec<StepRecord>,
    /// Script text of a module unit.
    #[serde(default)]
    pub source: String,
    /// Declared parameters.
    #[serde(default)]
    pub params: Vec<VariableDef>,
}

/// A reusable component with its own package requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDef {
    /// Component identifier.
    pub id: String,
    /// Component version label.
    #[serde(default)]
    pub version: String,
    /// Packages the component needs.
    #[serde(default)]
    pub requirements: Vec<DependencySpec>,
}

/// A complete project document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Processes and modules in document order.
    #[serde(default)]
    pub processes: Vec<ProcessDef>,
    /// Global variables shared by all units of a run.
    #[serde(default)]
    pub globals: Vec<VariableDef>,
    /// Flow-level package requirements.
    #[serde(default)]
    pub requirements: Vec<DependencySpec>,
    /// Components used by the project.
    #[serde(default)]
    pub components: Vec<ComponentDef>,
}

impl Project {
    /// Parse a project document from JSON text.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Inclusive flow-line window; zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineSlice {
    /// First flow-line to keep.
    pub start: usize,
    /// Last flow-line to keep.
    pub end: usize,
}

impl LineSlice {
    /// Whether `line` falls inside the window.
    pub fn contains(&self, line: usize) -> bool {
        (self.start == 0 || line >= self.start) && (self.end == 0 || line <= self.end)
    }
}

/// Number the records of a sub-flow and keep the enabled ones inside `slice`.
///
/// Disabled records still consume a flow-line.
pub fn surviving_steps(records: &[StepRecord], slice: LineSlice) -> Result<Vec<FlowStep>, ParamError> {
    let mut steps = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let line = index + 1;
        if record.disabled || !slice.contains(line) {
            continue;
        }
        steps.push(FlowStep::from_record(record, line)?);
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_fragments_drop_blank_pieces() {
        let value = json!([
            {"type": "str", "value": ""},
            {"type": "var", "value": "name"},
            {"type": "str", "value": "!"}
        ]);
        let fragments = fragments_from_json(&value);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].kind, FragmentKind::Var);
    }

    #[test]
    fn bare_values_become_literals() {
        let fragments = fragments_from_json(&json!(42));
        assert_eq!(fragments, vec![Fragment::literal(json!(42))]);
    }

    #[test]
    fn advanced_inputs_are_lifted() {
        let record: StepRecord = serde_json::from_value(json!({
            "id": "s1",
            "key": "Browser.open",
            "inputList": [
                {"key": "url", "value": [{"type": "str", "value": "https://example.com"}]},
                {"key": "__skip_err__", "value": "retry"},
                {"key": "__retry_time__", "value": [{"type": "other", "value": 3}]},
                {"key": "__retry_interval__", "value": [{"type": "other", "value": "0.5"}]}
            ],
            "outputList": [{"key": "page", "value": [{"type": "var", "value": "page"}]}]
        }))
        .expect("record");
        let step = FlowStep::from_record(&record, 4).expect("step");
        assert_eq!(step.inputs.len(), 1);
        assert_eq!(step.advanced.on_error, OnError::Retry);
        assert_eq!(step.advanced.retry_count, 3);
        assert_eq!(step.advanced.retry_interval, 0.5);
        assert_eq!(step.outputs[0].variable, "page");
        assert_eq!(step.flow_line, 4);
    }

    #[test]
    fn disabled_steps_keep_their_line() {
        let records: Vec<StepRecord> = serde_json::from_value(json!([
            {"key": "A.a"},
            {"key": "A.b", "disabled": true},
            {"key": "A.c"},
            {"key": "A.d"}
        ]))
        .expect("records");
        let steps = surviving_steps(&records, LineSlice { start: 0, end: 3 }).expect("steps");
        let lines: Vec<usize> = steps.iter().map(|s| s.flow_line).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn bad_retry_count_is_a_param_error() {
        let record: StepRecord = serde_json::from_value(json!({
            "key": "A.a",
            "inputList": [{"key": "__retry_time__", "value": "often"}]
        }))
        .expect("record");
        assert!(matches!(
            FlowStep::from_record(&record, 1),
            Err(ParamError::Coercion { .. })
        ));
    }
}
