//! Built-in functions available to generated programs.
//!
//! Everything here is pure; functions that touch the host (`sleep`,
//! `print`, atomic calls, reporting) are dispatched by the interpreter.

use std::collections::BTreeMap;

use super::value::Value;
use super::{ErrorKind, ScriptError, ScriptResult, TypeIssue};
use crate::compiler::UnitCategory;

/// Upper bound on the number of items `range` may produce.
pub const MAX_RANGE_LEN: i64 = 10_000_000;

const NAMES: &[&str] = &[
    "str",
    "int",
    "float",
    "bool",
    "len",
    "list",
    "dict",
    "range",
    "enumerate",
    "items",
    "abs",
    "min",
    "max",
    "round",
    "isinstance",
    "consequence",
    "int_param",
    "list_param",
    "dict_param",
    "element",
    "process",
    "module",
];

/// Whether `name` is a pure built-in.
pub fn is_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Call arguments after evaluation.
#[derive(Debug, Default)]
pub struct Args {
    /// Positional values.
    pub positional: Vec<Value>,
    /// Keyword values in call order.
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    /// Argument by keyword, else by position.
    fn get(&self, name: &str, position: usize) -> Option<&Value> {
        self.keywords
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
            .or_else(|| self.positional.get(position))
    }

    fn required(&self, func: &str, name: &str, position: usize) -> ScriptResult<&Value> {
        self.get(name, position)
            .ok_or_else(|| bad_args(func, format!("missing required argument '{name}'")))
    }
}

fn bad_args(func: &str, message: impl Into<String>) -> ScriptError {
    ScriptError::type_error(TypeIssue::BadArguments {
        func: func.to_string(),
        message: message.into(),
    })
}

fn value_error(message: impl Into<String>) -> ScriptError {
    ScriptError::new(ErrorKind::Value {
        message: message.into(),
    })
}

fn param_error(name: &Value, value: &Value, expected: &str) -> ScriptError {
    ScriptError::new(ErrorKind::Param {
        name: name.to_display(),
        value: value.repr(),
        expected: expected.to_string(),
    })
}

/// Call built-in `name`.
pub fn call(name: &str, args: Args) -> ScriptResult<Value> {
    match name {
        "str" => Ok(Value::Str(
            args.get("object", 0).map(Value::to_display).unwrap_or_default(),
        )),
        "int" => to_int(args.get("x", 0).unwrap_or(&Value::Int(0))).map(Value::Int),
        "float" => to_float(args.get("x", 0).unwrap_or(&Value::Float(0.0))).map(Value::Float),
        "bool" => Ok(Value::Bool(args.get("x", 0).is_some_and(Value::truthy))),
        "len" => len(args.required(name, "obj", 0)?).map(Value::Int),
        "list" => match args.get("iterable", 0) {
            Some(value) => iterate(value).map(Value::List),
            None => Ok(Value::List(Vec::new())),
        },
        "dict" => match args.get("mapping", 0) {
            Some(Value::Map(map)) => Ok(Value::Map(map.clone())),
            Some(other) => Err(ScriptError::type_error(TypeIssue::NotIterable(
                other.type_name().to_string(),
            ))),
            None => Ok(Value::Map(
                args.keywords.iter().cloned().collect::<BTreeMap<_, _>>(),
            )),
        },
        "range" => range(&args),
        "enumerate" => {
            let items = iterate(args.required(name, "iterable", 0)?)?;
            Ok(Value::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::List(vec![Value::Int(i as i64), v]))
                    .collect(),
            ))
        }
        "items" => match args.required(name, "mapping", 0)? {
            Value::Map(map) => Ok(Value::List(
                map.iter()
                    .map(|(k, v)| Value::List(vec![Value::str(k.clone()), v.clone()]))
                    .collect(),
            )),
            other => Err(bad_args(name, format!("expected dict, got {}", other.type_name()))),
        },
        "abs" => match args.required(name, "x", 0)? {
            Value::Int(n) => Ok(Value::Int(n.abs())),
            Value::Float(n) => Ok(Value::Float(n.abs())),
            other => Err(bad_args(name, format!("bad operand type '{}'", other.type_name()))),
        },
        "min" | "max" => extremum(name, args),
        "round" => {
            let x = args.required(name, "number", 0)?;
            let x = x
                .as_f64()
                .ok_or_else(|| bad_args(name, format!("bad operand type '{}'", x.type_name())))?;
            match args.get("ndigits", 1) {
                Some(Value::Int(digits)) => {
                    let factor = 10f64.powi(*digits as i32);
                    Ok(Value::Float((x * factor).round() / factor))
                }
                _ => Ok(Value::Int(x.round() as i64)),
            }
        }
        "isinstance" => {
            let value = args.required(name, "obj", 0)?;
            let class = args.required(name, "class", 1)?.to_display();
            Ok(Value::Bool(value.type_name() == class))
        }
        "consequence" => consequence(&args),
        "int_param" => {
            let (label, value) = param_args(name, &args)?;
            coerce_int(value)
                .map(Value::Int)
                .ok_or_else(|| param_error(label, value, "int"))
        }
        "list_param" => {
            let (label, value) = param_args(name, &args)?;
            coerce_list(value)
                .map(Value::List)
                .ok_or_else(|| param_error(label, value, "list"))
        }
        "dict_param" => {
            let (label, value) = param_args(name, &args)?;
            coerce_dict(value)
                .map(Value::Map)
                .ok_or_else(|| param_error(label, value, "dict"))
        }
        "element" => Ok(Value::Element(Box::new(
            args.get("desc", 0).cloned().unwrap_or(Value::None),
        ))),
        "process" | "module" => {
            let id = args.required(name, "id", 0)?.to_display();
            let category = if name == "process" {
                UnitCategory::Process
            } else {
                UnitCategory::Module
            };
            Ok(Value::Unit { id, category })
        }
        other => Err(ScriptError::new(ErrorKind::Name {
            name: other.to_string(),
        })),
    }
}

fn param_args<'a>(func: &str, args: &'a Args) -> ScriptResult<(&'a Value, &'a Value)> {
    Ok((args.required(func, "name", 0)?, args.required(func, "value", 1)?))
}

/// Items produced by iterating over `value`.
pub fn iterate(value: &Value) -> ScriptResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Map(map) => Ok(map.keys().cloned().map(Value::Str).collect()),
        Value::Str(text) => Ok(text.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(ScriptError::type_error(TypeIssue::NotIterable(
            other.type_name().to_string(),
        ))),
    }
}

fn len(value: &Value) -> ScriptResult<i64> {
    match value {
        Value::Str(text) => Ok(text.chars().count() as i64),
        Value::List(items) => Ok(items.len() as i64),
        Value::Map(map) => Ok(map.len() as i64),
        other => Err(bad_args(
            "len",
            format!("object of type '{}' has no len", other.type_name()),
        )),
    }
}

fn to_int(value: &Value) -> ScriptResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(flag) => Ok(i64::from(*flag)),
        Value::Float(n) if n.is_finite() => Ok(n.trunc() as i64),
        Value::Str(text) => text
            .trim()
            .parse()
            .map_err(|_| value_error(format!("invalid literal for int(): '{text}'"))),
        other => Err(bad_args(
            "int",
            format!("argument must be a string or a number, not '{}'", other.type_name()),
        )),
    }
}

fn to_float(value: &Value) -> ScriptResult<f64> {
    match value {
        Value::Str(text) => text
            .trim()
            .parse()
            .map_err(|_| value_error(format!("could not convert string to float: '{text}'"))),
        other => other.as_f64().ok_or_else(|| {
            bad_args(
                "float",
                format!("argument must be a string or a number, not '{}'", other.type_name()),
            )
        }),
    }
}

fn range(args: &Args) -> ScriptResult<Value> {
    let ints: Vec<i64> = args
        .positional
        .iter()
        .map(|v| match v {
            Value::Int(n) => Ok(*n),
            other => Err(bad_args(
                "range",
                format!("'{}' object cannot be interpreted as an integer", other.type_name()),
            )),
        })
        .collect::<ScriptResult<_>>()?;
    let (start, end, step) = match ints.as_slice() {
        [end] => (0, *end, 1),
        [start, end] => (*start, *end, 1),
        [start, end, step] => (*start, *end, *step),
        _ => return Err(bad_args("range", "expected 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(value_error("range() arg 3 must not be zero"));
    }
    let span = if step > 0 { end.saturating_sub(start) } else { start.saturating_sub(end) };
    let count = if span <= 0 { 0 } else { (span - 1) / step.saturating_abs() + 1 };
    if count > MAX_RANGE_LEN {
        return Err(value_error(format!("range of {count} items is too large")));
    }
    Ok(Value::List(
        (0..count).map(|i| Value::Int(start + i * step)).collect(),
    ))
}

fn extremum(name: &str, args: Args) -> ScriptResult<Value> {
    let items = match args.positional.as_slice() {
        [single] => iterate(single)?,
        many => many.to_vec(),
    };
    let want = if name == "min" {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| value_error(format!("{name}() arg is an empty sequence")))?;
    for item in iter {
        let ord = item.partial_order(&best).ok_or_else(|| {
            ScriptError::type_error(TypeIssue::UnsupportedOperand {
                op: "<".to_string(),
                left: item.type_name().to_string(),
                right: best.type_name().to_string(),
            })
        })?;
        if ord == want {
            best = item;
        }
    }
    Ok(best)
}

fn is_integer_text(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_float_text(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    match body.split_once('.') {
        Some((whole, frac)) => {
            whole.chars().all(|c| c.is_ascii_digit())
                && !frac.is_empty()
                && frac.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Boolean reading of a condition operand.
fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Str(text) => !matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "0" | "no" | "none"
        ),
        other => other.truthy(),
    }
}

/// Numeric-looking strings become numbers; other non-numbers become strings.
fn ordering_operand(value: &Value) -> Value {
    match value {
        Value::Str(text) if is_integer_text(text) => {
            text.parse().map(Value::Int).unwrap_or_else(|_| value.clone())
        }
        Value::Str(text) if is_float_text(text) => {
            text.parse().map(Value::Float).unwrap_or_else(|_| value.clone())
        }
        Value::Int(_) | Value::Float(_) => value.clone(),
        other => Value::Str(other.to_display()),
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Evaluate a flow condition: `consequence(args1, condition, args2)`.
pub fn consequence(args: &Args) -> ScriptResult<Value> {
    let left = args.get("args1", 0).cloned().unwrap_or(Value::None);
    let condition = args
        .get("condition", 1)
        .map(Value::to_display)
        .unwrap_or_default();
    let right = args.get("args2", 2).cloned().unwrap_or(Value::None);

    let result = match condition.as_str() {
        "true" => coerce_bool(&left),
        "false" => !coerce_bool(&left),
        "empty" | "notempty" => {
            let empty = match &left {
                Value::None => true,
                Value::Str(text) => text.trim().is_empty(),
                _ => false,
            };
            empty == (condition == "empty")
        }
        ">" | "<" | ">=" | "<=" => {
            let a = ordering_operand(&left);
            let b = ordering_operand(&right);
            let ord = a.partial_order(&b).ok_or_else(|| {
                ScriptError::type_error(TypeIssue::UnsupportedOperand {
                    op: condition.clone(),
                    left: a.type_name().to_string(),
                    right: b.type_name().to_string(),
                })
            })?;
            match condition.as_str() {
                ">" => ord.is_gt(),
                "<" => ord.is_lt(),
                ">=" => ord.is_ge(),
                _ => ord.is_le(),
            }
        }
        "==" | "!=" => {
            let equal = if same_kind(&left, &right) {
                left == right
            } else {
                left.to_display() == right.to_display()
            };
            equal == (condition == "==")
        }
        "in" | "notin" => {
            let needle = right.to_display();
            let haystack = match &left {
                Value::Str(text) if text.starts_with('[') || text.starts_with('{') => {
                    serde_json::from_str::<serde_json::Value>(text)
                        .map(|json| Value::from_json(&json))
                        .unwrap_or_else(|_| left.clone())
                }
                _ => left.clone(),
            };
            let found = match &haystack {
                Value::List(items) => items.iter().any(|v| v.to_display() == needle),
                Value::Map(map) => map.contains_key(&needle),
                Value::Str(text) => text.contains(&needle),
                _ => false,
            };
            found == (condition == "in")
        }
        _ => false,
    };
    Ok(Value::Bool(result))
}

fn parse_json_text(text: &str) -> Option<Value> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .map(|json| Value::from_json(&json))
}

/// Read a loop bound as an integer.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::Float(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
        Value::Str(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Read a loop source as a list; JSON text is accepted.
pub fn coerce_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(items) => Some(items.clone()),
        Value::Str(text) if text.trim().is_empty() => Some(Vec::new()),
        Value::Str(text) => match parse_json_text(text)? {
            Value::List(items) => Some(items),
            _ => None,
        },
        Value::None => Some(Vec::new()),
        _ => None,
    }
}

/// Read a loop source as a dict; JSON text is accepted.
pub fn coerce_dict(value: &Value) -> Option<BTreeMap<String, Value>> {
    match value {
        Value::Map(map) => Some(map.clone()),
        Value::Str(text) if text.trim().is_empty() => Some(BTreeMap::new()),
        Value::Str(text) => match parse_json_text(text)? {
            Value::Map(map) => Some(map),
            _ => None,
        },
        Value::None => Some(BTreeMap::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(left: Value, condition: &str, right: Value) -> bool {
        let args = Args {
            positional: Vec::new(),
            keywords: vec![
                ("args1".into(), left),
                ("condition".into(), Value::str(condition)),
                ("args2".into(), right),
            ],
        };
        consequence(&args).expect("condition") == Value::Bool(true)
    }

    #[test]
    fn numeric_strings_compare_as_numbers() {
        assert!(cond(Value::str("10"), ">", Value::Int(9)));
        assert!(cond(Value::str("2.5"), "<=", Value::str("2.5")));
        assert!(!cond(Value::str("abc"), ">", Value::str("abd")));
    }

    #[test]
    fn equality_falls_back_to_text() {
        assert!(cond(Value::Int(3), "==", Value::str("3")));
        assert!(cond(Value::Int(3), "!=", Value::Int(4)));
    }

    #[test]
    fn membership_accepts_json_text() {
        assert!(cond(Value::str("[1, 2, 3]"), "in", Value::Int(2)));
        assert!(cond(Value::str("hello"), "notin", Value::str("z")));
    }

    #[test]
    fn emptiness_and_truth() {
        assert!(cond(Value::str("  "), "empty", Value::None));
        assert!(cond(Value::Int(0), "notempty", Value::None));
        assert!(cond(Value::str("false"), "false", Value::None));
        assert!(!cond(Value::str("x"), "unknown", Value::None));
    }

    #[test]
    fn range_matches_half_open_semantics() {
        let args = Args {
            positional: vec![Value::Int(5), Value::Int(0), Value::Int(-2)],
            keywords: Vec::new(),
        };
        assert_eq!(
            range(&args).expect("range"),
            Value::List(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
    }

    #[test]
    fn loop_params_reject_bad_literals() {
        let args = Args {
            positional: vec![Value::str("lists"), Value::str("not json")],
            keywords: Vec::new(),
        };
        let err = call("list_param", args).expect_err("bad list");
        assert!(matches!(err.kind, ErrorKind::Param { ref expected, .. } if expected == "list"));
        let args = Args {
            positional: vec![Value::str("end"), Value::str("12")],
            keywords: Vec::new(),
        };
        assert_eq!(call("int_param", args).expect("int"), Value::Int(12));
    }
}
