use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::compiler::UnitCategory;

/// Dynamic value manipulated by generated programs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value.
    None,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// UI element descriptor passed through to atomic calls.
    Element(Box<Value>),
    /// Reference to another compiled unit of the project.
    Unit {
        /// Unit identifier.
        id: String,
        /// Process or module.
        category: UnitCategory,
    },
}

impl Value {
    /// Shorthand for a string value.
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    /// Type label used in error messages and variable snapshots.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Element(_) => "element",
            Value::Unit { .. } => "unit",
        }
    }

    /// Truthiness: empty containers, zero and `None` are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(flag) => *flag,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Element(_) | Value::Unit { .. } => true,
        }
    }

    /// Numeric view of ints, floats and bools.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Text produced by `str(value)`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(text) => text.clone(),
            other => other.repr(),
        }
    }

    /// Text produced by `repr(value)`; strings are quoted.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => format_float(*n),
            Value::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Element(desc) => format!("element({})", desc.repr()),
            Value::Unit { id, .. } => format!("<unit {id}>"),
        }
    }

    /// Equality with int/float unification.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Ordering for numbers, strings and lists; `None` when incomparable.
    pub fn partial_order(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.partial_order(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Convert into JSON for the wire and for reports.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::None => JsonValue::Null,
            Value::Bool(flag) => JsonValue::Bool(*flag),
            Value::Int(n) => JsonValue::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(text) => JsonValue::String(text.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Element(desc) => serde_json::json!({ "__element__": desc.to_json() }),
            Value::Unit { id, category } => serde_json::json!({
                "__unit__": id,
                "category": match category {
                    UnitCategory::Process => "process",
                    UnitCategory::Module => "module",
                },
            }),
        }
    }

    /// Build a value from JSON; integral numbers become ints.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::None,
            JsonValue::Bool(flag) => Value::Bool(*flag),
            JsonValue::Number(num) => num
                .as_i64()
                .map(Value::Int)
                .or_else(|| num.as_f64().map(Value::Float))
                .unwrap_or(Value::None),
            JsonValue::String(text) => Value::Str(text.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => {
                if let (Some(desc), 1) = (map.get("__element__"), map.len()) {
                    return Value::Element(Box::new(Value::from_json(desc)));
                }
                Value::Map(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Str(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Str(text)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_matches_script_conventions() {
        assert_eq!(Value::Float(2.0).to_display(), "2.0");
        assert_eq!(Value::Bool(true).to_display(), "True");
        assert_eq!(
            Value::List(vec![Value::str("a"), Value::Int(1)]).to_display(),
            "['a', 1]"
        );
    }

    #[test]
    fn json_round_trip_keeps_integers() {
        let value = Value::from_json(&json!({"n": 3, "x": 1.5, "tags": ["a"]}));
        let Value::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(map["n"], Value::Int(3));
        assert_eq!(value.to_json(), json!({"n": 3, "x": 1.5, "tags": ["a"]}));
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
        assert_eq!(
            Value::Int(1).partial_order(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::str("a").partial_order(&Value::Int(1)), None);
    }
}
