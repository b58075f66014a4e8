//! Flow builders shared by the integration tests.

#![allow(dead_code)]

use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use weft::compiler::Project;
use weft::runtime::{AtomicError, AtomicRequest, LocalBackend};

/// Bound on how long a test waits for an execution.
pub const WAIT: Duration = Duration::from_secs(10);

/// Atomic step `key` with literal or tagged inputs and an optional output.
pub fn call(key: &str, inputs: &[(&str, JsonValue)], output: Option<&str>) -> JsonValue {
    let input_list: Vec<JsonValue> = inputs
        .iter()
        .map(|(name, value)| json!({ "key": name, "value": value }))
        .collect();
    let output_list: Vec<JsonValue> = output
        .map(|name| vec![json!({ "key": name, "value": [{ "type": "var", "value": name }] })])
        .unwrap_or_default();
    json!({ "key": key, "inputList": input_list, "outputList": output_list })
}

/// Control keyword step (`forEnd`, `break`, ...).
pub fn keyword(key: &str) -> JsonValue {
    json!({ "key": key })
}

/// Reference to a flow variable.
pub fn var(name: &str) -> JsonValue {
    json!([{ "type": "var", "value": name }])
}

/// `a + b` step binding `output`.
pub fn add(a: JsonValue, b: JsonValue, output: &str) -> JsonValue {
    call("Calc.add", &[("a", a), ("b", b)], Some(output))
}

/// Mark a step as disabled.
pub fn disabled(mut step: JsonValue) -> JsonValue {
    step["disabled"] = json!(true);
    step
}

/// Single-process project named `main` with id `p1`.
pub fn project(steps: Vec<JsonValue>) -> Project {
    project_with(vec![process("p1", "main", steps, json!([]))], json!([]))
}

/// Process definition.
pub fn process(id: &str, name: &str, steps: Vec<JsonValue>, params: JsonValue) -> JsonValue {
    json!({ "id": id, "name": name, "category": "process", "flow": steps, "params": params })
}

/// Project from process definitions and globals.
pub fn project_with(processes: Vec<JsonValue>, globals: JsonValue) -> Project {
    serde_json::from_value(json!({
        "id": "proj",
        "name": "Test project",
        "processes": processes,
        "globals": globals,
    }))
    .expect("project json")
}

/// Single `main` process declaring `outputs` as output parameters.
pub fn with_output(steps: Vec<JsonValue>, outputs: &[&str]) -> Project {
    let params: Vec<JsonValue> = outputs
        .iter()
        .map(|name| json!({ "varName": name, "varValue": 0, "varDirection": 1 }))
        .collect();
    project_with(vec![process("p1", "main", steps, json!(params))], json!([]))
}

/// Wrap `step` in the retry policy with `count` retries.
pub fn retrying(step: JsonValue, count: u32) -> JsonValue {
    let mut step = step;
    let inputs = step["inputList"].as_array_mut().expect("inputList");
    inputs.push(json!({ "key": "__skip_err__", "value": "retry" }));
    inputs.push(json!({ "key": "__retry_time__", "value": count }));
    step
}

/// Backend with `Calc.add`, `Calc.fail` and `Calc.slow`.
pub fn calc_backend() -> LocalBackend {
    LocalBackend::new()
        .with("Calc.add", |req: &AtomicRequest| {
            let a = req.args.get("a").and_then(JsonValue::as_i64).unwrap_or(0);
            let b = req.args.get("b").and_then(JsonValue::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .with("Calc.fail", |_: &AtomicRequest| {
            Err(AtomicError::Failed("calculator on fire".into()))
        })
        .with("Calc.slow", |_: &AtomicRequest| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(JsonValue::Null)
        })
}

/// Backend whose `Net.fetch` fails `failures` times before succeeding.
pub fn flaky_backend(failures: usize) -> (LocalBackend, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let backend = LocalBackend::new().with("Net.fetch", move |_: &AtomicRequest| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt < failures {
            Err(AtomicError::Failed(format!("attempt {attempt} failed")))
        } else {
            Ok(json!("payload"))
        }
    });
    (backend, calls)
}
