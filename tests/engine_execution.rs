//! Integration tests for running compiled projects
//!
//! Drives the engine end to end with an in-process atomic backend and a
//! collecting report observer.

mod common;

use common::{
    WAIT, add, calc_backend, call, flaky_backend, process, project, project_with, retrying, var,
    with_output,
};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use weft::compiler::Project;
use weft::runtime::report::CollectingObserver;
use weft::runtime::{AtomicBackend, Engine, EngineConfig, EventKind, Locale, Outcome, ReportLevel};

fn engine(backend: impl AtomicBackend + 'static, config: EngineConfig) -> (Engine, Arc<CollectingObserver>) {
    let collector = Arc::new(CollectingObserver::new());
    let engine = Engine::new(config, Arc::new(backend)).with_observer(collector.clone());
    (engine, collector)
}

fn run(engine: &Engine, project: &Project) -> Outcome {
    let handle = engine.run(project, BTreeMap::new()).expect("start");
    handle.wait_timeout(WAIT).expect("execution finished in time")
}

fn code_events(collector: &CollectingObserver, status: &str) -> Vec<JsonValue> {
    collector
        .of_kind(EventKind::Code)
        .into_iter()
        .map(|e| e.data)
        .filter(|data| data["status"] == status)
        .collect()
}

fn terminal_events(collector: &CollectingObserver) -> usize {
    collector
        .events()
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::TaskEnd | EventKind::TaskError | EventKind::TaskCancelled
            )
        })
        .count()
}

#[test]
fn outputs_are_written_back() {
    let (engine, collector) = engine(calc_backend(), EngineConfig::default());
    let project = with_output(
        vec![add(json!(1), json!(2), "x"), add(var("x"), json!(3), "y")],
        &["y"],
    );
    let outcome = run(&engine, &project);
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            outputs: BTreeMap::from([("y".to_string(), json!(6))]),
        }
    );
    assert_eq!(terminal_events(&collector), 1);
    assert_eq!(collector.of_kind(EventKind::TaskStart).len(), 1);
    assert_eq!(code_events(&collector, "start").len(), 2);
}

#[test]
fn retry_recovers_after_failures() {
    let (backend, calls) = flaky_backend(2);
    let (engine, collector) = engine(backend, EngineConfig::default());
    let project = with_output(vec![retrying(call("Net.fetch", &[], Some("page")), 3)], &["page"]);

    let outcome = run(&engine, &project);
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            outputs: BTreeMap::from([("page".to_string(), json!("payload"))]),
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let retries = code_events(&collector, "retry");
    assert_eq!(retries.len(), 2);
    assert!(retries.iter().all(|r| r["line"] == 1));
    assert!(code_events(&collector, "error").is_empty());
    // The wrapper reports the start; the wrapped call does not report again.
    assert_eq!(code_events(&collector, "start").len(), 1);
}

#[test]
fn exhausted_retries_fail_the_run() {
    let (backend, calls) = flaky_backend(10);
    let (engine, collector) = engine(backend, EngineConfig::default());
    let project = project(vec![retrying(call("Net.fetch", &[], Some("page")), 2)]);

    let Outcome::Failed(failure) = run(&engine, &project) else {
        panic!("expected failure");
    };
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(code_events(&collector, "retry").len(), 2);
    let errors = code_events(&collector, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        collector
            .of_kind(EventKind::Code)
            .iter()
            .filter(|e| e.data["status"] == "error")
            .map(|e| e.level)
            .collect::<Vec<_>>(),
        vec![ReportLevel::Error]
    );
    assert_eq!(failure.reason, "attempt 2 failed");
    assert_eq!(failure.flow_line, Some(1));
    assert_eq!(terminal_events(&collector), 1);
}

#[test]
fn skip_policy_swallows_failures() {
    let (engine, collector) = engine(calc_backend(), EngineConfig::default());
    let mut failing = call("Calc.fail", &[], Some("r"));
    failing["inputList"] = json!([{ "key": "__skip_err__", "value": "skip" }]);
    let project = with_output(vec![failing, add(json!(1), json!(1), "two")], &["r", "two"]);

    let outcome = run(&engine, &project);
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            outputs: BTreeMap::from([
                ("r".to_string(), JsonValue::Null),
                ("two".to_string(), json!(2)),
            ]),
        }
    );
    let skipped = code_events(&collector, "skip");
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["error"], "calculator on fire");
}

#[test]
fn failure_is_located_at_the_flow_line() {
    let (engine, collector) = engine(calc_backend(), EngineConfig::default());
    let project = project(vec![
        add(json!(1), json!(2), "x"),
        call("Calc.fail", &[], None),
        add(json!(3), json!(4), "y"),
    ]);
    let Outcome::Failed(failure) = run(&engine, &project) else {
        panic!("expected failure");
    };
    assert_eq!(failure.reason, "calculator on fire");
    assert_eq!(failure.unit.as_deref(), Some("p1"));
    assert_eq!(failure.flow_line, Some(2));
    assert!(!failure.trace.is_empty());
    let errors = collector.of_kind(EventKind::TaskError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["flowLine"], 2);
}

#[test]
fn failure_reason_follows_the_locale() {
    let divide = add(json!([{ "type": "python", "value": "1 / 0" }]), json!(1), "x");
    for (locale, expected) in [
        (Locale::En, "Numeric error: division by zero"),
        (Locale::Zh, "数值错误：除数不能为零"),
    ] {
        let config = EngineConfig {
            locale,
            ..EngineConfig::default()
        };
        let (engine, _) = engine(calc_backend(), config);
        let Outcome::Failed(failure) = run(&engine, &project(vec![divide.clone()])) else {
            panic!("expected failure");
        };
        assert_eq!(failure.reason, expected);
        assert_eq!(failure.flow_line, Some(1));
    }
}

#[test]
fn unknown_operation_fails() {
    let (engine, _) = engine(calc_backend(), EngineConfig::default());
    let Outcome::Failed(failure) = run(&engine, &project(vec![call("Mail.send", &[], None)])) else {
        panic!("expected failure");
    };
    assert!(failure.reason.contains("Mail.send"));
}

#[test]
fn sub_flow_receives_inputs_and_returns_outputs() {
    let (engine, _) = engine(calc_backend(), EngineConfig::default());
    let child = process(
        "p2",
        "double",
        vec![add(var("n"), var("n"), "out")],
        json!([
            { "varName": "n", "varValue": 0, "varDirection": 0 },
            { "varName": "out", "varValue": 0, "varDirection": 1 }
        ]),
    );
    let main = process(
        "p1",
        "main",
        vec![
            call(
                "Script.process",
                &[("process", json!("p2")), ("n", json!(21))],
                Some("r"),
            ),
        ],
        json!([{ "varName": "r", "varValue": 0, "varDirection": 1 }]),
    );
    let outcome = run(&engine, &project_with(vec![main, child], json!([])));
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            outputs: BTreeMap::from([("r".to_string(), json!(42))]),
        }
    );
}

#[test]
fn globals_are_shared_with_steps() {
    let (engine, _) = engine(calc_backend(), EngineConfig::default());
    let main = process(
        "p1",
        "main",
        vec![add(json!([{ "type": "g_var", "value": "base" }]), json!(1), "y")],
        json!([{ "varName": "y", "varValue": 0, "varDirection": 1 }]),
    );
    let project = project_with(vec![main], json!([{ "varName": "base", "varValue": 41 }]));
    let outcome = run(&engine, &project);
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            outputs: BTreeMap::from([("y".to_string(), json!(42))]),
        }
    );
}

#[test]
fn force_stop_interrupts_a_delay() {
    let (engine, collector) = engine(calc_backend(), EngineConfig::default());
    let mut slow = call("Calc.slow", &[], None);
    slow["inputList"] = json!([{ "key": "__delay_before__", "value": 30 }]);
    let handle = engine.run(&project(vec![slow]), BTreeMap::new()).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    handle.force_stop();
    handle.force_stop();
    assert_eq!(handle.wait(), Outcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(collector.of_kind(EventKind::TaskCancelled).len(), 1);
    assert_eq!(terminal_events(&collector), 1);
}

#[test]
fn print_result_reports_the_value() {
    let (engine, collector) = engine(calc_backend(), EngineConfig::default());
    let mut step = add(json!(2), json!(3), "x");
    step["inputList"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "key": "__res_print__", "value": true }));
    assert!(matches!(run(&engine, &project(vec![step])), Outcome::Succeeded { .. }));
    let results = code_events(&collector, "result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["result"], 5);
}
