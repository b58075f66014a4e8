//! Integration tests for the flow compiler
//!
//! Covers line-map completeness, deterministic output, structural errors
//! and the on-disk artifact layout.

mod common;

use common::{add, call, disabled, keyword, project, var};
use proptest::prelude::*;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeSet;
use tempfile::TempDir;
use weft::compiler::parser::SyntaxIssue;
use weft::compiler::{CompileOptions, CompiledProject, LineSlice, compile_project};

fn assert_one_line_per_step(compiled: &CompiledProject, expected: &BTreeSet<usize>) {
    let unit = compiled.entry_unit().expect("entry unit");
    let map = unit.line_map.as_ref().expect("process units carry a line map");
    let flows: BTreeSet<usize> = map.entries().map(|(_, flow)| flow).collect();
    assert_eq!(&flows, expected);
    assert_eq!(map.len(), expected.len(), "no flow line may map twice");
    for &flow in expected {
        let generated = map.generated_lines(flow);
        assert_eq!(generated.len(), 1, "flow line {flow}");
        assert_eq!(map.flow_line(generated[0]), Some(flow));
        assert_eq!(map.first_generated(flow), Some(generated[0]));
    }
}

#[test]
fn every_surviving_step_maps_to_one_line() {
    let project = project(vec![
        add(json!(1), json!(2), "x"),
        call("forStep", &[("start", json!(0)), ("end", json!(3))], Some("i")),
        add(var("x"), var("i"), "x"),
        disabled(call("Calc.slow", &[], None)),
        keyword("forEnd"),
        call("Calc.slow", &[], None),
    ]);
    let compiled = compile_project(&project, CompileOptions::default()).unwrap();
    assert_one_line_per_step(&compiled, &BTreeSet::from([1, 2, 3, 5, 6]));
}

#[test]
fn retry_wrapper_lines_stay_unmapped() {
    let mut flaky = call("Net.fetch", &[], Some("page"));
    flaky["inputList"] = json!([
        {"key": "__skip_err__", "value": "retry"},
        {"key": "__retry_time__", "value": 2}
    ]);
    let project = project(vec![flaky, call("Calc.slow", &[], None)]);
    let compiled = compile_project(&project, CompileOptions::default()).unwrap();
    assert_one_line_per_step(&compiled, &BTreeSet::from([1, 2]));
    let source = &compiled.entry_unit().unwrap().source;
    assert!(source.contains("__retry_count_1__ = 2"));
}

#[test]
fn slicing_keeps_original_flow_lines() {
    let project = project(vec![
        add(json!(1), json!(1), "a"),
        add(json!(2), json!(2), "b"),
        add(json!(3), json!(3), "c"),
        add(json!(4), json!(4), "d"),
    ]);
    let options = CompileOptions {
        slice: LineSlice { start: 2, end: 3 },
        ..CompileOptions::default()
    };
    let compiled = compile_project(&project, options).unwrap();
    assert_one_line_per_step(&compiled, &BTreeSet::from([2, 3]));
}

#[test]
fn compiling_twice_is_byte_identical() {
    let project = project(vec![
        add(json!(1), json!(2), "x"),
        call("forList", &[("lists", json!([1, 2, 3]))], Some("item")),
        add(var("x"), var("item"), "x"),
        keyword("forEnd"),
    ]);
    let first = compile_project(&project, CompileOptions::default()).unwrap();
    let second = compile_project(&project, CompileOptions::default()).unwrap();
    assert_eq!(first, second);
    let unit = first.entry_unit().unwrap();
    assert_eq!(unit.source, second.entry_unit().unwrap().source);
    assert_eq!(unit.digest, second.entry_unit().unwrap().digest);
}

#[test]
fn break_outside_loop_fails_before_codegen() {
    let project = project(vec![add(json!(1), json!(2), "x"), keyword("break")]);
    let err = compile_project(&project, CompileOptions::default()).unwrap_err();
    let issues = err.syntax_issues().expect("syntax error");
    assert_eq!(
        issues,
        &[SyntaxIssue::LoopControlOutsideLoop {
            line: 2,
            key: "break".to_string(),
        }]
    );
}

#[test]
fn artifacts_round_trip_through_a_directory() {
    let temp = TempDir::new().unwrap();
    let project = project(vec![
        add(json!(1), json!(2), "x"),
        add(var("x"), json!(3), "y"),
    ]);
    let compiled = compile_project(&project, CompileOptions::default()).unwrap();
    compiled.write_to(temp.path()).unwrap();
    assert!(temp.path().join("main.flow").exists());
    assert!(temp.path().join("main.map").exists());

    let loaded = CompiledProject::load_from(temp.path()).unwrap();
    assert_eq!(loaded, compiled);
}

#[test]
fn tampered_artifact_is_rejected() {
    let temp = TempDir::new().unwrap();
    let compiled = compile_project(&project(vec![add(json!(1), json!(2), "x")]), CompileOptions::default())
        .unwrap();
    compiled.write_to(temp.path()).unwrap();
    std::fs::write(temp.path().join("main.flow"), "x = 1\n").unwrap();
    assert!(CompiledProject::load_from(temp.path()).is_err());
}

fn arbitrary_flow() -> impl Strategy<Value = (Vec<JsonValue>, BTreeSet<usize>)> {
    prop::collection::vec((0u8..3, any::<bool>()), 1..25).prop_map(|items| {
        let mut steps = Vec::new();
        let mut expected = BTreeSet::new();
        for (kind, off) in items {
            match kind {
                2 => {
                    steps.push(call("forStep", &[("end", json!(2))], Some("i")));
                    expected.insert(steps.len());
                    let body = add(var("i"), json!(1), "n");
                    steps.push(if off { disabled(body) } else { body });
                    if !off {
                        expected.insert(steps.len());
                    }
                    steps.push(keyword("forEnd"));
                    expected.insert(steps.len());
                }
                _ => {
                    let step = add(json!(kind), json!(1), "n");
                    steps.push(if off { disabled(step) } else { step });
                    if !off {
                        expected.insert(steps.len());
                    }
                }
            }
        }
        (steps, expected)
    })
}

proptest! {
    #[test]
    fn line_map_covers_exactly_the_enabled_steps((steps, expected) in arbitrary_flow()) {
        let compiled = compile_project(&project(steps), CompileOptions::default()).unwrap();
        assert_one_line_per_step(&compiled, &expected);
    }

    #[test]
    fn line_map_text_round_trips((steps, _) in arbitrary_flow()) {
        let compiled = compile_project(&project(steps), CompileOptions::default()).unwrap();
        let map = compiled.entry_unit().unwrap().line_map.clone().unwrap();
        let parsed: weft::compiler::LineMap = map.to_string().parse().unwrap();
        prop_assert_eq!(parsed, map);
    }
}
