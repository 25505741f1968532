//! Effectful tier: sequencing, assignment, loops, ref-cells, effect
//! recording, and try/catch.

use serde_json::json;
use spiral_core::ErrorCode;
use spiral_runtime::driver::{EvalOptions, Evaluation, evaluate};
use spiral_runtime::effects::{EffectRecord, EffectRegistry};
use spiral_runtime::{Document, Value, builtins};
use std::rc::Rc;

fn eval(doc: serde_json::Value) -> Evaluation {
    eval_with_budget(doc, EvalOptions::default())
}

fn eval_with_budget(doc: serde_json::Value, options: EvalOptions) -> Evaluation {
    let doc = Document::from_json(doc).expect("document loads");
    evaluate(
        doc,
        builtins::default_registry(),
        Rc::new(EffectRegistry::queued()),
        None,
        options,
    )
}

fn int_lit(value: i64) -> serde_json::Value {
    json!({ "kind": "lit", "type": { "kind": "int" }, "value": value })
}

fn var(name: &str) -> serde_json::Value {
    json!({ "kind": "var", "name": name })
}

fn add(a: serde_json::Value, b: serde_json::Value) -> serde_json::Value {
    json!({ "kind": "call", "ns": "core", "name": "add", "args": [a, b] })
}

#[test]
fn test_seq_threads_state() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": {
                "kind": "seq",
                "first": { "kind": "assign", "target": "x", "value": int_lit(4) },
                "then": add(var("x"), int_lit(1))
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(5));
}

/// The counter loop: five effects in order, void result.
#[test]
fn test_counting_loop_records_effects() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "init", "expr": { "kind": "assign", "target": "counter", "value": int_lit(0) } },
            { "id": "loop", "expr": {
                "kind": "while",
                "cond": { "kind": "call", "ns": "core", "name": "lt",
                          "args": [var("counter"), int_lit(5)] },
                "body": {
                    "kind": "seq",
                    "first": { "kind": "assign", "target": "counter",
                               "value": add(var("counter"), int_lit(1)) },
                    "then": { "kind": "effect", "op": "print", "args": [var("counter")] }
                }
            } }
        ],
        "result": "loop"
    }));
    assert_eq!(evaluation.result, Value::Void);
    let expected: Vec<EffectRecord> = (1..=5)
        .map(|i| EffectRecord {
            name: "print".to_string(),
            args: vec![Value::Int(i)],
        })
        .collect();
    assert_eq!(evaluation.effects, expected);
}

#[test]
fn test_while_condition_must_be_bool() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "while", "cond": int_lit(1), "body": int_lit(0) } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::TypeError
    );
}

#[test]
fn test_runaway_loop_hits_step_budget() {
    let evaluation = eval_with_budget(
        json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "r", "expr": {
                    "kind": "while",
                    "cond": { "kind": "lit", "type": { "kind": "bool" }, "value": true },
                    "body": int_lit(0)
                } }
            ],
            "result": "r"
        }),
        EvalOptions {
            max_steps: 500,
            trace: false,
        },
    );
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::NonTermination
    );
    assert!(evaluation.steps >= 500);
}

#[test]
fn test_for_loop_sums() {
    // for i = 0; i < 4; i = i + 1 { total := total + i }
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "init", "expr": { "kind": "assign", "target": "total", "value": int_lit(0) } },
            { "id": "loop", "expr": {
                "kind": "for", "var": "i",
                "init": int_lit(0),
                "cond": { "kind": "call", "ns": "core", "name": "lt",
                          "args": [var("i"), int_lit(4)] },
                "update": add(var("i"), int_lit(1)),
                "body": { "kind": "assign", "target": "total",
                          "value": add(var("total"), var("i")) }
            } },
            { "id": "r", "expr": var("total") }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(6));
}

#[test]
fn test_for_variable_stays_scoped() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "loop", "expr": {
                "kind": "for", "var": "i",
                "init": int_lit(0),
                "cond": { "kind": "call", "ns": "core", "name": "lt",
                          "args": [var("i"), int_lit(1)] },
                "update": add(var("i"), int_lit(1)),
                "body": int_lit(0)
            } },
            { "id": "r", "expr": var("i") }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::UnboundIdentifier
    );
}

#[test]
fn test_iter_over_list_and_set() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "init", "expr": { "kind": "assign", "target": "total", "value": int_lit(0) } },
            { "id": "xs", "expr": { "kind": "listOf", "items": [int_lit(1), int_lit(2), int_lit(3)] } },
            { "id": "loop", "expr": {
                "kind": "iter", "var": "x", "iterable": "xs",
                "body": { "kind": "assign", "target": "total",
                          "value": add(var("total"), var("x")) }
            } },
            { "id": "r", "expr": var("total") }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(6));

    // Set iteration decodes members from their hash keys; duplicates
    // coalesced first.
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "init", "expr": { "kind": "assign", "target": "total", "value": int_lit(0) } },
            { "id": "s0", "expr": { "kind": "call", "ns": "core", "name": "setNew", "args": [] } },
            { "id": "s1", "expr": { "kind": "call", "ns": "core", "name": "setAdd", "args": ["s0", int_lit(4)] } },
            { "id": "s2", "expr": { "kind": "call", "ns": "core", "name": "setAdd", "args": ["s1", int_lit(4)] } },
            { "id": "s3", "expr": { "kind": "call", "ns": "core", "name": "setAdd", "args": ["s2", int_lit(5)] } },
            { "id": "loop", "expr": {
                "kind": "iter", "var": "x", "iterable": { "kind": "ref", "id": "s3" },
                "body": { "kind": "assign", "target": "total",
                          "value": add(var("total"), var("x")) }
            } },
            { "id": "r", "expr": var("total") }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(9));
}

#[test]
fn test_iter_rejects_non_iterable() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "iter", "var": "x", "iterable": int_lit(1),
                                   "body": int_lit(0) } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::TypeError
    );
}

#[test]
fn test_ref_cell_write_through_alias() {
    // let r = refCell(x); let s = r; assign(r, 5); deref(s) == 5
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "bind", "expr": { "kind": "assign", "target": "x", "value": int_lit(1) } },
            { "id": "r", "expr": {
                "kind": "let", "name": "r", "value": { "kind": "refCell", "target": "x" },
                "body": {
                    "kind": "let", "name": "s", "value": var("r"),
                    "body": {
                        "kind": "seq",
                        "first": { "kind": "assign", "target": "r", "value": int_lit(5) },
                        "then": { "kind": "deref", "target": "s" }
                    }
                }
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(5));
}

#[test]
fn test_assign_writes_lifted_cell_by_name() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "bind", "expr": { "kind": "assign", "target": "x", "value": int_lit(1) } },
            { "id": "lift", "expr": { "kind": "refCell", "target": "x" } },
            { "id": "set", "expr": { "kind": "assign", "target": "x", "value": int_lit(9) } },
            { "id": "r", "expr": { "kind": "deref", "target": "x" } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(9));
}

#[test]
fn test_deref_without_cell_is_domain_error() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "deref", "target": "ghost" } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DomainError
    );
}

#[test]
fn test_ref_cell_requires_bound_target() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "refCell", "target": "ghost" } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::UnboundIdentifier
    );
}

/// try (1/0) catch e -> -1
#[test]
fn test_try_catches_divide_by_zero() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": {
                "kind": "try",
                "try": { "kind": "call", "ns": "core", "name": "div",
                         "args": [int_lit(1), int_lit(0)] },
                "catchParam": "e",
                "catch": int_lit(-1)
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(-1));
}

#[test]
fn test_catch_sees_the_error() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": {
                "kind": "try",
                "try": { "kind": "call", "ns": "core", "name": "div",
                         "args": [int_lit(1), int_lit(0)] },
                "catchParam": "e",
                "catch": { "kind": "call", "ns": "core", "name": "errorCode", "args": [var("e")] }
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Str("DivideByZero".into()));
}

#[test]
fn test_uncaught_error_surfaces() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "call", "ns": "core", "name": "div",
                                   "args": [int_lit(1), int_lit(0)] } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DivideByZero
    );
}

#[test]
fn test_try_fallback_supplies_value_on_success() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": {
                "kind": "try",
                "try": int_lit(1),
                "catchParam": "e",
                "catch": int_lit(-1),
                "fallback": int_lit(99)
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(99));
}

#[test]
fn test_try_preserves_ref_cell_writes() {
    // Writes made before the failure stay visible in the catch body.
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "bind", "expr": { "kind": "assign", "target": "x", "value": int_lit(0) } },
            { "id": "lift", "expr": { "kind": "refCell", "target": "x" } },
            { "id": "r", "expr": {
                "kind": "try",
                "try": {
                    "kind": "seq",
                    "first": { "kind": "assign", "target": "x", "value": int_lit(7) },
                    "then": { "kind": "call", "ns": "core", "name": "div",
                              "args": [int_lit(1), int_lit(0)] }
                },
                "catchParam": "e",
                "catch": { "kind": "deref", "target": "x" }
            } }
        ],
        "result": "r"
    }));
    assert_eq!(evaluation.result, Value::Int(7));
}

#[test]
fn test_unknown_effect_is_domain_error() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "effect", "op": "launch", "args": [] } }
        ],
        "result": "r"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DomainError
    );
    assert!(evaluation.effects.is_empty(), "unknown effects do not record");
}
