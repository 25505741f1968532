//! Stdlib loading: harvesting closures into the registry, two-phase
//! forward references, and failure modes.

use serde_json::json;
use spiral_runtime::driver::{EvalOptions, evaluate};
use spiral_runtime::effects::EffectRegistry;
use spiral_runtime::stdlib::load_batch;
use spiral_runtime::{Document, Value, builtins};
use std::rc::Rc;

fn doc(value: serde_json::Value) -> Document {
    Document::from_json(value).expect("document loads")
}

fn int_lit(value: i64) -> serde_json::Value {
    json!({ "kind": "lit", "type": { "kind": "int" }, "value": value })
}

/// `lib.inc` implemented over the builtin registry.
fn inc_doc() -> Document {
    doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "exports", "expr": { "kind": "record", "fields": {
                "lib.inc": { "kind": "lambda", "params": [ { "name": "x" } ],
                             "body": { "kind": "call", "ns": "core", "name": "add",
                                       "args": [ { "kind": "var", "name": "x" }, int_lit(1) ] } },
                "lib.answer": int_lit(42)
            } } }
        ],
        "result": "exports"
    }))
}

/// `lib.incTwice` calls `lib.inc` through the registry.
fn inc_twice_doc() -> Document {
    doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "exports", "expr": { "kind": "record", "fields": {
                "lib.incTwice": { "kind": "lambda", "params": [ { "name": "x" } ],
                                  "body": { "kind": "call", "ns": "lib", "name": "inc",
                                            "args": [ { "kind": "call", "ns": "lib", "name": "inc",
                                                        "args": [ { "kind": "var", "name": "x" } ] } ] } }
            } } }
        ],
        "result": "exports"
    }))
}

#[test]
fn test_load_and_call_stdlib_operator() {
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    let count = load_batch(&[inc_doc()], &registry, &effects, &EvalOptions::default()).unwrap();
    assert_eq!(count, 2);
    assert!(registry.contains("lib", "inc"));

    let program = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "call", "ns": "lib", "name": "inc",
                                   "args": [int_lit(41)] } }
        ],
        "result": "r"
    }));
    let evaluation = evaluate(program, registry, effects, None, EvalOptions::default());
    assert_eq!(evaluation.result, Value::Int(42));
}

#[test]
fn test_constant_exports_wrap_as_operators() {
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    load_batch(&[inc_doc()], &registry, &effects, &EvalOptions::default()).unwrap();

    let program = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "call", "ns": "lib", "name": "answer", "args": [] } }
        ],
        "result": "r"
    }));
    let evaluation = evaluate(program, registry, effects, None, EvalOptions::default());
    assert_eq!(evaluation.result, Value::Int(42));
}

#[test]
fn test_forward_reference_within_batch() {
    // incTwice loads before inc exists; the closure only calls inc at
    // application time, after the whole batch resolved.
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    load_batch(
        &[inc_twice_doc(), inc_doc()],
        &registry,
        &effects,
        &EvalOptions::default(),
    )
    .unwrap();

    let program = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "call", "ns": "lib", "name": "incTwice",
                                   "args": [int_lit(40)] } }
        ],
        "result": "r"
    }));
    let evaluation = evaluate(program, registry, effects, None, EvalOptions::default());
    assert_eq!(evaluation.result, Value::Int(42));
}

#[test]
fn test_premature_placeholder_invocation_fails_loudly() {
    // This export invokes lib.late while evaluating its own exports,
    // before the defining document loads: phase 1's placeholder makes
    // the batch fail instead of producing garbage.
    let eager = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "exports", "expr": { "kind": "record", "fields": {
                "lib.eager": { "kind": "call", "ns": "lib", "name": "late", "args": [] }
            } } }
        ],
        "result": "exports"
    }));
    let late = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "exports", "expr": { "kind": "record", "fields": {
                "lib.late": int_lit(1)
            } } }
        ],
        "result": "exports"
    }));
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    let error = load_batch(&[eager, late], &registry, &effects, &EvalOptions::default())
        .unwrap_err();
    assert!(error.message.contains("lib.late"), "got: {}", error.message);
}

#[test]
fn test_non_record_result_is_rejected() {
    let bad = doc(json!({
        "version": "1.0.0",
        "nodes": [ { "id": "r", "expr": int_lit(1) } ],
        "result": "r"
    }));
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    let error = load_batch(&[bad], &registry, &effects, &EvalOptions::default()).unwrap_err();
    assert!(error.message.contains("record"), "got: {}", error.message);
}

#[test]
fn test_reloading_overwrites_previous_operators() {
    let registry = builtins::default_registry();
    let effects = Rc::new(EffectRegistry::queued());
    load_batch(&[inc_doc()], &registry, &effects, &EvalOptions::default()).unwrap();

    // A second batch redefines lib.answer.
    let replacement = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "exports", "expr": { "kind": "record", "fields": {
                "lib.answer": int_lit(7)
            } } }
        ],
        "result": "exports"
    }));
    load_batch(&[replacement], &registry, &effects, &EvalOptions::default()).unwrap();

    let program = doc(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "r", "expr": { "kind": "call", "ns": "lib", "name": "answer", "args": [] } }
        ],
        "result": "r"
    }));
    let evaluation = evaluate(program, registry, effects, None, EvalOptions::default());
    assert_eq!(evaluation.result, Value::Int(7));
}
