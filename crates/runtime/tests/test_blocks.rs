//! Block/CFG tier: instructions, terminators, phi selection, and step
//! bounding.

use serde_json::json;
use spiral_core::ErrorCode;
use spiral_runtime::driver::{EvalOptions, Evaluation, evaluate};
use spiral_runtime::effects::EffectRegistry;
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

fn assign_int(target: &str, value: i64) -> serde_json::Value {
    json!({ "kind": "assign", "target": target,
            "expr": { "kind": "lit", "type": { "kind": "int" }, "value": value } })
}

/// Branch on a boolean into two blocks that meet in a phi.
fn phi_doc(cond: bool) -> serde_json::Value {
    json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "entry",
            "blocks": [
                {
                    "id": "entry",
                    "instructions": [
                        { "kind": "assign", "target": "cond",
                          "expr": { "kind": "lit", "type": { "kind": "bool" }, "value": cond } }
                    ],
                    "terminator": { "kind": "branch", "cond": "cond", "then": "a", "else": "b" }
                },
                {
                    "id": "a",
                    "instructions": [ assign_int("va", 1) ],
                    "terminator": { "kind": "jump", "to": "merge" }
                },
                {
                    "id": "b",
                    "instructions": [ assign_int("vb", 2) ],
                    "terminator": { "kind": "jump", "to": "merge" }
                },
                {
                    "id": "merge",
                    "instructions": [
                        { "kind": "phi", "target": "m",
                          "sources": [ { "block": "a", "value": "va" },
                                       { "block": "b", "value": "vb" } ] }
                    ],
                    "terminator": { "kind": "return", "value": "m" }
                }
            ]
        }],
        "result": "cfg"
    })
}

#[test]
fn test_phi_follows_taken_branch() {
    assert_eq!(eval(phi_doc(true)).result, Value::Int(1));
    assert_eq!(eval(phi_doc(false)).result, Value::Int(2));
}

#[test]
fn test_op_instruction_binds_result() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [{
                "id": "b0",
                "instructions": [
                    assign_int("x", 20),
                    assign_int("y", 22),
                    { "kind": "op", "target": "sum", "ns": "core", "name": "add",
                      "args": ["x", "y"] }
                ],
                "terminator": { "kind": "return", "value": "sum" }
            }]
        }],
        "result": "cfg"
    }));
    assert_eq!(evaluation.result, Value::Int(42));
}

#[test]
fn test_op_error_aborts_block() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [{
                "id": "b0",
                "instructions": [
                    assign_int("x", 1),
                    assign_int("zero", 0),
                    { "kind": "op", "target": "q", "ns": "core", "name": "div",
                      "args": ["x", "zero"] },
                    // Unreached: the error above aborts the block.
                    assign_int("unreached", 7)
                ],
                "terminator": { "kind": "return", "value": "unreached" }
            }]
        }],
        "result": "cfg"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DivideByZero
    );
}

#[test]
fn test_op_operands_read_node_cache() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "ten", "expr": { "kind": "lit", "type": { "kind": "int" }, "value": 10 } },
            {
                "id": "cfg",
                "entry": "b0",
                "blocks": [{
                    "id": "b0",
                    "instructions": [
                        assign_int("one", 1),
                        { "kind": "op", "target": "sum", "ns": "core", "name": "add",
                          "args": ["ten", "one"] }
                    ],
                    "terminator": { "kind": "return", "value": "sum" }
                }]
            }
        ],
        "result": "cfg"
    }));
    assert_eq!(evaluation.result, Value::Int(11));
}

#[test]
fn test_branch_requires_bool() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [
                {
                    "id": "b0",
                    "instructions": [ assign_int("c", 3) ],
                    "terminator": { "kind": "branch", "cond": "c", "then": "t", "else": "t" }
                },
                { "id": "t", "instructions": [],
                  "terminator": { "kind": "return" } }
            ]
        }],
        "result": "cfg"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::TypeError
    );
}

#[test]
fn test_return_without_value_and_exit_yield_void() {
    for terminator in [json!({ "kind": "return" }), json!({ "kind": "exit", "code": 0 })] {
        let evaluation = eval(json!({
            "version": "1.0.0",
            "nodes": [{
                "id": "cfg",
                "entry": "b0",
                "blocks": [ { "id": "b0", "instructions": [], "terminator": terminator } ]
            }],
            "result": "cfg"
        }));
        assert_eq!(evaluation.result, Value::Void);
    }
}

#[test]
fn test_unsupported_instruction_is_domain_error() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [{
                "id": "b0",
                "instructions": [ { "kind": "effect" } ],
                "terminator": { "kind": "return" }
            }]
        }],
        "result": "cfg"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DomainError
    );
}

#[test]
fn test_block_assignment_rejects_complex_expressions() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [{
                "id": "b0",
                "instructions": [
                    { "kind": "assign", "target": "x",
                      "expr": { "kind": "call", "ns": "core", "name": "add", "args": [] } }
                ],
                "terminator": { "kind": "return" }
            }]
        }],
        "result": "cfg"
    }));
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::DomainError
    );
}

#[test]
fn test_spinning_cfg_hits_step_budget() {
    let evaluation = eval_with_budget(
        json!({
            "version": "1.0.0",
            "nodes": [{
                "id": "cfg",
                "entry": "b0",
                "blocks": [
                    { "id": "b0", "instructions": [],
                      "terminator": { "kind": "jump", "to": "b1" } },
                    { "id": "b1", "instructions": [],
                      "terminator": { "kind": "jump", "to": "b0" } }
                ]
            }],
            "result": "cfg"
        }),
        EvalOptions {
            max_steps: 100,
            trace: false,
        },
    );
    assert_eq!(
        evaluation.result.as_error().unwrap().code,
        ErrorCode::NonTermination
    );
}

#[test]
fn test_fork_join_collects_branch_results() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [
                {
                    "id": "b0",
                    "instructions": [ assign_int("x", 40), assign_int("y", 2) ],
                    "terminator": {
                        "kind": "fork",
                        "branches": [ { "block": "left", "bind": "t1" },
                                      { "block": "right", "bind": "t2" } ],
                        "continuation": "meet"
                    }
                },
                {
                    "id": "left",
                    "instructions": [
                        { "kind": "op", "target": "r", "ns": "core", "name": "add",
                          "args": ["x", "y"] }
                    ],
                    "terminator": { "kind": "return", "value": "r" }
                },
                {
                    "id": "right",
                    "instructions": [
                        { "kind": "op", "target": "r", "ns": "core", "name": "mul",
                          "args": ["x", "y"] }
                    ],
                    "terminator": { "kind": "return", "value": "r" }
                },
                {
                    "id": "meet",
                    "instructions": [],
                    "terminator": { "kind": "join", "tasks": ["t1", "t2"],
                                    "results": ["a", "b"], "to": "done" }
                },
                {
                    "id": "done",
                    "instructions": [
                        { "kind": "op", "target": "sum", "ns": "core", "name": "add",
                          "args": ["a", "b"] }
                    ],
                    "terminator": { "kind": "return", "value": "sum" }
                }
            ]
        }],
        "result": "cfg"
    }));
    // (40 + 2) + (40 * 2) = 122
    assert_eq!(evaluation.result, Value::Int(122));
}

#[test]
fn test_spawn_await_instructions() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [
                {
                    "id": "b0",
                    "instructions": [
                        assign_int("n", 21),
                        { "kind": "spawn", "target": "fut", "entry": "worker", "args": ["n"] },
                        { "kind": "await", "target": "out", "future": "fut" }
                    ],
                    "terminator": { "kind": "return", "value": "out" }
                },
                {
                    "id": "worker",
                    "instructions": [
                        assign_int("two", 2),
                        { "kind": "op", "target": "r", "ns": "core", "name": "mul",
                          "args": ["n", "two"] }
                    ],
                    "terminator": { "kind": "return", "value": "r" }
                }
            ]
        }],
        "result": "cfg"
    }));
    assert_eq!(evaluation.result, Value::Int(42));
}

#[test]
fn test_suspend_resumes_with_resolved_value() {
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [{
            "id": "cfg",
            "entry": "b0",
            "blocks": [
                {
                    "id": "b0",
                    "instructions": [
                        assign_int("n", 5),
                        { "kind": "spawn", "target": "fut", "entry": "worker", "args": ["n"] }
                    ],
                    "terminator": { "kind": "suspend", "future": "fut", "resume": "after" }
                },
                {
                    "id": "worker",
                    "instructions": [
                        assign_int("one", 1),
                        { "kind": "op", "target": "r", "ns": "core", "name": "add",
                          "args": ["n", "one"] }
                    ],
                    "terminator": { "kind": "return", "value": "r" }
                },
                {
                    "id": "after",
                    "instructions": [],
                    "terminator": { "kind": "return", "value": "fut" }
                }
            ]
        }],
        "result": "cfg"
    }));
    assert_eq!(evaluation.result, Value::Int(6));
}

#[test]
fn test_channel_ops_in_blocks() {
    // try-send into a channel created at the expression level, then
    // drain it with recv.
    let evaluation = eval(json!({
        "version": "1.0.0",
        "nodes": [
            { "id": "ch", "expr": { "kind": "channel", "chanKind": "mpsc", "capacity": 2 } },
            {
                "id": "cfg",
                "entry": "b0",
                "blocks": [{
                    "id": "b0",
                    "instructions": [
                        { "kind": "assign", "target": "c", "expr": { "kind": "ref", "id": "ch" } },
                        assign_int("v", 11),
                        { "kind": "channelOp", "op": "send", "channel": "c", "value": "v" },
                        { "kind": "channelOp", "op": "recv", "channel": "c", "target": "out" }
                    ],
                    "terminator": { "kind": "return", "value": "out" }
                }]
            }
        ],
        "result": "cfg"
    }));
    assert_eq!(evaluation.result, Value::Int(11));
}
