//! Program driver.
//!
//! Walks a document's nodes in source order, asks the evaluator for a
//! value per node, caches results, and resolves the designated result
//! node. Environment updates made by top-level nodes (EIR `assign`)
//! thread forward from node to node until the first error; after that,
//! nodes still evaluate and cache (so later references observe their
//! errors) but the environment stays frozen.
//!
//! Nodes referenced exclusively from scoped positions (lambda bodies,
//! `let` bodies, `match` arms, `try` catch bodies, loop bodies) are
//! never pre-evaluated here: they mention bindings that only exist once
//! the enclosing form builds its scope.
//!
//! The whole walk runs on a current-thread runtime plus `LocalSet` owned
//! by [`evaluate`]; spawned tasks live and die within that scope, which
//! is what keeps scheduling cooperative and single-threaded.

use spiral_core::Env;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::channel::ChannelStore;
use crate::doc::{Document, Expr, Instruction, Operand, Terminator};
use crate::effects::{EffectRecord, EffectRegistry};
use crate::eval::{Interp, RunCtx, TaskCtx};
use crate::registry::OperatorRegistry;
use crate::sched::Scheduler;
use crate::value::Value;

/// Step budget applied when the caller does not set one.
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

/// Evaluation knobs.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub max_steps: u64,
    pub trace: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            max_steps: DEFAULT_MAX_STEPS,
            trace: false,
        }
    }
}

/// What an evaluation produced: the result value, the ordered effect
/// history, and the number of steps spent.
#[derive(Debug)]
pub struct Evaluation {
    pub result: Value,
    pub effects: Vec<EffectRecord>,
    pub steps: u64,
}

/// Evaluate a document against an operator registry and effect registry,
/// with an optional pre-bound environment.
///
/// Owns its runtime: callers stay synchronous, and every task spawned by
/// the program is confined to this call.
pub fn evaluate(
    doc: Document,
    ops: Rc<OperatorRegistry>,
    effects: Rc<EffectRegistry>,
    inputs: Option<Env<Value>>,
    options: EvalOptions,
) -> Evaluation {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build evaluation runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(doc, ops, effects, inputs, options))
}

async fn run(
    doc: Document,
    ops: Rc<OperatorRegistry>,
    effects: Rc<EffectRegistry>,
    inputs: Option<Env<Value>>,
    options: EvalOptions,
) -> Evaluation {
    let doc = Rc::new(doc);
    let mut nodes = HashMap::new();
    for (idx, node) in doc.nodes.iter().enumerate() {
        nodes.insert(node.id.clone(), idx);
    }
    let mut defs = HashMap::new();
    for (idx, def) in doc.air_defs.iter().enumerate() {
        defs.insert((def.ns.clone(), def.name.clone()), idx);
    }
    let bound = bound_nodes(&doc);
    let run = Rc::new(RunCtx {
        doc: doc.clone(),
        nodes,
        defs,
        bound,
        ops,
        effects,
        cache: RefCell::new(HashMap::new()),
        steps: Cell::new(0),
        max_steps: options.max_steps,
        trace: options.trace,
        sched: Scheduler::new(),
        channels: ChannelStore::new(),
    });
    let root = Interp {
        run: run.clone(),
        task: Rc::new(TaskCtx {
            id: 0,
            env: RefCell::new(inputs.unwrap_or_default()),
            cells: Rc::new(RefCell::new(HashMap::new())),
            effects: RefCell::new(Vec::new()),
        }),
    };

    let mut threading = true;
    for node in &doc.nodes {
        if run.bound.contains(&node.id) {
            continue;
        }
        let before = root.env();
        let value = root.eval_node_body(node, true).await;
        if options.trace {
            tracing::debug!(
                target: "spiral::driver",
                node = %node.id,
                result = %value.type_name(),
                "node evaluated"
            );
        } else {
            tracing::trace!(target: "spiral::driver", node = %node.id, "node evaluated");
        }
        if threading {
            if value.is_error() {
                threading = false;
                root.set_env(before);
            }
        } else {
            root.set_env(before);
        }
    }

    let cached = run.cache.borrow().get(&doc.result).cloned();
    let result = match cached {
        Some(value) => value,
        None => root.resolve_id(&doc.result).await,
    };
    let effects = root.task.effects.take();
    Evaluation {
        result,
        effects,
        steps: run.steps.get(),
    }
}

/// Node ids referenced exclusively from scoped positions. These depend
/// on bindings that do not exist at program level, so the driver must
/// not pre-evaluate them.
fn bound_nodes(doc: &Document) -> HashSet<String> {
    let mut scoped = HashSet::new();
    let mut free = HashSet::new();
    for node in &doc.nodes {
        if let Some(expr) = &node.expr {
            classify_expr(expr, &mut scoped, &mut free);
        }
        if let Some(blocks) = &node.blocks {
            for block in blocks {
                for instruction in &block.instructions {
                    match instruction {
                        Instruction::Assign { expr, .. } => {
                            classify_expr(expr, &mut scoped, &mut free);
                        }
                        Instruction::Op { args, .. } => {
                            for arg in args {
                                free.insert(arg.clone());
                            }
                        }
                        _ => {}
                    }
                }
                if let Terminator::Return { value: Some(value) } = &block.terminator {
                    free.insert(value.clone());
                }
            }
        }
    }
    for def in &doc.air_defs {
        classify_expr(&def.body, &mut scoped, &mut free);
    }
    scoped.retain(|id| !free.contains(id));
    scoped
}

fn scoped_ref(operand: &Operand, scoped: &mut HashSet<String>, free: &mut HashSet<String>) {
    match operand {
        Operand::Node(id) => {
            scoped.insert(id.clone());
        }
        Operand::Expr(expr) => classify_expr(expr, scoped, free),
    }
}

fn free_ref(operand: &Operand, scoped: &mut HashSet<String>, free: &mut HashSet<String>) {
    match operand {
        Operand::Node(id) => {
            free.insert(id.clone());
        }
        Operand::Expr(expr) => classify_expr(expr, scoped, free),
    }
}

fn classify_expr(expr: &Expr, scoped: &mut HashSet<String>, free: &mut HashSet<String>) {
    match expr {
        Expr::Lit { .. }
        | Expr::Var { .. }
        | Expr::Predicate { .. }
        | Expr::RefCell { .. }
        | Expr::Deref { .. }
        | Expr::Channel { .. } => {}
        Expr::Ref { id } => {
            free.insert(id.clone());
        }
        Expr::Call { args, .. } | Expr::AirRef { args, .. } | Expr::Effect { args, .. } => {
            for arg in args {
                free_ref(arg, scoped, free);
            }
        }
        Expr::If { cond, then, otherwise } => {
            free_ref(cond, scoped, free);
            free_ref(then, scoped, free);
            free_ref(otherwise, scoped, free);
        }
        Expr::Let { value, body, .. } => {
            free_ref(value, scoped, free);
            scoped_ref(body, scoped, free);
        }
        Expr::Do { exprs } => {
            for child in exprs {
                free_ref(child, scoped, free);
            }
        }
        Expr::Record { fields } => {
            for child in fields.values() {
                free_ref(child, scoped, free);
            }
        }
        Expr::ListOf { items } => {
            for item in items {
                free_ref(item, scoped, free);
            }
        }
        Expr::Match { value, cases, default } => {
            free_ref(value, scoped, free);
            for case in cases {
                scoped_ref(&case.body, scoped, free);
            }
            if let Some(default) = default {
                scoped_ref(default, scoped, free);
            }
        }
        Expr::Lambda { params, body } => {
            scoped_ref(body, scoped, free);
            for param in params {
                if let Some(default) = &param.default {
                    classify_expr(default, scoped, free);
                }
            }
        }
        Expr::CallExpr { func, args } => {
            free_ref(func, scoped, free);
            for arg in args {
                free_ref(arg, scoped, free);
            }
        }
        Expr::Fix { func } => free_ref(func, scoped, free),
        Expr::Seq { first, then } => {
            free_ref(first, scoped, free);
            free_ref(then, scoped, free);
        }
        Expr::Assign { value, .. } => free_ref(value, scoped, free),
        Expr::While { cond, body } => {
            free_ref(cond, scoped, free);
            free_ref(body, scoped, free);
        }
        Expr::For { init, cond, update, body, .. } => {
            free_ref(init, scoped, free);
            // The loop variable is in scope for the condition, update,
            // and body.
            scoped_ref(cond, scoped, free);
            scoped_ref(update, scoped, free);
            scoped_ref(body, scoped, free);
        }
        Expr::Iter { iterable, body, .. } => {
            free_ref(iterable, scoped, free);
            scoped_ref(body, scoped, free);
        }
        Expr::Try { body, catch, fallback, .. } => {
            free_ref(body, scoped, free);
            scoped_ref(catch, scoped, free);
            if let Some(fallback) = fallback {
                free_ref(fallback, scoped, free);
            }
        }
        Expr::Par { branches } => {
            for branch in branches {
                free_ref(branch, scoped, free);
            }
        }
        Expr::Spawn { body, .. } => free_ref(body, scoped, free),
        Expr::Await { future } => free_ref(future, scoped, free),
        Expr::Send { channel, value } => {
            free_ref(channel, scoped, free);
            free_ref(value, scoped, free);
        }
        Expr::Recv { channel } => free_ref(channel, scoped, free),
        Expr::Select { futures, .. } => {
            for future in futures {
                free_ref(future, scoped, free);
            }
        }
        Expr::Race { tasks } => {
            for task in tasks {
                free_ref(task, scoped, free);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_json(value).unwrap()
    }

    #[test]
    fn test_lambda_bodies_are_bound() {
        let doc = doc(json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "body", "expr": { "kind": "var", "name": "x" } },
                { "id": "f", "expr": { "kind": "lambda", "params": [{ "name": "x" }], "body": "body" } }
            ],
            "result": "f"
        }));
        let bound = bound_nodes(&doc);
        assert!(bound.contains("body"));
        assert!(!bound.contains("f"));
    }

    #[test]
    fn test_free_reference_overrides_scoped() {
        // "body" is a lambda body but also referenced directly; it must
        // stay eligible for pre-evaluation.
        let doc = doc(json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "body", "expr": { "kind": "lit", "type": { "kind": "int" }, "value": 1 } },
                { "id": "f", "expr": { "kind": "lambda", "params": [], "body": "body" } },
                { "id": "use", "expr": { "kind": "ref", "id": "body" } }
            ],
            "result": "use"
        }));
        let bound = bound_nodes(&doc);
        assert!(!bound.contains("body"));
    }

    #[test]
    fn test_match_arms_are_bound() {
        let doc = doc(json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "arm", "expr": { "kind": "lit", "type": { "kind": "int" }, "value": 1 } },
                { "id": "scrutinee", "expr": { "kind": "lit", "type": { "kind": "string" }, "value": "a" } },
                { "id": "m", "expr": {
                    "kind": "match", "value": "scrutinee",
                    "cases": [{ "pattern": "a", "body": "arm" }]
                } }
            ],
            "result": "m"
        }));
        let bound = bound_nodes(&doc);
        assert!(bound.contains("arm"));
        assert!(!bound.contains("scrutinee"));
    }
}
