//! The polymorphic evaluator.
//!
//! One interpreter serves all five dialects. This module carries the
//! shared plumbing (run context, per-task state, operand resolution,
//! step accounting) and the pure + higher-order expression tier; the
//! sibling modules extend the same `Interp` with the block tier
//! ([`blocks`]), the effectful tier ([`effectful`]), and the concurrent
//! tier ([`concurrent`]). Dispatch is a single exhaustive match, so an
//! expression kind unknown to every tier is impossible and a construct
//! unsupported where it appears yields a `DomainError` value instead of
//! a host failure.
//!
//! Every evaluation method is async: the concurrent tier suspends at
//! await/send/recv/select/race points, and the lower tiers simply never
//! yield. Recursion goes through [`Interp::eval_expr`], which boxes its
//! future.

mod blocks;
mod concurrent;
mod effectful;

use futures::future::LocalBoxFuture;
use serde_json::Value as JsonValue;
use spiral_core::{Env, ErrorCode, Type, format_panic_payload};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use crate::channel::ChannelStore;
use crate::doc::{Document, Expr, Node, Operand};
use crate::effects::{EffectRecord, EffectRegistry};
use crate::registry::{OpImpl, OperatorRegistry};
use crate::sched::Scheduler;
use crate::value::{ClosureData, TaskId, Value};

/// Return the value unless it is an error, in which case propagate it.
macro_rules! propagate {
    ($value:expr) => {{
        let value = $value;
        if value.is_error() {
            return value;
        }
        value
    }};
}
pub(crate) use propagate;

/// State shared by every task of one evaluation run.
pub(crate) struct RunCtx {
    pub doc: Rc<Document>,
    /// Node id to index in `doc.nodes`.
    pub nodes: HashMap<String, usize>,
    /// (namespace, name) to index in `doc.air_defs`.
    pub defs: HashMap<(String, String), usize>,
    /// Nodes referenced exclusively from scoped positions (lambda bodies,
    /// `let` bodies, `match` arms); never pre-evaluated by the driver.
    pub bound: HashSet<String>,
    pub ops: Rc<OperatorRegistry>,
    pub effects: Rc<EffectRegistry>,
    /// Per-run node value cache.
    pub cache: RefCell<HashMap<String, Value>>,
    /// Global step counter, shared by all tasks.
    pub steps: Cell<u64>,
    pub max_steps: u64,
    pub trace: bool,
    pub sched: Scheduler,
    pub channels: ChannelStore,
}

/// Per-task evaluation state. The environment is a register: expression
/// forms that scope a binding save it, swap in the extension, and restore
/// it on the way out. Ref-cells live in a heap shared with child tasks so
/// cell identity survives task boundaries.
pub(crate) struct TaskCtx {
    pub id: TaskId,
    pub env: RefCell<Env<Value>>,
    pub cells: Rc<RefCell<HashMap<String, Value>>>,
    pub effects: RefCell<Vec<EffectRecord>>,
}

/// Interpreter handle: the shared run context plus the current task.
#[derive(Clone)]
pub(crate) struct Interp {
    pub run: Rc<RunCtx>,
    pub task: Rc<TaskCtx>,
}

impl Interp {
    /// Count one step; exhausting the budget is a `NonTermination` error
    /// at the current frame.
    pub(crate) fn tick(&self) -> Result<(), Value> {
        let steps = self.run.steps.get() + 1;
        self.run.steps.set(steps);
        if steps > self.run.max_steps {
            Err(Value::error(
                ErrorCode::NonTermination,
                format!("step budget exhausted (max {})", self.run.max_steps),
            ))
        } else {
            Ok(())
        }
    }

    pub(crate) fn env(&self) -> Env<Value> {
        self.task.env.borrow().clone()
    }

    pub(crate) fn set_env(&self, env: Env<Value>) {
        *self.task.env.borrow_mut() = env;
    }

    pub(crate) fn node(&self, id: &str) -> Option<&Node> {
        self.run.nodes.get(id).map(|&idx| &self.run.doc.nodes[idx])
    }

    /// Evaluate one expression in the current task state.
    pub(crate) fn eval_expr<'a>(&'a self, expr: &'a Expr) -> LocalBoxFuture<'a, Value> {
        Box::pin(async move {
            if let Err(e) = self.tick() {
                return e;
            }
            match expr {
                // Pure tier
                Expr::Lit { ty, value } => decode_literal(ty, value),
                Expr::Var { name } => match self.task.env.borrow().lookup(name) {
                    Some(v) => v.clone(),
                    None => Value::error(
                        ErrorCode::UnboundIdentifier,
                        format!("unbound identifier '{}'", name),
                    ),
                },
                Expr::Ref { id } => self.eval_ref(id).await,
                Expr::Call { ns, name, args } => self.eval_call(ns, name, args).await,
                Expr::If { cond, then, otherwise } => {
                    let cond = propagate!(self.resolve_operand(cond).await);
                    match cond {
                        Value::Bool(true) => self.resolve_operand(then).await,
                        Value::Bool(false) => self.resolve_operand(otherwise).await,
                        other => Value::error(
                            ErrorCode::TypeError,
                            format!("if condition must be bool, got {}", other.type_name()),
                        ),
                    }
                }
                Expr::Let { name, value, body } => {
                    let value = propagate!(self.resolve_operand(value).await);
                    let saved = self.env();
                    self.set_env(saved.extend(name.clone(), value));
                    let result = self.resolve_operand(body).await;
                    self.set_env(saved);
                    result
                }
                Expr::Do { exprs } => {
                    let mut last = Value::Void;
                    for child in exprs {
                        last = propagate!(self.resolve_operand(child).await);
                    }
                    last
                }
                Expr::Record { fields } => {
                    let mut entries = indexmap::IndexMap::new();
                    for (key, child) in fields {
                        let value = propagate!(self.resolve_operand(child).await);
                        entries.insert(spiral_core::hash::str_key(key), value);
                    }
                    Value::Map(Rc::new(entries))
                }
                Expr::ListOf { items } => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(propagate!(self.resolve_operand(item).await));
                    }
                    Value::List(Rc::new(values))
                }
                Expr::Match { value, cases, default } => {
                    let scrutinee = propagate!(self.resolve_operand(value).await);
                    let Value::Str(scrutinee) = scrutinee else {
                        return Value::error(
                            ErrorCode::TypeError,
                            format!("match scrutinee must be string, got {}", scrutinee.type_name()),
                        );
                    };
                    for case in cases {
                        if case.pattern == scrutinee {
                            return self.resolve_operand(&case.body).await;
                        }
                    }
                    match default {
                        Some(fallback) => self.resolve_operand(fallback).await,
                        None => Value::error(
                            ErrorCode::DomainError,
                            format!("no match arm for '{}'", scrutinee),
                        ),
                    }
                }
                Expr::Lambda { params, body } => {
                    let body = match self.operand_expr(body) {
                        Ok(body) => body,
                        Err(e) => return e,
                    };
                    Value::Closure(Rc::new(RefCell::new(ClosureData {
                        params: params.clone(),
                        body,
                        env: self.env(),
                    })))
                }
                Expr::CallExpr { func, args } => {
                    let func = propagate!(self.resolve_operand(func).await);
                    let Value::Closure(closure) = func else {
                        return Value::error(
                            ErrorCode::TypeError,
                            format!("callExpr expects a closure, got {}", func.type_name()),
                        );
                    };
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(propagate!(self.resolve_operand(arg).await));
                    }
                    self.apply_closure(&closure, values).await
                }
                Expr::Fix { func } => self.eval_fix(func).await,
                Expr::AirRef { ns, name, args } => self.eval_air_ref(ns, name, args).await,
                Expr::Predicate { id } => {
                    if self.run.cache.borrow().contains_key(id) {
                        Value::Bool(true)
                    } else {
                        Value::error(
                            ErrorCode::DomainError,
                            format!("predicate target '{}' has not been evaluated", id),
                        )
                    }
                }

                // Effectful tier
                Expr::Seq { first, then } => self.eval_seq(first, then).await,
                Expr::Assign { target, value } => self.eval_assign(target, value).await,
                Expr::While { cond, body } => self.eval_while(cond, body).await,
                Expr::For { var, init, cond, update, body } => {
                    self.eval_for(var, init, cond, update, body).await
                }
                Expr::Iter { var, iterable, body } => self.eval_iter(var, iterable, body).await,
                Expr::Effect { op, args } => self.eval_effect(op, args).await,
                Expr::RefCell { target } => self.eval_ref_cell(target),
                Expr::Deref { target } => self.eval_deref(target),
                Expr::Try { body, catch_param, catch, fallback } => {
                    self.eval_try(body, catch_param, catch, fallback.as_ref()).await
                }

                // Concurrent tier
                Expr::Par { branches } => self.eval_par(branches).await,
                Expr::Spawn { body, .. } => self.eval_spawn(body),
                Expr::Await { future } => self.eval_await(future).await,
                Expr::Channel { kind, capacity } => self.eval_channel(*kind, *capacity),
                Expr::Send { channel, value } => self.eval_send(channel, value).await,
                Expr::Recv { channel } => self.eval_recv(channel).await,
                Expr::Select { futures, timeout } => self.eval_select(futures, *timeout).await,
                Expr::Race { tasks } => self.eval_race(tasks).await,
            }
        })
    }

    /// Resolve a child position: inline expressions evaluate, node ids
    /// resolve through the cache or the environment.
    pub(crate) async fn resolve_operand(&self, operand: &Operand) -> Value {
        match operand {
            Operand::Expr(expr) => self.eval_expr(expr).await,
            Operand::Node(id) => self.resolve_id(id).await,
        }
    }

    /// Resolve a symbolic operand: known node first (re-evaluating
    /// order-sensitive and scoped nodes under the current environment),
    /// then the environment.
    pub(crate) async fn resolve_id(&self, id: &str) -> Value {
        if let Some(&idx) = self.run.nodes.get(id) {
            let node = &self.run.doc.nodes[idx];
            let scope_dependent = self.run.bound.contains(id)
                || node.expr.as_ref().is_some_and(Expr::order_sensitive);
            if scope_dependent {
                return self.eval_node_body(node, false).await;
            }
            let cached = self.run.cache.borrow().get(id).cloned();
            if let Some(value) = cached {
                return value;
            }
            return self.eval_node_body(node, true).await;
        }
        if let Some(value) = self.task.env.borrow().lookup(id) {
            return value.clone();
        }
        Value::error(
            ErrorCode::DomainError,
            format!("unknown node or binding '{}'", id),
        )
    }

    /// `ref` semantics: cached value, or evaluate-and-cache.
    pub(crate) async fn eval_ref(&self, id: &str) -> Value {
        let cached = self.run.cache.borrow().get(id).cloned();
        if let Some(value) = cached {
            return value;
        }
        match self.node(id) {
            Some(node) => self.eval_node_body(node, true).await,
            None => Value::error(ErrorCode::DomainError, format!("unknown node '{}'", id)),
        }
    }

    /// Evaluate a node's body (expression or CFG), optionally caching the
    /// result under the node id.
    pub(crate) fn eval_node_body<'a>(
        &'a self,
        node: &'a Node,
        cache: bool,
    ) -> LocalBoxFuture<'a, Value> {
        Box::pin(async move {
            let value = match (&node.expr, &node.blocks) {
                (Some(expr), _) => self.eval_expr(expr).await,
                (None, Some(_)) => self.eval_cfg_node(node).await,
                (None, None) => Value::error(
                    ErrorCode::DomainError,
                    format!("node '{}' has no body", node.id),
                ),
            };
            if cache {
                self.run
                    .cache
                    .borrow_mut()
                    .insert(node.id.clone(), value.clone());
            }
            value
        })
    }

    /// Resolve an operand to an expression without evaluating it, for
    /// positions that consume syntax (lambda bodies).
    pub(crate) fn operand_expr(&self, operand: &Operand) -> Result<Rc<Expr>, Value> {
        match operand {
            Operand::Expr(expr) => Ok(Rc::new((**expr).clone())),
            Operand::Node(id) => match self.node(id) {
                Some(node) => match &node.expr {
                    Some(expr) => Ok(Rc::new(expr.clone())),
                    None => Err(Value::error(
                        ErrorCode::DomainError,
                        format!("node '{}' is not an expression", id),
                    )),
                },
                None => Err(Value::error(
                    ErrorCode::DomainError,
                    format!("unknown node '{}'", id),
                )),
            },
        }
    }

    async fn eval_call(&self, ns: &str, name: &str, args: &[Operand]) -> Value {
        // The error test is the one operator that takes errors as data.
        let inspects_errors = ns == "core" && name == "isError";
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.resolve_operand(arg).await;
            if value.is_error() && !inspects_errors {
                return value;
            }
            values.push(value);
        }
        self.dispatch_operator(ns, name, values).await
    }

    /// Invoke a registered operator. Native panics become `DomainError`
    /// values here; closure-backed operators go through the ordinary
    /// application protocol, which does its own arity checking.
    pub(crate) async fn dispatch_operator(&self, ns: &str, name: &str, args: Vec<Value>) -> Value {
        let Some(op) = self.run.ops.lookup(ns, name) else {
            return Value::error(
                ErrorCode::UnknownOperator,
                format!("unknown operator '{}.{}'", ns, name),
            );
        };
        match &op.imp {
            OpImpl::Pending => Value::error(
                ErrorCode::DomainError,
                format!("operator '{}' is not loaded yet", op.qualified()),
            ),
            OpImpl::Native(f) => {
                if args.len() != op.params.len() {
                    return Value::error(
                        ErrorCode::ArityError,
                        format!(
                            "'{}' expects {} arguments, got {}",
                            op.qualified(),
                            op.params.len(),
                            args.len()
                        ),
                    );
                }
                let f = f.clone();
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(&args))) {
                    Ok(value) => value,
                    Err(payload) => Value::error(
                        ErrorCode::DomainError,
                        format!(
                            "operator '{}' panicked: {}",
                            op.qualified(),
                            format_panic_payload(&payload)
                        ),
                    ),
                }
            }
            OpImpl::Closure(value) => {
                let Value::Closure(closure) = value else {
                    return Value::error(
                        ErrorCode::DomainError,
                        format!("operator '{}' wraps a non-closure", op.qualified()),
                    );
                };
                let closure = closure.clone();
                self.apply_closure(&closure, args).await
            }
            OpImpl::Eval => self.eval_operator(ns, name, args).await,
        }
    }

    /// Apply a closure to argument values.
    ///
    /// With `n` parameters of which `m` are required: fewer than `m` or
    /// more than `n` arguments is an arity error. Missing optionals take
    /// their default, evaluated in the closure's captured environment,
    /// or the undefined sentinel (empty option) when they have none.
    pub(crate) async fn apply_closure(
        &self,
        closure: &Rc<RefCell<ClosureData>>,
        args: Vec<Value>,
    ) -> Value {
        let (params, body, captured) = {
            let data = closure.borrow();
            (data.params.clone(), data.body.clone(), data.env.clone())
        };
        let required = params.iter().filter(|p| !p.optional).count();
        if args.len() < required {
            return Value::error(
                ErrorCode::ArityError,
                format!(
                    "too few arguments: expected at least {}, got {}",
                    required,
                    args.len()
                ),
            );
        }
        if args.len() > params.len() {
            return Value::error(
                ErrorCode::ArityError,
                format!(
                    "too many arguments: expected at most {}, got {}",
                    params.len(),
                    args.len()
                ),
            );
        }
        let mut env = captured.clone();
        for (i, param) in params.iter().enumerate() {
            let value = if i < args.len() {
                args[i].clone()
            } else if let Some(default) = &param.default {
                let saved = self.env();
                self.set_env(captured.clone());
                let value = self.eval_expr(default).await;
                self.set_env(saved);
                propagate!(value)
            } else {
                Value::none()
            };
            env = env.extend(param.name.clone(), value);
        }
        let saved = self.env();
        self.set_env(env);
        let result = self.eval_expr(&body).await;
        self.set_env(saved);
        result
    }

    /// Build a self-referential closure.
    ///
    /// A placeholder closure is bound under the parameter name, the
    /// body runs against that binding, and the placeholder's record is
    /// then rewritten to the resulting closure, closing the cycle so
    /// that `fix(f) = f(fix(f))`.
    async fn eval_fix(&self, func: &Operand) -> Value {
        let func = propagate!(self.resolve_operand(func).await);
        let Value::Closure(func) = func else {
            return Value::error(
                ErrorCode::TypeError,
                format!("fix expects a closure, got {}", func.type_name()),
            );
        };
        let (params, body, captured) = {
            let data = func.borrow();
            (data.params.clone(), data.body.clone(), data.env.clone())
        };
        if params.len() != 1 {
            return Value::error(
                ErrorCode::ArityError,
                format!("fix expects a single-parameter closure, got {}", params.len()),
            );
        }
        let placeholder = Rc::new(RefCell::new(ClosureData {
            params: Vec::new(),
            body: Rc::new(Expr::Lit {
                ty: Type::Void,
                value: JsonValue::Null,
            }),
            env: Env::empty(),
        }));
        let saved = self.env();
        self.set_env(captured.extend(params[0].name.clone(), Value::Closure(placeholder.clone())));
        let result = self.eval_expr(&body).await;
        self.set_env(saved);
        let result = propagate!(result);
        let Value::Closure(fixed) = result else {
            return Value::error(
                ErrorCode::TypeError,
                format!("fix body must produce a closure, got {}", result.type_name()),
            );
        };
        if !Rc::ptr_eq(&fixed, &placeholder) {
            *placeholder.borrow_mut() = fixed.borrow().clone();
        }
        Value::Closure(fixed)
    }

    /// Invoke a named routine from the defs table: arity-checked, body
    /// evaluated in a fresh environment holding only the parameters.
    async fn eval_air_ref(&self, ns: &str, name: &str, args: &[Operand]) -> Value {
        let Some(&idx) = self.run.defs.get(&(ns.to_string(), name.to_string())) else {
            return Value::error(
                ErrorCode::UnknownDefinition,
                format!("unknown definition '{}.{}'", ns, name),
            );
        };
        let def = &self.run.doc.air_defs[idx];
        if args.len() != def.params.len() {
            return Value::error(
                ErrorCode::ArityError,
                format!(
                    "'{}.{}' expects {} arguments, got {}",
                    ns,
                    name,
                    def.params.len(),
                    args.len()
                ),
            );
        }
        let mut env = Env::empty();
        for (param, arg) in def.params.iter().zip(args) {
            let value = propagate!(self.resolve_operand(arg).await);
            env = env.extend(param.clone(), value);
        }
        let saved = self.env();
        self.set_env(env);
        let result = self.eval_expr(&def.body).await;
        self.set_env(saved);
        result
    }

    /// Operators implemented by re-entering the evaluator (the
    /// higher-order list operators).
    async fn eval_operator(&self, ns: &str, name: &str, args: Vec<Value>) -> Value {
        match (ns, name) {
            ("core", "listMap") => {
                let [list, func] = &args[..] else {
                    return arity_error("core.listMap", 2, args.len());
                };
                let (items, closure) = match hof_args(list, func, "core.listMap") {
                    Ok(pair) => pair,
                    Err(e) => return e,
                };
                let mut mapped = Vec::with_capacity(items.len());
                for item in items.iter() {
                    mapped.push(propagate!(
                        self.apply_closure(&closure, vec![item.clone()]).await
                    ));
                }
                Value::List(Rc::new(mapped))
            }
            ("core", "listFilter") => {
                let [list, func] = &args[..] else {
                    return arity_error("core.listFilter", 2, args.len());
                };
                let (items, closure) = match hof_args(list, func, "core.listFilter") {
                    Ok(pair) => pair,
                    Err(e) => return e,
                };
                let mut kept = Vec::new();
                for item in items.iter() {
                    let keep = propagate!(self.apply_closure(&closure, vec![item.clone()]).await);
                    match keep {
                        Value::Bool(true) => kept.push(item.clone()),
                        Value::Bool(false) => {}
                        other => {
                            return Value::error(
                                ErrorCode::TypeError,
                                format!(
                                    "core.listFilter predicate must return bool, got {}",
                                    other.type_name()
                                ),
                            );
                        }
                    }
                }
                Value::List(Rc::new(kept))
            }
            ("core", "listFold") => {
                let [list, init, func] = &args[..] else {
                    return arity_error("core.listFold", 3, args.len());
                };
                let (items, closure) = match hof_args(list, func, "core.listFold") {
                    Ok(pair) => pair,
                    Err(e) => return e,
                };
                let mut acc = init.clone();
                for item in items.iter() {
                    acc = propagate!(
                        self.apply_closure(&closure, vec![acc, item.clone()]).await
                    );
                }
                acc
            }
            ("core", "chanClose") => match self.channel_arg(&args, "core.chanClose") {
                Ok(chan) => {
                    chan.close();
                    Value::Void
                }
                Err(e) => e,
            },
            ("core", "chanSize") => match self.channel_arg(&args, "core.chanSize") {
                Ok(chan) => Value::Int(chan.size() as i64),
                Err(e) => e,
            },
            _ => Value::error(
                ErrorCode::DomainError,
                format!("no evaluator implementation for '{}.{}'", ns, name),
            ),
        }
    }

    fn channel_arg(&self, args: &[Value], qualified: &str) -> Result<Rc<crate::channel::Chan>, Value> {
        let [channel] = args else {
            return Err(arity_error(qualified, 1, args.len()));
        };
        let Value::Channel { id, .. } = channel else {
            return Err(Value::error(
                ErrorCode::TypeError,
                format!("'{}' expects a channel, got {}", qualified, channel.type_name()),
            ));
        };
        self.run.channels.get(*id).ok_or_else(|| {
            Value::error(ErrorCode::DomainError, format!("unknown channel {}", id))
        })
    }
}

fn arity_error(qualified: &str, expected: usize, got: usize) -> Value {
    Value::error(
        ErrorCode::ArityError,
        format!("'{}' expects {} arguments, got {}", qualified, expected, got),
    )
}

fn hof_args(
    list: &Value,
    func: &Value,
    qualified: &str,
) -> Result<(Rc<Vec<Value>>, Rc<RefCell<ClosureData>>), Value> {
    let Value::List(items) = list else {
        return Err(Value::error(
            ErrorCode::TypeError,
            format!("'{}' expects a list, got {}", qualified, list.type_name()),
        ));
    };
    let Value::Closure(closure) = func else {
        return Err(Value::error(
            ErrorCode::TypeError,
            format!("'{}' expects a closure, got {}", qualified, func.type_name()),
        ));
    };
    Ok((items.clone(), closure.clone()))
}

/// Decode a literal payload against its declared type. Complex literal
/// kinds are produced by other expression forms, not `lit`; meeting one
/// here is a type error.
fn decode_literal(ty: &Type, raw: &JsonValue) -> Value {
    match ty {
        Type::Bool => match raw.as_bool() {
            Some(b) => Value::Bool(b),
            None => literal_type_error("bool", raw),
        },
        Type::Int => match raw.as_i64() {
            Some(i) => Value::Int(i),
            None => literal_type_error("int", raw),
        },
        Type::Float => match raw.as_f64() {
            Some(f) => Value::Float(f),
            None => literal_type_error("float", raw),
        },
        Type::String => match raw.as_str() {
            Some(s) => Value::Str(s.to_string()),
            None => literal_type_error("string", raw),
        },
        Type::Void => Value::Void,
        other => Value::error(
            ErrorCode::TypeError,
            format!("unsupported literal kind '{}'", other.kind_name()),
        ),
    }
}

fn literal_type_error(expected: &str, raw: &JsonValue) -> Value {
    Value::error(
        ErrorCode::TypeError,
        format!("{} literal has incompatible payload {}", expected, raw),
    )
}
