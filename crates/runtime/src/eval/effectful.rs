//! Effectful tier: sequencing, assignment, loops, ref-cells, effects,
//! and try/catch.
//!
//! These forms thread the mutable evaluation state: `assign` updates the
//! environment register, ref-cell forms touch the cell heap, `effect`
//! appends to the effect history. Loops carry no bound of their own; the
//! per-expression step counting inside their condition and body is what
//! terminates a runaway loop.

use spiral_core::hash::{self, DecodedKey};
use spiral_core::{ErrorCode, format_panic_payload};
use std::panic::AssertUnwindSafe;

use super::{Interp, propagate};
use crate::doc::Operand;
use crate::effects::EffectRecord;
use crate::value::Value;

impl Interp {
    pub(crate) async fn eval_seq(&self, first: &Operand, then: &Operand) -> Value {
        propagate!(self.resolve_operand(first).await);
        self.resolve_operand(then).await
    }

    /// Bind `target` in the current scope, or write through to its
    /// ref-cell when one exists (either because `target` names a lifted
    /// binding or because it is bound to a ref-cell value).
    pub(crate) async fn eval_assign(&self, target: &str, value: &Operand) -> Value {
        let value = propagate!(self.resolve_operand(value).await);
        let aliased_cell = match self.task.env.borrow().lookup(target) {
            Some(Value::RefCell { cell }) => Some(cell.clone()),
            _ => None,
        };
        if let Some(cell) = aliased_cell {
            self.task.cells.borrow_mut().insert(cell, value);
            return Value::Void;
        }
        let lifted = cell_id(target);
        if self.task.cells.borrow().contains_key(&lifted) {
            self.task.cells.borrow_mut().insert(lifted, value);
            return Value::Void;
        }
        let env = self.env().extend(target.to_string(), value);
        self.set_env(env);
        Value::Void
    }

    pub(crate) async fn eval_while(&self, cond: &Operand, body: &Operand) -> Value {
        let mut last = Value::Void;
        loop {
            let test = propagate!(self.resolve_operand(cond).await);
            match test {
                Value::Bool(true) => {}
                Value::Bool(false) => return last,
                other => {
                    return Value::error(
                        ErrorCode::TypeError,
                        format!("while condition must be bool, got {}", other.type_name()),
                    );
                }
            }
            last = propagate!(self.resolve_operand(body).await);
        }
    }

    pub(crate) async fn eval_for(
        &self,
        var: &str,
        init: &Operand,
        cond: &Operand,
        update: &Operand,
        body: &Operand,
    ) -> Value {
        let init = propagate!(self.resolve_operand(init).await);
        let saved = self.env();
        self.set_env(saved.extend(var.to_string(), init));
        let result = self.for_iterations(var, cond, update, body).await;
        self.set_env(saved);
        result
    }

    async fn for_iterations(
        &self,
        var: &str,
        cond: &Operand,
        update: &Operand,
        body: &Operand,
    ) -> Value {
        let mut last = Value::Void;
        loop {
            let test = propagate!(self.resolve_operand(cond).await);
            match test {
                Value::Bool(true) => {}
                Value::Bool(false) => return last,
                other => {
                    return Value::error(
                        ErrorCode::TypeError,
                        format!("for condition must be bool, got {}", other.type_name()),
                    );
                }
            }
            last = propagate!(self.resolve_operand(body).await);
            let next = propagate!(self.resolve_operand(update).await);
            let env = self.env().extend(var.to_string(), next);
            self.set_env(env);
        }
    }

    /// Iterate a list or set. Set elements come back from their hash
    /// keys, so only primitive members iterate; any other key prefix is
    /// a type error.
    pub(crate) async fn eval_iter(&self, var: &str, iterable: &Operand, body: &Operand) -> Value {
        let iterable = propagate!(self.resolve_operand(iterable).await);
        let items: Vec<Value> = match &iterable {
            Value::List(items) => items.as_ref().clone(),
            Value::Set(entries) => {
                let mut items = Vec::with_capacity(entries.len());
                for key in entries.keys() {
                    match hash::decode_key(key) {
                        Ok(DecodedKey::Int(i)) => items.push(Value::Int(i)),
                        Ok(DecodedKey::Bool(b)) => items.push(Value::Bool(b)),
                        Ok(DecodedKey::Float(f)) => items.push(Value::Float(f)),
                        Ok(DecodedKey::Str(s)) => items.push(Value::Str(s)),
                        Err(code) => {
                            return Value::error(
                                code,
                                format!("set member '{}' does not iterate", key),
                            );
                        }
                    }
                }
                items
            }
            other => {
                return Value::error(
                    ErrorCode::TypeError,
                    format!("iter expects a list or set, got {}", other.type_name()),
                );
            }
        };
        let saved = self.env();
        let mut last = Value::Void;
        for item in items {
            self.set_env(saved.extend(var.to_string(), item));
            let value = self.resolve_operand(body).await;
            if value.is_error() {
                self.set_env(saved);
                return value;
            }
            last = value;
        }
        self.set_env(saved);
        last
    }

    /// Execute a named effect: record it, then run the handler. Handler
    /// panics become `DomainError` values; the record stays either way,
    /// because the effect was reached.
    pub(crate) async fn eval_effect(&self, op: &str, args: &[Operand]) -> Value {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(propagate!(self.resolve_operand(arg).await));
        }
        let Some(effect) = self.run.effects.lookup(op) else {
            return Value::error(ErrorCode::DomainError, format!("unknown effect '{}'", op));
        };
        self.task.effects.borrow_mut().push(EffectRecord {
            name: op.to_string(),
            args: values.clone(),
        });
        let handler = effect.handler.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&values))) {
            Ok(value) => value,
            Err(payload) => Value::error(
                ErrorCode::DomainError,
                format!("effect '{}' panicked: {}", op, format_panic_payload(&payload)),
            ),
        }
    }

    /// Lift a bound identifier into a heap cell, initialized to its
    /// current value.
    pub(crate) fn eval_ref_cell(&self, target: &str) -> Value {
        let Some(current) = self.task.env.borrow().lookup(target).cloned() else {
            return Value::error(
                ErrorCode::UnboundIdentifier,
                format!("refCell target '{}' is not bound", target),
            );
        };
        let cell = cell_id(target);
        self.task.cells.borrow_mut().insert(cell.clone(), current);
        Value::RefCell { cell }
    }

    /// Read a ref-cell, through an alias binding or by target name.
    pub(crate) fn eval_deref(&self, target: &str) -> Value {
        let aliased_cell = match self.task.env.borrow().lookup(target) {
            Some(Value::RefCell { cell }) => Some(cell.clone()),
            _ => None,
        };
        let cell = aliased_cell.unwrap_or_else(|| cell_id(target));
        match self.task.cells.borrow().get(&cell) {
            Some(value) => value.clone(),
            None => Value::error(
                ErrorCode::DomainError,
                format!("no ref-cell for '{}'", target),
            ),
        }
    }

    /// Try/catch with optional fallback. The catch body sees the error
    /// under `catch_param`; ref-cell writes made inside the try body
    /// survive into the catch. A present fallback runs after a
    /// successful body and supplies the final value.
    pub(crate) async fn eval_try(
        &self,
        body: &Operand,
        catch_param: &str,
        catch: &Operand,
        fallback: Option<&Operand>,
    ) -> Value {
        let outcome = self.resolve_operand(body).await;
        if outcome.is_error() {
            let saved = self.env();
            self.set_env(saved.extend(catch_param.to_string(), outcome));
            let handled = self.resolve_operand(catch).await;
            self.set_env(saved);
            return handled;
        }
        match fallback {
            Some(fallback) => self.resolve_operand(fallback).await,
            None => outcome,
        }
    }
}

/// Stable cell id for a lifted binding.
fn cell_id(target: &str) -> String {
    format!("{}_ref", target)
}
