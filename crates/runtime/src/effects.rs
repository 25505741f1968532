//! Effect registry and effect history.
//!
//! Effects are the named side-effect operations a program invokes through
//! `effect` expressions. Every invocation is recorded in the evaluation
//! state's history, in execution order, whether or not the handler does
//! anything observable; the history is part of the evaluation result.
//!
//! Two stock registries cover the common cases: `console()` executes
//! `print`/`log` against stdout and the tracing subscriber, `queued()`
//! registers the same names with inert handlers so tests can assert on
//! the recorded history alone.

use spiral_core::Type;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;

/// One executed effect: the name and the argument values it received.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRecord {
    pub name: String,
    pub args: Vec<Value>,
}

/// Handler for a named effect.
pub type EffectFn = dyn Fn(&[Value]) -> Value;

/// A registered effect operation.
#[derive(Clone)]
pub struct EffectOp {
    pub name: String,
    pub params: Vec<Type>,
    pub returns: Type,
    pub handler: Rc<EffectFn>,
}

impl std::fmt::Debug for EffectOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectOp")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// Mapping from effect name to handler.
#[derive(Default)]
pub struct EffectRegistry {
    effects: RefCell<HashMap<String, Rc<EffectOp>>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect, overwriting any existing entry of the name.
    pub fn register(&self, effect: EffectOp) {
        self.effects
            .borrow_mut()
            .insert(effect.name.clone(), Rc::new(effect));
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<EffectOp>> {
        self.effects.borrow().get(name).cloned()
    }

    /// Registry whose handlers actually perform I/O: `print` writes the
    /// rendered arguments to stdout, `log` goes to the tracing subscriber.
    pub fn console() -> EffectRegistry {
        let registry = EffectRegistry::new();
        registry.register(EffectOp {
            name: "print".to_string(),
            params: vec![Type::String],
            returns: Type::Void,
            handler: Rc::new(|args| {
                let line = render_args(args);
                println!("{}", line);
                Value::Void
            }),
        });
        registry.register(EffectOp {
            name: "log".to_string(),
            params: vec![Type::String],
            returns: Type::Void,
            handler: Rc::new(|args| {
                tracing::info!(target: "spiral::effect", "{}", render_args(args));
                Value::Void
            }),
        });
        registry
    }

    /// Registry whose handlers record only. The effect history carries the
    /// invocations; the handlers return void without side effects.
    pub fn queued() -> EffectRegistry {
        let registry = EffectRegistry::new();
        for name in ["print", "log"] {
            registry.register(EffectOp {
                name: name.to_string(),
                params: vec![Type::String],
                returns: Type::Void,
                handler: Rc::new(|_| Value::Void),
            });
        }
        registry
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|v| match v {
            Value::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
