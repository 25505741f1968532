//! Operator registry.
//!
//! Operators are the callable surface a program reaches through `call`
//! expressions and `op` instructions: addressed by (namespace, name),
//! carrying a signature and a purity flag. Registration is additive;
//! re-registering a key overwrites, which is what the stdlib loader's
//! two-phase bootstrap relies on.
//!
//! Operators are not values. The one concession is `OpImpl::Closure`,
//! which lets the stdlib loader expose harvested closures through the
//! registry; the evaluator applies those through its ordinary call path,
//! so programs cannot tell wrapped closures from natives.

use spiral_core::Type;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;

/// Native operator implementation.
pub type NativeFn = dyn Fn(&[Value]) -> Value;

/// How an operator is implemented.
#[derive(Clone)]
pub enum OpImpl {
    /// Host function. Panics are caught at the dispatch boundary and
    /// become `DomainError` values.
    Native(Rc<NativeFn>),
    /// A closure harvested from a stdlib document, applied through the
    /// evaluator.
    Closure(Value),
    /// Implemented inside the evaluator (operators that re-enter
    /// evaluation, such as the higher-order list operators).
    Eval,
    /// Phase-1 stdlib placeholder. Invoking one yields `DomainError`
    /// naming the operator.
    Pending,
}

impl std::fmt::Debug for OpImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OpImpl::Native(_) => "Native",
            OpImpl::Closure(_) => "Closure",
            OpImpl::Eval => "Eval",
            OpImpl::Pending => "Pending",
        };
        write!(f, "{}", label)
    }
}

/// A registered operator.
#[derive(Debug, Clone)]
pub struct Operator {
    pub ns: String,
    pub name: String,
    pub params: Vec<Type>,
    pub returns: Type,
    pub pure: bool,
    pub imp: OpImpl,
}

impl Operator {
    /// Qualified name, `ns.name`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.ns, self.name)
    }
}

/// Mapping from (namespace, name) to operator.
#[derive(Default)]
pub struct OperatorRegistry {
    ops: RefCell<HashMap<(String, String), Rc<Operator>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator, overwriting any existing entry for the key.
    pub fn register(&self, op: Operator) {
        self.ops
            .borrow_mut()
            .insert((op.ns.clone(), op.name.clone()), Rc::new(op));
    }

    pub fn lookup(&self, ns: &str, name: &str) -> Option<Rc<Operator>> {
        self.ops
            .borrow()
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
    }

    pub fn contains(&self, ns: &str, name: &str) -> bool {
        self.lookup(ns, name).is_some()
    }

    /// All registered operators, sorted by qualified name.
    pub fn all(&self) -> Vec<Rc<Operator>> {
        let mut ops: Vec<Rc<Operator>> = self.ops.borrow().values().cloned().collect();
        ops.sort_by_key(|op| op.qualified());
        ops
    }

    pub fn len(&self) -> usize {
        self.ops.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.borrow().is_empty()
    }
}
