//! Runtime values.
//!
//! `Value` is the tagged union every evaluator tier produces and consumes.
//! Composite values are `Rc`-shared so duplicating one is a reference-count
//! bump; this is what makes captured environments and recursive data cheap.
//! Errors are ordinary values that flow through evaluation rather than host
//! exceptions, so the union carries them alongside the data variants.
//!
//! ## Equality and hashing
//!
//! Two equality notions coexist:
//!
//! - `PartialEq` is structural for primitives and collections and identity
//!   (`Rc::ptr_eq`) for closures. It backs assertions and host code.
//! - The hash-string scheme (`hash_key`) backs set membership and map keys:
//!   primitives hash by value, composites by allocation identity. Programs
//!   observe this notion through `core.eq` and collection operations.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use spiral_core::hash;
use spiral_core::{ChannelKind, Env, ErrorCode, Type};
use std::cell::RefCell;
use std::rc::Rc;

use crate::doc::{Expr, Param};

/// Identifier of a scheduled task.
pub type TaskId = u64;

/// Identifier of a channel in the channel store.
pub type ChannelId = u64;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Void,

    /// Ordered sequence, insertion order preserved.
    List(Rc<Vec<Value>>),
    /// Unordered membership keyed by hash string; iteration follows
    /// insertion order. Duplicate inserts coalesce on the key.
    Set(Rc<IndexMap<String, Value>>),
    /// Mapping keyed by hash string (`"s:" + field` for record fields);
    /// iteration follows insertion order.
    Map(Rc<IndexMap<String, Value>>),
    /// Present-or-absent container. `None` doubles as the "undefined"
    /// sentinel bound to optional parameters without defaults.
    Option(Rc<Option<Value>>),

    /// Named tag plus an uninterpreted host payload.
    Opaque(Rc<OpaqueData>),

    /// First-class function. The `RefCell` exists solely so `fix` can
    /// back-patch its placeholder into a self-referential closure; after
    /// construction a closure is never mutated again.
    Closure(Rc<RefCell<ClosureData>>),

    /// Names a heap cell in the evaluation state. Identity is the cell id,
    /// so aliases observe each other's writes.
    RefCell { cell: String },

    /// Tagged error. Propagates by short-circuit through every variant
    /// except `try` and the designated error-inspecting operators.
    Error(Rc<ErrorData>),

    /// Handle to a task's eventual result.
    Future { task: TaskId },
    /// Communication endpoint. Duplicating the value shares the channel.
    Channel { id: ChannelId, kind: ChannelKind },
    /// A scheduled unit of evaluation with its declared return type.
    Task { id: TaskId, returns: Type },
    /// Outcome of `select`/`race`: the winning index (-1 on timeout) and
    /// the winning value.
    SelectResult { index: i64, value: Box<Value> },
}

/// Closure payload: parameters, body, captured environment.
#[derive(Clone)]
pub struct ClosureData {
    pub params: Vec<Param>,
    pub body: Rc<Expr>,
    pub env: Env<Value>,
}

// Fixed-point closures close over themselves, so printing the captured
// environment would not terminate. Show the parameter list only.
impl std::fmt::Debug for ClosureData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.params.iter().map(|p| p.name.as_str()).collect();
        write!(f, "ClosureData({})", names.join(", "))
    }
}

/// Error payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub meta: Option<IndexMap<String, Value>>,
}

/// Host-controlled value: a tag naming the host type plus its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueData {
    pub name: String,
    pub payload: JsonValue,
}

impl Value {
    /// Build an error value from a code and message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorData {
            code,
            message: Some(message.into()),
            meta: None,
        }))
    }

    /// Build an error value carrying a metadata map.
    pub fn error_with_meta(
        code: ErrorCode,
        message: impl Into<String>,
        meta: IndexMap<String, Value>,
    ) -> Value {
        Value::Error(Rc::new(ErrorData {
            code,
            message: Some(message.into()),
            meta: Some(meta),
        }))
    }

    /// An empty option, also used as the "undefined" parameter sentinel.
    pub fn none() -> Value {
        Value::Option(Rc::new(None))
    }

    /// An option containing `v`.
    pub fn some(v: Value) -> Value {
        Value::Option(Rc::new(Some(v)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorData> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Tag name used in diagnostics ("int", "closure", ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Void => "void",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Option(_) => "option",
            Value::Opaque(_) => "opaque",
            Value::Closure(_) => "closure",
            Value::RefCell { .. } => "ref",
            Value::Error(_) => "error",
            Value::Future { .. } => "future",
            Value::Channel { .. } => "channel",
            Value::Task { .. } => "task",
            Value::SelectResult { .. } => "selectResult",
        }
    }

    /// Hash key for set membership and map keying.
    ///
    /// Primitives hash by value, options by their content's key, and every
    /// composite by allocation identity.
    pub fn hash_key(&self) -> String {
        match self {
            Value::Bool(b) => hash::bool_key(*b),
            Value::Int(i) => hash::int_key(*i),
            Value::Float(f) => hash::float_key(*f),
            Value::Str(s) => hash::str_key(s),
            Value::Void => "v:void".to_string(),
            Value::Option(o) => match o.as_ref() {
                None => hash::none_key(),
                Some(inner) => hash::some_key(&inner.hash_key()),
            },
            Value::List(l) => hash::identity_key(Rc::as_ptr(l) as usize),
            Value::Set(s) => hash::identity_key(Rc::as_ptr(s) as usize),
            Value::Map(m) => hash::identity_key(Rc::as_ptr(m) as usize),
            Value::Opaque(o) => hash::identity_key(Rc::as_ptr(o) as usize),
            Value::Closure(c) => hash::identity_key(Rc::as_ptr(c) as usize),
            Value::Error(e) => hash::identity_key(Rc::as_ptr(e) as usize),
            Value::RefCell { cell } => format!("@ref:{}", cell),
            Value::Future { task } => format!("@future:{}", task),
            Value::Channel { id, .. } => format!("@channel:{}", id),
            Value::Task { id, .. } => format!("@task:{}", id),
            Value::SelectResult { index, value } => {
                format!("@select:{}:{}", index, value.hash_key())
            }
        }
    }

    /// Build a value from plain JSON: arrays become lists, objects become
    /// maps keyed like records. Used for caller-supplied inputs.
    pub fn from_json(raw: &JsonValue) -> Value {
        match raw {
            JsonValue::Null => Value::Void,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => {
                Value::List(Rc::new(items.iter().map(Value::from_json).collect()))
            }
            JsonValue::Object(fields) => {
                let mut entries = IndexMap::new();
                for (key, value) in fields {
                    entries.insert(hash::str_key(key), Value::from_json(value));
                }
                Value::Map(Rc::new(entries))
            }
        }
    }

    /// Render as JSON for program output and diagnostics.
    ///
    /// Map keys produced by records carry the `s:` prefix internally; the
    /// rendering strips it so output reads like the source document.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number)
            }
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Void => JsonValue::Null,
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Set(entries) => {
                JsonValue::Array(entries.values().map(Value::to_json).collect())
            }
            Value::Map(entries) => {
                let mut obj = serde_json::Map::new();
                for (key, v) in entries.iter() {
                    let display = key.strip_prefix("s:").unwrap_or(key);
                    obj.insert(display.to_string(), v.to_json());
                }
                JsonValue::Object(obj)
            }
            Value::Option(o) => match o.as_ref() {
                None => serde_json::json!({ "kind": "option", "value": null }),
                Some(inner) => serde_json::json!({ "kind": "option", "value": inner.to_json() }),
            },
            Value::Opaque(o) => {
                serde_json::json!({ "kind": "opaque", "name": o.name, "payload": o.payload })
            }
            Value::Closure(c) => {
                let names: Vec<String> =
                    c.borrow().params.iter().map(|p| p.name.clone()).collect();
                serde_json::json!({ "kind": "closure", "params": names })
            }
            Value::RefCell { cell } => serde_json::json!({ "kind": "ref", "cell": cell }),
            Value::Error(e) => {
                let mut obj = serde_json::Map::new();
                obj.insert("kind".into(), JsonValue::String("error".into()));
                obj.insert("code".into(), JsonValue::String(e.code.to_string()));
                if let Some(msg) = &e.message {
                    obj.insert("message".into(), JsonValue::String(msg.clone()));
                }
                if let Some(meta) = &e.meta {
                    let mut m = serde_json::Map::new();
                    for (k, v) in meta.iter() {
                        m.insert(k.clone(), v.to_json());
                    }
                    obj.insert("meta".into(), JsonValue::Object(m));
                }
                JsonValue::Object(obj)
            }
            Value::Future { task } => serde_json::json!({ "kind": "future", "task": task }),
            Value::Channel { id, kind } => {
                serde_json::json!({ "kind": "channel", "id": id, "channelKind": kind })
            }
            Value::Task { id, returns } => {
                serde_json::json!({ "kind": "task", "id": id, "returns": returns })
            }
            Value::SelectResult { index, value } => {
                serde_json::json!({ "kind": "selectResult", "index": index, "value": value.to_json() })
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Void, Value::Void) => true,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Option(a), Value::Option(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            // Closures have no structural equality; identity only.
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::RefCell { cell: a }, Value::RefCell { cell: b }) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Future { task: a }, Value::Future { task: b }) => a == b,
            (Value::Channel { id: a, .. }, Value::Channel { id: b, .. }) => a == b,
            (Value::Task { id: a, .. }, Value::Task { id: b, .. }) => a == b,
            (
                Value::SelectResult { index: a, value: av },
                Value::SelectResult { index: b, value: bv },
            ) => a == b && av == bv,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_hash_keys() {
        assert_eq!(Value::Int(3).hash_key(), "i:3");
        assert_eq!(Value::Bool(false).hash_key(), "b:false");
        assert_eq!(Value::Str("x".into()).hash_key(), "s:x");
        assert_eq!(Value::none().hash_key(), "o:none");
        assert_eq!(Value::some(Value::Int(1)).hash_key(), "o:some:i:1");
    }

    #[test]
    fn test_complex_values_hash_by_identity() {
        let a = Value::List(Rc::new(vec![Value::Int(1)]));
        let b = Value::List(Rc::new(vec![Value::Int(1)]));
        assert_ne!(a.hash_key(), b.hash_key());
        // A clone shares the allocation, so it shares the key.
        let c = a.clone();
        assert_eq!(a.hash_key(), c.hash_key());
    }

    #[test]
    fn test_error_values_compare_structurally() {
        let a = Value::error(ErrorCode::TypeError, "expected int");
        let b = Value::error(ErrorCode::TypeError, "expected int");
        assert_eq!(a, b);
        assert!(a.is_error());
    }

    #[test]
    fn test_map_rendering_strips_key_prefix() {
        let mut entries = IndexMap::new();
        entries.insert("s:name".to_string(), Value::Str("ada".into()));
        let rendered = Value::Map(Rc::new(entries)).to_json();
        assert_eq!(rendered, serde_json::json!({ "name": "ada" }));
    }
}
