//! Builtin operators, namespace `core`.
//!
//! The catalogue covers arithmetic, comparison, booleans, strings,
//! conversions, collections, options, and the error operators. Every
//! implementation tag-checks its arguments; there is no implicit
//! coercion beyond int-to-float promotion in mixed arithmetic.
//!
//! The higher-order list operators (`listMap`, `listFilter`, `listFold`)
//! are registered here for their signatures but implemented inside the
//! evaluator, because they re-enter closure application.

use indexmap::IndexMap;
use spiral_core::hash::{self, DecodedKey};
use spiral_core::{ErrorCode, Type};
use std::rc::Rc;

use crate::registry::{OpImpl, Operator, OperatorRegistry};
use crate::value::Value;

/// A registry preloaded with the `core` builtins.
pub fn default_registry() -> Rc<OperatorRegistry> {
    let registry = OperatorRegistry::new();
    install(&registry);
    Rc::new(registry)
}

fn native(
    registry: &OperatorRegistry,
    name: &str,
    params: Vec<Type>,
    returns: Type,
    f: impl Fn(&[Value]) -> Value + 'static,
) {
    registry.register(Operator {
        ns: "core".to_string(),
        name: name.to_string(),
        params,
        returns,
        pure: true,
        imp: OpImpl::Native(Rc::new(f)),
    });
}

fn eval_backed(registry: &OperatorRegistry, name: &str, params: Vec<Type>, returns: Type) {
    registry.register(Operator {
        ns: "core".to_string(),
        name: name.to_string(),
        params,
        returns,
        pure: true,
        imp: OpImpl::Eval,
    });
}

/// Register every builtin into `registry`.
pub fn install(registry: &OperatorRegistry) {
    install_arithmetic(registry);
    install_comparison(registry);
    install_boolean(registry);
    install_string(registry);
    install_conversion(registry);
    install_list(registry);
    install_map(registry);
    install_set(registry);
    install_option(registry);
    install_error(registry);
    install_channel(registry);
}

fn install_channel(registry: &OperatorRegistry) {
    // Close and size reach into the channel store, so they live in the
    // evaluator like the higher-order list operators.
    let channel = Type::Channel { of: None };
    eval_backed(registry, "chanClose", vec![channel.clone()], Type::Void);
    eval_backed(registry, "chanSize", vec![channel], Type::Int);
}

// Numeric promotion: int op int stays int, anything float goes float.
enum Pair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn numeric_pair(a: &Value, b: &Value, op: &str) -> Result<Pair, Value> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Pair::Ints(*a, *b)),
        (Value::Int(a), Value::Float(b)) => Ok(Pair::Floats(*a as f64, *b)),
        (Value::Float(a), Value::Int(b)) => Ok(Pair::Floats(*a, *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Pair::Floats(*a, *b)),
        _ => Err(Value::error(
            ErrorCode::TypeError,
            format!(
                "'core.{}' expects numbers, got {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ),
        )),
    }
}

fn overflow(op: &str) -> Value {
    Value::error(ErrorCode::DomainError, format!("integer overflow in 'core.{}'", op))
}

fn install_arithmetic(registry: &OperatorRegistry) {
    let binary = vec![Type::Int, Type::Int];
    native(registry, "add", binary.clone(), Type::Int, |args| {
        match numeric_pair(&args[0], &args[1], "add") {
            Ok(Pair::Ints(a, b)) => a.checked_add(b).map_or_else(|| overflow("add"), Value::Int),
            Ok(Pair::Floats(a, b)) => Value::Float(a + b),
            Err(e) => e,
        }
    });
    native(registry, "sub", binary.clone(), Type::Int, |args| {
        match numeric_pair(&args[0], &args[1], "sub") {
            Ok(Pair::Ints(a, b)) => a.checked_sub(b).map_or_else(|| overflow("sub"), Value::Int),
            Ok(Pair::Floats(a, b)) => Value::Float(a - b),
            Err(e) => e,
        }
    });
    native(registry, "mul", binary.clone(), Type::Int, |args| {
        match numeric_pair(&args[0], &args[1], "mul") {
            Ok(Pair::Ints(a, b)) => a.checked_mul(b).map_or_else(|| overflow("mul"), Value::Int),
            Ok(Pair::Floats(a, b)) => Value::Float(a * b),
            Err(e) => e,
        }
    });
    native(registry, "div", binary.clone(), Type::Int, |args| {
        match numeric_pair(&args[0], &args[1], "div") {
            Ok(Pair::Ints(_, 0)) => Value::error(ErrorCode::DivideByZero, "division by zero"),
            Ok(Pair::Ints(a, b)) => a.checked_div(b).map_or_else(|| overflow("div"), Value::Int),
            Ok(Pair::Floats(_, b)) if b == 0.0 => {
                Value::error(ErrorCode::DivideByZero, "division by zero")
            }
            Ok(Pair::Floats(a, b)) => Value::Float(a / b),
            Err(e) => e,
        }
    });
    native(registry, "mod", binary, Type::Int, |args| {
        match numeric_pair(&args[0], &args[1], "mod") {
            Ok(Pair::Ints(_, 0)) => Value::error(ErrorCode::DivideByZero, "modulo by zero"),
            Ok(Pair::Ints(a, b)) => a.checked_rem(b).map_or_else(|| overflow("mod"), Value::Int),
            Ok(Pair::Floats(_, b)) if b == 0.0 => {
                Value::error(ErrorCode::DivideByZero, "modulo by zero")
            }
            Ok(Pair::Floats(a, b)) => Value::Float(a % b),
            Err(e) => e,
        }
    });
    native(registry, "neg", vec![Type::Int], Type::Int, |args| match &args[0] {
        Value::Int(i) => i.checked_neg().map_or_else(|| overflow("neg"), Value::Int),
        Value::Float(f) => Value::Float(-f),
        other => Value::error(
            ErrorCode::TypeError,
            format!("'core.neg' expects a number, got {}", other.type_name()),
        ),
    });
}

fn install_comparison(registry: &OperatorRegistry) {
    // Equality is hash equality: primitives by value, composites by
    // identity, matching set membership semantics.
    native(
        registry,
        "eq",
        vec![Type::Opaque { name: None }, Type::Opaque { name: None }],
        Type::Bool,
        |args| Value::Bool(args[0].hash_key() == args[1].hash_key()),
    );
    native(
        registry,
        "ne",
        vec![Type::Opaque { name: None }, Type::Opaque { name: None }],
        Type::Bool,
        |args| Value::Bool(args[0].hash_key() != args[1].hash_key()),
    );
    for name in ["lt", "le", "gt", "ge"] {
        native(
            registry,
            name,
            vec![Type::Int, Type::Int],
            Type::Bool,
            move |args| compare(name, &args[0], &args[1]),
        );
    }
}

fn ordering_holds(name: &str, ordering: std::cmp::Ordering) -> bool {
    match name {
        "lt" => ordering.is_lt(),
        "le" => ordering.is_le(),
        "gt" => ordering.is_gt(),
        _ => ordering.is_ge(),
    }
}

/// Ordered comparison over numbers (with promotion) and strings.
fn compare(name: &str, a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => Value::Bool(ordering_holds(name, a.cmp(b))),
        _ => match numeric_pair(a, b, name) {
            Ok(Pair::Ints(x, y)) => Value::Bool(ordering_holds(name, x.cmp(&y))),
            Ok(Pair::Floats(x, y)) => {
                match x.partial_cmp(&y) {
                    Some(ordering) => Value::Bool(ordering_holds(name, ordering)),
                    // NaN orders with nothing.
                    None => Value::Bool(false),
                }
            }
            Err(e) => e,
        },
    }
}

fn bool_arg(value: &Value, op: &str) -> Result<bool, Value> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects bool, got {}", op, other.type_name()),
        )),
    }
}

fn install_boolean(registry: &OperatorRegistry) {
    native(registry, "and", vec![Type::Bool, Type::Bool], Type::Bool, |args| {
        match (bool_arg(&args[0], "and"), bool_arg(&args[1], "and")) {
            (Ok(a), Ok(b)) => Value::Bool(a && b),
            (Err(e), _) | (_, Err(e)) => e,
        }
    });
    native(registry, "or", vec![Type::Bool, Type::Bool], Type::Bool, |args| {
        match (bool_arg(&args[0], "or"), bool_arg(&args[1], "or")) {
            (Ok(a), Ok(b)) => Value::Bool(a || b),
            (Err(e), _) | (_, Err(e)) => e,
        }
    });
    native(registry, "not", vec![Type::Bool], Type::Bool, |args| {
        match bool_arg(&args[0], "not") {
            Ok(b) => Value::Bool(!b),
            Err(e) => e,
        }
    });
}

fn str_arg<'a>(value: &'a Value, op: &str) -> Result<&'a str, Value> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects string, got {}", op, other.type_name()),
        )),
    }
}

fn int_arg(value: &Value, op: &str) -> Result<i64, Value> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects int, got {}", op, other.type_name()),
        )),
    }
}

fn install_string(registry: &OperatorRegistry) {
    native(
        registry,
        "concat",
        vec![Type::String, Type::String],
        Type::String,
        |args| match (str_arg(&args[0], "concat"), str_arg(&args[1], "concat")) {
            (Ok(a), Ok(b)) => Value::Str(format!("{}{}", a, b)),
            (Err(e), _) | (_, Err(e)) => e,
        },
    );
    native(registry, "length", vec![Type::String], Type::Int, |args| {
        match str_arg(&args[0], "length") {
            Ok(s) => Value::Int(s.chars().count() as i64),
            Err(e) => e,
        }
    });
    native(
        registry,
        "substring",
        vec![Type::String, Type::Int, Type::Int],
        Type::String,
        |args| {
            let s = match str_arg(&args[0], "substring") {
                Ok(s) => s,
                Err(e) => return e,
            };
            let (start, end) = match (int_arg(&args[1], "substring"), int_arg(&args[2], "substring")) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            if start < 0 || end < start {
                return Value::error(
                    ErrorCode::DomainError,
                    format!("invalid substring range {}..{}", start, end),
                );
            }
            let taken: String = s
                .chars()
                .skip(start as usize)
                .take((end - start) as usize)
                .collect();
            Value::Str(taken)
        },
    );
    native(
        registry,
        "contains",
        vec![Type::String, Type::String],
        Type::Bool,
        |args| match (str_arg(&args[0], "contains"), str_arg(&args[1], "contains")) {
            (Ok(s), Ok(needle)) => Value::Bool(s.contains(needle)),
            (Err(e), _) | (_, Err(e)) => e,
        },
    );
    native(registry, "toUpper", vec![Type::String], Type::String, |args| {
        match str_arg(&args[0], "toUpper") {
            Ok(s) => Value::Str(s.to_uppercase()),
            Err(e) => e,
        }
    });
    native(registry, "toLower", vec![Type::String], Type::String, |args| {
        match str_arg(&args[0], "toLower") {
            Ok(s) => Value::Str(s.to_lowercase()),
            Err(e) => e,
        }
    });
    native(registry, "trim", vec![Type::String], Type::String, |args| {
        match str_arg(&args[0], "trim") {
            Ok(s) => Value::Str(s.trim().to_string()),
            Err(e) => e,
        }
    });
    native(
        registry,
        "split",
        vec![Type::String, Type::String],
        Type::List { of: Some(Box::new(Type::String)) },
        |args| match (str_arg(&args[0], "split"), str_arg(&args[1], "split")) {
            (Ok(s), Ok(sep)) => Value::List(Rc::new(
                s.split(sep).map(|part| Value::Str(part.to_string())).collect(),
            )),
            (Err(e), _) | (_, Err(e)) => e,
        },
    );
}

fn install_conversion(registry: &OperatorRegistry) {
    native(
        registry,
        "toString",
        vec![Type::Opaque { name: None }],
        Type::String,
        |args| match &args[0] {
            Value::Str(s) => Value::Str(s.clone()),
            Value::Bool(b) => Value::Str(b.to_string()),
            Value::Int(i) => Value::Str(i.to_string()),
            Value::Float(f) => Value::Str(f.to_string()),
            Value::Void => Value::Str("void".to_string()),
            other => Value::Str(other.to_json().to_string()),
        },
    );
    native(registry, "parseInt", vec![Type::String], Type::Int, |args| {
        match str_arg(&args[0], "parseInt") {
            Ok(s) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::error(
                    ErrorCode::DomainError,
                    format!("'{}' does not parse as int", s),
                ),
            },
            Err(e) => e,
        }
    });
    native(registry, "parseFloat", vec![Type::String], Type::Float, |args| {
        match str_arg(&args[0], "parseFloat") {
            Ok(s) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::error(
                    ErrorCode::DomainError,
                    format!("'{}' does not parse as float", s),
                ),
            },
            Err(e) => e,
        }
    });
}

fn list_arg<'a>(value: &'a Value, op: &str) -> Result<&'a Rc<Vec<Value>>, Value> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects list, got {}", op, other.type_name()),
        )),
    }
}

fn install_list(registry: &OperatorRegistry) {
    let any = Type::Opaque { name: None };
    let list = Type::List { of: None };
    native(registry, "listNew", vec![], list.clone(), |_| {
        Value::List(Rc::new(Vec::new()))
    });
    native(
        registry,
        "listPush",
        vec![list.clone(), any.clone()],
        list.clone(),
        |args| match list_arg(&args[0], "listPush") {
            Ok(items) => {
                let mut next = items.as_ref().clone();
                next.push(args[1].clone());
                Value::List(Rc::new(next))
            }
            Err(e) => e,
        },
    );
    native(
        registry,
        "listGet",
        vec![list.clone(), Type::Int],
        any.clone(),
        |args| {
            let items = match list_arg(&args[0], "listGet") {
                Ok(items) => items,
                Err(e) => return e,
            };
            let index = match int_arg(&args[1], "listGet") {
                Ok(i) => i,
                Err(e) => return e,
            };
            if index < 0 || index as usize >= items.len() {
                return Value::error(
                    ErrorCode::DomainError,
                    format!("index {} out of bounds for list of {}", index, items.len()),
                );
            }
            items[index as usize].clone()
        },
    );
    native(registry, "listLen", vec![list.clone()], Type::Int, |args| {
        match list_arg(&args[0], "listLen") {
            Ok(items) => Value::Int(items.len() as i64),
            Err(e) => e,
        }
    });
    let func = Type::Fn { params: vec![], returns: None };
    eval_backed(registry, "listMap", vec![list.clone(), func.clone()], list.clone());
    eval_backed(registry, "listFilter", vec![list.clone(), func.clone()], list.clone());
    eval_backed(registry, "listFold", vec![list, any.clone(), func], any);
}

fn map_arg<'a>(value: &'a Value, op: &str) -> Result<&'a Rc<IndexMap<String, Value>>, Value> {
    match value {
        Value::Map(entries) => Ok(entries),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects map, got {}", op, other.type_name()),
        )),
    }
}

/// Decode a stored key back to a value where possible; composite keys
/// surface as their raw key string.
fn key_value(key: &str) -> Value {
    match hash::decode_key(key) {
        Ok(DecodedKey::Bool(b)) => Value::Bool(b),
        Ok(DecodedKey::Int(i)) => Value::Int(i),
        Ok(DecodedKey::Float(f)) => Value::Float(f),
        Ok(DecodedKey::Str(s)) => Value::Str(s),
        Err(_) => Value::Str(key.to_string()),
    }
}

fn install_map(registry: &OperatorRegistry) {
    let any = Type::Opaque { name: None };
    let map = Type::Map { key: None, value: None };
    native(registry, "mapNew", vec![], map.clone(), |_| {
        Value::Map(Rc::new(IndexMap::new()))
    });
    native(
        registry,
        "mapGet",
        vec![map.clone(), any.clone()],
        Type::Option { of: None },
        |args| match map_arg(&args[0], "mapGet") {
            Ok(entries) => match entries.get(&args[1].hash_key()) {
                Some(value) => Value::some(value.clone()),
                None => Value::none(),
            },
            Err(e) => e,
        },
    );
    native(
        registry,
        "mapSet",
        vec![map.clone(), any.clone(), any.clone()],
        map.clone(),
        |args| match map_arg(&args[0], "mapSet") {
            Ok(entries) => {
                let mut next = entries.as_ref().clone();
                next.insert(args[1].hash_key(), args[2].clone());
                Value::Map(Rc::new(next))
            }
            Err(e) => e,
        },
    );
    native(
        registry,
        "mapHas",
        vec![map.clone(), any.clone()],
        Type::Bool,
        |args| match map_arg(&args[0], "mapHas") {
            Ok(entries) => Value::Bool(entries.contains_key(&args[1].hash_key())),
            Err(e) => e,
        },
    );
    native(
        registry,
        "mapKeys",
        vec![map.clone()],
        Type::List { of: None },
        |args| match map_arg(&args[0], "mapKeys") {
            Ok(entries) => Value::List(Rc::new(entries.keys().map(|k| key_value(k)).collect())),
            Err(e) => e,
        },
    );
    native(
        registry,
        "mapValues",
        vec![map.clone()],
        Type::List { of: None },
        |args| match map_arg(&args[0], "mapValues") {
            Ok(entries) => Value::List(Rc::new(entries.values().cloned().collect())),
            Err(e) => e,
        },
    );
    native(registry, "mapSize", vec![map], Type::Int, |args| {
        match map_arg(&args[0], "mapSize") {
            Ok(entries) => Value::Int(entries.len() as i64),
            Err(e) => e,
        }
    });
}

fn set_arg<'a>(value: &'a Value, op: &str) -> Result<&'a Rc<IndexMap<String, Value>>, Value> {
    match value {
        Value::Set(entries) => Ok(entries),
        other => Err(Value::error(
            ErrorCode::TypeError,
            format!("'core.{}' expects set, got {}", op, other.type_name()),
        )),
    }
}

fn install_set(registry: &OperatorRegistry) {
    let any = Type::Opaque { name: None };
    let set = Type::Set { of: None };
    native(registry, "setNew", vec![], set.clone(), |_| {
        Value::Set(Rc::new(IndexMap::new()))
    });
    native(
        registry,
        "setAdd",
        vec![set.clone(), any.clone()],
        set.clone(),
        |args| match set_arg(&args[0], "setAdd") {
            Ok(entries) => {
                let mut next = entries.as_ref().clone();
                next.insert(args[1].hash_key(), args[1].clone());
                Value::Set(Rc::new(next))
            }
            Err(e) => e,
        },
    );
    native(
        registry,
        "setHas",
        vec![set.clone(), any],
        Type::Bool,
        |args| match set_arg(&args[0], "setHas") {
            Ok(entries) => Value::Bool(entries.contains_key(&args[1].hash_key())),
            Err(e) => e,
        },
    );
    native(registry, "setSize", vec![set], Type::Int, |args| {
        match set_arg(&args[0], "setSize") {
            Ok(entries) => Value::Int(entries.len() as i64),
            Err(e) => e,
        }
    });
}

fn install_option(registry: &OperatorRegistry) {
    let any = Type::Opaque { name: None };
    let option = Type::Option { of: None };
    native(registry, "some", vec![any.clone()], option.clone(), |args| {
        Value::some(args[0].clone())
    });
    native(registry, "none", vec![], option.clone(), |_| Value::none());
    native(registry, "isNone", vec![option.clone()], Type::Bool, |args| {
        match &args[0] {
            Value::Option(o) => Value::Bool(o.is_none()),
            other => Value::error(
                ErrorCode::TypeError,
                format!("'core.isNone' expects option, got {}", other.type_name()),
            ),
        }
    });
    native(
        registry,
        "unwrapOr",
        vec![option, any.clone()],
        any,
        |args| match &args[0] {
            Value::Option(o) => match o.as_ref() {
                Some(value) => value.clone(),
                None => args[1].clone(),
            },
            other => Value::error(
                ErrorCode::TypeError,
                format!("'core.unwrapOr' expects option, got {}", other.type_name()),
            ),
        },
    );
}

fn parse_code(name: &str) -> Option<ErrorCode> {
    Some(match name {
        "TypeError" => ErrorCode::TypeError,
        "ArityError" => ErrorCode::ArityError,
        "DomainError" => ErrorCode::DomainError,
        "DivideByZero" => ErrorCode::DivideByZero,
        "UnknownOperator" => ErrorCode::UnknownOperator,
        "UnknownDefinition" => ErrorCode::UnknownDefinition,
        "UnboundIdentifier" => ErrorCode::UnboundIdentifier,
        "NonTermination" => ErrorCode::NonTermination,
        "ValidationError" => ErrorCode::ValidationError,
        _ => return None,
    })
}

fn install_error(registry: &OperatorRegistry) {
    let any = Type::Opaque { name: None };
    // The designated error-inspecting operator: errors arrive as data.
    native(registry, "isError", vec![any.clone()], Type::Bool, |args| {
        Value::Bool(args[0].is_error())
    });
    native(registry, "errorCode", vec![any.clone()], Type::String, |args| {
        match args[0].as_error() {
            Some(error) => Value::Str(error.code.to_string()),
            None => Value::error(
                ErrorCode::TypeError,
                format!("'core.errorCode' expects error, got {}", args[0].type_name()),
            ),
        }
    });
    native(
        registry,
        "makeError",
        vec![Type::String, Type::String],
        any,
        |args| {
            let code = match str_arg(&args[0], "makeError") {
                Ok(name) => match parse_code(name) {
                    Some(code) => code,
                    None => {
                        return Value::error(
                            ErrorCode::DomainError,
                            format!("unknown error code '{}'", name),
                        );
                    }
                },
                Err(e) => return e,
            };
            let message = match str_arg(&args[1], "makeError") {
                Ok(message) => message.to_string(),
                Err(e) => return e,
            };
            Value::error(code, message)
        },
    );
}
