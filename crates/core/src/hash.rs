//! Hash-string scheme for value identity.
//!
//! Sets and maps are keyed by strings of the form `<prefix>:<payload>`.
//! Primitives hash by value, so two equal ints produce the same key and
//! coalesce in a set. Complex values (lists, closures, channels, ...) hash
//! by allocation identity, which the runtime derives from the shared
//! pointer; two structurally equal lists are distinct set members.
//!
//! Iterating a set has to recover values from keys, so the primitive
//! prefixes are decodable. Identity keys are not.

use crate::error::ErrorCode;

/// Hash key for a boolean.
pub fn bool_key(b: bool) -> String {
    format!("b:{}", b)
}

/// Hash key for an integer.
pub fn int_key(i: i64) -> String {
    format!("i:{}", i)
}

/// Hash key for a float.
///
/// Uses the shortest round-trippable decimal form, so `1.0` and `1.00`
/// produce the same key.
pub fn float_key(f: f64) -> String {
    format!("f:{}", f)
}

/// Hash key for a string.
pub fn str_key(s: &str) -> String {
    format!("s:{}", s)
}

/// Hash key for an empty option.
pub fn none_key() -> String {
    "o:none".to_string()
}

/// Hash key for a non-empty option, given the contained value's key.
pub fn some_key(inner: &str) -> String {
    format!("o:some:{}", inner)
}

/// Identity key for a complex value, given its allocation address.
pub fn identity_key(addr: usize) -> String {
    format!("@{:x}", addr)
}

/// A primitive value recovered from a hash key.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedKey {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Decode a hash key back to the primitive it was built from.
///
/// Only the four primitive prefixes decode; option and identity keys have
/// no primitive reading and yield `TypeError`.
pub fn decode_key(key: &str) -> Result<DecodedKey, ErrorCode> {
    let (prefix, payload) = key.split_once(':').ok_or(ErrorCode::TypeError)?;
    match prefix {
        "b" => payload
            .parse::<bool>()
            .map(DecodedKey::Bool)
            .map_err(|_| ErrorCode::TypeError),
        "i" => payload
            .parse::<i64>()
            .map(DecodedKey::Int)
            .map_err(|_| ErrorCode::TypeError),
        "f" => payload
            .parse::<f64>()
            .map(DecodedKey::Float)
            .map_err(|_| ErrorCode::TypeError),
        "s" => Ok(DecodedKey::Str(payload.to_string())),
        _ => Err(ErrorCode::TypeError),
    }
}
