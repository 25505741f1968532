//! Error codes for evaluation failures.
//!
//! Errors are first-class runtime values, not host exceptions. The codes
//! here are the full taxonomy a program can observe; the runtime wraps a
//! code with an optional message and metadata map to form an error value.
//!
//! Host-level panics from operator implementations are caught at the
//! dispatch boundary and converted into `DomainError` values, so a
//! misbehaving operator can never tear down an evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Code carried by an error value.
///
/// The names are the wire-format strings: an error value serializes as
/// `{"kind": "error", "code": "TypeError", ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A value had the wrong tag for the operation (e.g. branching on a
    /// non-boolean).
    TypeError,
    /// Parameter count mismatch when applying a closure, operator, or
    /// named routine.
    ArityError,
    /// Malformed or unsupported construct: unknown node id, unmatched
    /// `match` scrutinee, an instruction the current tier does not
    /// support, or an operator panic.
    DomainError,
    /// Integer or float division (or modulo) by zero.
    DivideByZero,
    /// Operator lookup failed in the registry.
    UnknownOperator,
    /// Named-routine lookup failed in the defs table.
    UnknownDefinition,
    /// Identifier lookup failed in the environment.
    UnboundIdentifier,
    /// The step budget was exhausted.
    NonTermination,
    /// The document failed shape checks at load time.
    ValidationError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::TypeError => "TypeError",
            ErrorCode::ArityError => "ArityError",
            ErrorCode::DomainError => "DomainError",
            ErrorCode::DivideByZero => "DivideByZero",
            ErrorCode::UnknownOperator => "UnknownOperator",
            ErrorCode::UnknownDefinition => "UnknownDefinition",
            ErrorCode::UnboundIdentifier => "UnboundIdentifier",
            ErrorCode::NonTermination => "NonTermination",
            ErrorCode::ValidationError => "ValidationError",
        };
        write!(f, "{}", name)
    }
}

/// Format a panic payload into an error message.
///
/// Used when converting a caught operator panic into an error value.
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
