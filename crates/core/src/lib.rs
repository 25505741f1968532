//! Core types shared across the SPIRAL toolkit.
//!
//! This crate holds the pieces of the value domain that do not depend on
//! the expression language: the hash-string scheme used for set membership
//! and map keys, the persistent environment, the error-code taxonomy, and
//! the type descriptor model. The runtime `Value` union itself lives in
//! `spiral-runtime`, because closures embed expressions.

pub mod env;
pub mod error;
pub mod hash;
pub mod types;

pub use env::Env;
pub use error::{ErrorCode, format_panic_payload};
pub use hash::DecodedKey;
pub use types::{ChannelKind, Type};
