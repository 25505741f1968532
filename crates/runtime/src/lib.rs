//! SPIRAL runtime: the polymorphic evaluator.
//!
//! Programs are JSON documents at one of five abstraction levels
//! (AIR, CIR, EIR, LIR, PIR): a directed acyclic graph of nodes, each
//! holding an expression or a basic-block CFG, connected by symbolic
//! ids. This crate loads such documents and evaluates them:
//!
//! - [`doc`]: the document model and the load pipeline (`$imports`
//!   desugaring, `$ref` splicing, shape checks).
//! - [`value`]: the runtime value union shared by every tier.
//! - [`registry`] and [`builtins`]: the operator surface programs call.
//! - [`effects`]: named side effects and the recorded effect history.
//! - [`channel`] and [`sched`]: bounded FIFO channels and the
//!   cooperative task table behind the concurrent tier.
//! - [`driver`]: node scheduling, caching, and the public
//!   [`evaluate`](driver::evaluate) entry point.
//! - [`stdlib`]: two-phase loading of operator libraries written as
//!   CIR documents.
//!
//! Errors are values: anything a program can observe going wrong flows
//! through evaluation as a `Value::Error`, and only document loading
//! reports failure at the host level.

pub mod builtins;
pub mod channel;
pub mod doc;
pub mod driver;
pub mod effects;
mod eval;
pub mod registry;
pub mod sched;
pub mod stdlib;
pub mod value;

pub use doc::{Document, Expr, LoadError, Node, Operand};
pub use driver::{DEFAULT_MAX_STEPS, EvalOptions, Evaluation, evaluate};
pub use effects::{EffectOp, EffectRecord, EffectRegistry};
pub use registry::{OpImpl, Operator, OperatorRegistry};
pub use value::{ChannelId, TaskId, Value};
