//! Stdlib loading.
//!
//! Higher-level operators ship as CIR documents whose result node is a
//! record mapping qualified names (`"ns.name"`) to closures or constant
//! literals. Loading a batch is two-phase so documents may call each
//! other forward:
//!
//! 1. Every exported key across the batch gets a placeholder operator.
//!    Invoking a placeholder fails loudly, naming the operator.
//! 2. Each document is evaluated against the live registry and its
//!    exports replace the placeholders.
//!
//! Closures become `OpImpl::Closure` operators and run through the
//! evaluator's ordinary application path; anything else becomes a
//! constant-returning native.

use spiral_core::Type;
use std::fmt;
use std::rc::Rc;

use crate::doc::{Document, Expr};
use crate::driver::{EvalOptions, evaluate};
use crate::effects::EffectRegistry;
use crate::registry::{OpImpl, Operator, OperatorRegistry};
use crate::value::Value;

/// Failure while loading a stdlib batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StdlibError {
    pub message: String,
}

impl StdlibError {
    fn new(message: impl Into<String>) -> Self {
        StdlibError {
            message: message.into(),
        }
    }
}

impl fmt::Display for StdlibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stdlib load failed: {}", self.message)
    }
}

impl std::error::Error for StdlibError {}

/// Load a batch of stdlib documents into `registry`. Returns the number
/// of operators registered.
pub fn load_batch(
    docs: &[Document],
    registry: &Rc<OperatorRegistry>,
    effects: &Rc<EffectRegistry>,
    options: &EvalOptions,
) -> Result<usize, StdlibError> {
    // Phase 1: placeholders for every export, so in-batch forward
    // references resolve to something that fails loudly if invoked
    // before its document loads.
    for doc in docs {
        for key in exported_keys(doc) {
            let (ns, name) = split_qualified(&key)?;
            if registry.contains(&ns, &name) {
                continue;
            }
            registry.register(Operator {
                ns,
                name,
                params: Vec::new(),
                returns: Type::Opaque { name: None },
                pure: true,
                imp: OpImpl::Pending,
            });
        }
    }

    // Phase 2: evaluate and replace.
    let mut registered = 0;
    for doc in docs {
        let evaluation = evaluate(
            doc.clone(),
            registry.clone(),
            effects.clone(),
            None,
            options.clone(),
        );
        if evaluation.result.is_error() {
            return Err(StdlibError::new(format!(
                "document evaluation produced {}",
                evaluation.result.to_json()
            )));
        }
        let Value::Map(exports) = &evaluation.result else {
            return Err(StdlibError::new(format!(
                "document result must be a record, got {}",
                evaluation.result.type_name()
            )));
        };
        for (key, value) in exports.iter() {
            let qualified = key.strip_prefix("s:").unwrap_or(key);
            let (ns, name) = split_qualified(qualified)?;
            registry.register(wrap_export(ns, name, value));
            registered += 1;
        }
    }
    tracing::debug!(target: "spiral::stdlib", registered, "stdlib batch loaded");
    Ok(registered)
}

/// Exported keys of a document: the field names of its result record,
/// read without evaluating anything.
fn exported_keys(doc: &Document) -> Vec<String> {
    let result = doc.nodes.iter().find(|node| node.id == doc.result);
    match result.and_then(|node| node.expr.as_ref()) {
        Some(Expr::Record { fields }) => fields.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn split_qualified(key: &str) -> Result<(String, String), StdlibError> {
    match key.split_once('.') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err(StdlibError::new(format!(
            "export key '{}' is not namespace-qualified",
            key
        ))),
    }
}

fn wrap_export(ns: String, name: String, value: &Value) -> Operator {
    match value {
        Value::Closure(closure) => {
            let params = closure
                .borrow()
                .params
                .iter()
                .map(|p| p.ty.clone().unwrap_or(Type::Opaque { name: None }))
                .collect();
            Operator {
                ns,
                name,
                params,
                returns: Type::Opaque { name: None },
                pure: true,
                imp: OpImpl::Closure(value.clone()),
            }
        }
        constant => {
            let constant = constant.clone();
            Operator {
                ns,
                name,
                params: Vec::new(),
                returns: Type::Opaque { name: None },
                pure: true,
                imp: OpImpl::Native(Rc::new(move |_| constant.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exported_keys_reads_result_record() {
        let doc = Document::from_json(json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "exports", "expr": { "kind": "record", "fields": {
                    "math.twice": { "kind": "lit", "type": { "kind": "int" }, "value": 0 }
                } } }
            ],
            "result": "exports"
        }))
        .unwrap();
        assert_eq!(exported_keys(&doc), vec!["math.twice".to_string()]);
    }

    #[test]
    fn test_split_qualified_rejects_bare_names() {
        assert!(split_qualified("math.twice").is_ok());
        assert!(split_qualified("twice").is_err());
        assert!(split_qualified(".x").is_err());
    }
}
