//! Document model and loading.
//!
//! A document is a list of nodes plus metadata and a designated result
//! node. Nodes carry either an expression (AST form) or a block CFG.
//! Expressions form an open-world tagged union spanning the five dialects;
//! a given evaluation tier accepts the variants it knows and yields a
//! `DomainError` value for the rest.
//!
//! Loading is a three-stage pipeline over raw JSON:
//!
//! 1. `$imports` desugaring: each imported namespace becomes a `$defs`
//!    entry whose `$ref` URI gains a `#/$defs` fragment.
//! 2. Reference-node splicing: `{id, $ref}` nodes resolve their JSON
//!    Pointer against the document root and are replaced by the target
//!    (keeping the node's own id).
//! 3. Typed deserialization plus shape checks (body forms, result node,
//!    terminator destinations).
//!
//! Failures at any stage are `ValidationError`s.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use spiral_core::{ChannelKind, ErrorCode, Type};
use std::collections::HashSet;
use std::fmt;

use crate::value::Value;

/// A child position: either an inline expression or a node-id reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Node(String),
    Expr(Box<Expr>),
}

/// Closure or lambda parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Expr>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<Type>,
}

/// One arm of a `match` expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: String,
    pub body: Operand,
}

fn default_chan_kind() -> ChannelKind {
    ChannelKind::Mpsc
}

/// Expression, discriminated by `kind` on the wire.
///
/// The variants group into the pure tier (`lit` through `fix`), the
/// effectful tier (`seq` through `try`), and the concurrent tier (`par`
/// through `race`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    #[serde(rename = "lit")]
    Lit {
        #[serde(rename = "type")]
        ty: Type,
        value: JsonValue,
    },
    #[serde(rename = "ref")]
    Ref { id: String },
    #[serde(rename = "var")]
    Var { name: String },
    #[serde(rename = "call")]
    Call {
        ns: String,
        name: String,
        #[serde(default)]
        args: Vec<Operand>,
    },
    #[serde(rename = "if")]
    If {
        cond: Operand,
        then: Operand,
        #[serde(rename = "else")]
        otherwise: Operand,
    },
    #[serde(rename = "let")]
    Let {
        name: String,
        value: Operand,
        body: Operand,
    },
    #[serde(rename = "airRef")]
    AirRef {
        ns: String,
        name: String,
        #[serde(default)]
        args: Vec<Operand>,
    },
    #[serde(rename = "predicate")]
    Predicate { id: String },
    #[serde(rename = "do")]
    Do {
        #[serde(default)]
        exprs: Vec<Operand>,
    },
    #[serde(rename = "record")]
    Record {
        #[serde(default)]
        fields: indexmap::IndexMap<String, Operand>,
    },
    #[serde(rename = "listOf")]
    ListOf {
        #[serde(default)]
        items: Vec<Operand>,
    },
    #[serde(rename = "match")]
    Match {
        value: Operand,
        #[serde(default)]
        cases: Vec<MatchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Operand>,
    },
    #[serde(rename = "lambda")]
    Lambda {
        #[serde(default)]
        params: Vec<Param>,
        body: Operand,
    },
    #[serde(rename = "callExpr")]
    CallExpr {
        #[serde(rename = "fn")]
        func: Operand,
        #[serde(default)]
        args: Vec<Operand>,
    },
    #[serde(rename = "fix")]
    Fix {
        #[serde(rename = "fn")]
        func: Operand,
    },

    #[serde(rename = "seq")]
    Seq { first: Operand, then: Operand },
    #[serde(rename = "assign")]
    Assign { target: String, value: Operand },
    #[serde(rename = "while")]
    While { cond: Operand, body: Operand },
    #[serde(rename = "for")]
    For {
        var: String,
        init: Operand,
        cond: Operand,
        update: Operand,
        body: Operand,
    },
    #[serde(rename = "iter")]
    Iter {
        var: String,
        iterable: Operand,
        body: Operand,
    },
    #[serde(rename = "effect")]
    Effect {
        op: String,
        #[serde(default)]
        args: Vec<Operand>,
    },
    #[serde(rename = "refCell")]
    RefCell { target: String },
    #[serde(rename = "deref")]
    Deref { target: String },
    #[serde(rename = "try")]
    Try {
        #[serde(rename = "try")]
        body: Operand,
        #[serde(rename = "catchParam")]
        catch_param: String,
        catch: Operand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Operand>,
    },

    #[serde(rename = "par")]
    Par { branches: Vec<Operand> },
    #[serde(rename = "spawn")]
    Spawn {
        body: Operand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returns: Option<Type>,
    },
    #[serde(rename = "await")]
    Await { future: Operand },
    #[serde(rename = "channel")]
    Channel {
        #[serde(rename = "chanKind", default = "default_chan_kind")]
        kind: ChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },
    #[serde(rename = "send")]
    Send { channel: Operand, value: Operand },
    #[serde(rename = "recv")]
    Recv { channel: Operand },
    #[serde(rename = "select")]
    Select {
        futures: Vec<Operand>,
        /// Milliseconds; elapsing yields a select result with index -1.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    #[serde(rename = "race")]
    Race { tasks: Vec<Operand> },
}

impl Expr {
    /// Wire name of the variant.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Lit { .. } => "lit",
            Expr::Ref { .. } => "ref",
            Expr::Var { .. } => "var",
            Expr::Call { .. } => "call",
            Expr::If { .. } => "if",
            Expr::Let { .. } => "let",
            Expr::AirRef { .. } => "airRef",
            Expr::Predicate { .. } => "predicate",
            Expr::Do { .. } => "do",
            Expr::Record { .. } => "record",
            Expr::ListOf { .. } => "listOf",
            Expr::Match { .. } => "match",
            Expr::Lambda { .. } => "lambda",
            Expr::CallExpr { .. } => "callExpr",
            Expr::Fix { .. } => "fix",
            Expr::Seq { .. } => "seq",
            Expr::Assign { .. } => "assign",
            Expr::While { .. } => "while",
            Expr::For { .. } => "for",
            Expr::Iter { .. } => "iter",
            Expr::Effect { .. } => "effect",
            Expr::RefCell { .. } => "refCell",
            Expr::Deref { .. } => "deref",
            Expr::Try { .. } => "try",
            Expr::Par { .. } => "par",
            Expr::Spawn { .. } => "spawn",
            Expr::Await { .. } => "await",
            Expr::Channel { .. } => "channel",
            Expr::Send { .. } => "send",
            Expr::Recv { .. } => "recv",
            Expr::Select { .. } => "select",
            Expr::Race { .. } => "race",
        }
    }

    /// Whether re-evaluating this expression can observe the environment
    /// or evaluation order. Values of these kinds are recomputed rather
    /// than served from the node cache when resolved as arguments.
    pub fn order_sensitive(&self) -> bool {
        matches!(self, Expr::Var { .. } | Expr::Let { .. } | Expr::Call { .. })
    }
}

/// One basic block of a CFG node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

/// Phi source: the value to select when arriving from `block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhiSource {
    pub block: String,
    pub value: String,
}

/// Channel operation selector for the `channelOp` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChanOp {
    Send,
    Recv,
    TrySend,
    TryRecv,
}

/// Block instruction, discriminated by `kind`.
///
/// `call`, `effect`, and `assignRef` are declared by the format but not
/// supported by any current tier; executing one yields `DomainError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Instruction {
    #[serde(rename = "assign")]
    Assign { target: String, expr: Expr },
    #[serde(rename = "op")]
    Op {
        target: String,
        ns: String,
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    #[serde(rename = "phi")]
    Phi {
        target: String,
        sources: Vec<PhiSource>,
    },
    #[serde(rename = "call")]
    Call {},
    #[serde(rename = "effect")]
    Effect {},
    #[serde(rename = "assignRef")]
    AssignRef {},
    #[serde(rename = "spawn")]
    Spawn {
        target: String,
        entry: String,
        #[serde(default)]
        args: Vec<String>,
    },
    #[serde(rename = "channelOp")]
    ChannelOp {
        op: ChanOp,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    #[serde(rename = "await")]
    Await { target: String, future: String },
}

/// One branch scheduled by a `fork` terminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkBranch {
    pub block: String,
    /// Local name to bind the branch's future under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

/// Block terminator, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Terminator {
    #[serde(rename = "jump")]
    Jump { to: String },
    #[serde(rename = "branch")]
    Branch {
        cond: String,
        then: String,
        #[serde(rename = "else")]
        otherwise: String,
    },
    #[serde(rename = "return")]
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    #[serde(rename = "exit")]
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
    },
    #[serde(rename = "fork")]
    Fork {
        branches: Vec<ForkBranch>,
        continuation: String,
    },
    #[serde(rename = "join")]
    Join {
        tasks: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<Vec<String>>,
        to: String,
    },
    #[serde(rename = "suspend")]
    Suspend { future: String, resume: String },
}

/// Named routine in the defs table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirDef {
    pub ns: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Type>,
    pub body: Expr,
}

/// A document node: an id plus an expression or a block CFG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<Block>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

/// A complete program document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub version: String,
    pub nodes: Vec<Node>,
    /// Node id whose value is the program result.
    pub result: String,
    #[serde(rename = "airDefs", default)]
    pub air_defs: Vec<AirDef>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "functionSigs", default, skip_serializing_if = "Option::is_none")]
    pub function_sigs: Option<JsonValue>,
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Failure while loading a document. Carries the `ValidationError` code
/// so callers can surface it as an error value.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    fn new(message: impl Into<String>) -> Self {
        LoadError {
            message: message.into(),
        }
    }

    /// The load failure as an error value.
    pub fn to_value(&self) -> Value {
        Value::error(ErrorCode::ValidationError, self.message.clone())
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ErrorCode::ValidationError, self.message)
    }
}

impl std::error::Error for LoadError {}

impl Document {
    /// Load a document from raw JSON: desugar `$imports`, splice `$ref`
    /// nodes, deserialize, and shape-check.
    pub fn from_json(mut raw: JsonValue) -> Result<Document, LoadError> {
        desugar_imports(&mut raw)?;
        splice_ref_nodes(&mut raw)?;
        let doc: Document = serde_json::from_value(raw)
            .map_err(|e| LoadError::new(format!("malformed document: {}", e)))?;
        doc.check_shape()?;
        Ok(doc)
    }

    /// Load a document from JSON text.
    pub fn from_str(text: &str) -> Result<Document, LoadError> {
        let raw: JsonValue = serde_json::from_str(text)
            .map_err(|e| LoadError::new(format!("invalid JSON: {}", e)))?;
        Document::from_json(raw)
    }

    fn check_shape(&self) -> Result<(), LoadError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(LoadError::new(format!("duplicate node id '{}'", node.id)));
            }
            match (&node.expr, &node.blocks) {
                (Some(_), Some(_)) => {
                    return Err(LoadError::new(format!(
                        "node '{}' has both an expression and blocks",
                        node.id
                    )));
                }
                (None, None) => {
                    return Err(LoadError::new(format!("node '{}' has no body", node.id)));
                }
                (None, Some(blocks)) => {
                    let entry = node.entry.as_deref().ok_or_else(|| {
                        LoadError::new(format!("block node '{}' has no entry", node.id))
                    })?;
                    check_blocks(&node.id, blocks, entry)?;
                }
                (Some(_), None) => {}
            }
        }
        if !ids.contains(self.result.as_str()) {
            return Err(LoadError::new(format!(
                "result node '{}' does not exist",
                self.result
            )));
        }
        Ok(())
    }
}

/// Verify the entry and every terminator destination name existing blocks.
fn check_blocks(node_id: &str, blocks: &[Block], entry: &str) -> Result<(), LoadError> {
    let block_ids: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
    let check = |dest: &str| -> Result<(), LoadError> {
        if block_ids.contains(dest) {
            Ok(())
        } else {
            Err(LoadError::new(format!(
                "node '{}': terminator destination '{}' is not a block",
                node_id, dest
            )))
        }
    };
    if !block_ids.contains(entry) {
        return Err(LoadError::new(format!(
            "node '{}': entry '{}' is not a block",
            node_id, entry
        )));
    }
    for block in blocks {
        match &block.terminator {
            Terminator::Jump { to } => check(to)?,
            Terminator::Branch { then, otherwise, .. } => {
                check(then)?;
                check(otherwise)?;
            }
            Terminator::Return { .. } | Terminator::Exit { .. } => {}
            Terminator::Fork {
                branches,
                continuation,
            } => {
                for branch in branches {
                    check(&branch.block)?;
                }
                check(continuation)?;
            }
            Terminator::Join { to, .. } => check(to)?,
            Terminator::Suspend { resume, .. } => check(resume)?,
        }
    }
    Ok(())
}

/// Rewrite `$imports` into `$defs`: each imported namespace's URI gains a
/// `#/$defs` fragment so later pointer resolution lands in the source
/// document's defs table.
fn desugar_imports(raw: &mut JsonValue) -> Result<(), LoadError> {
    let Some(obj) = raw.as_object_mut() else {
        return Err(LoadError::new("document root must be an object"));
    };
    let Some(imports) = obj.remove("$imports") else {
        return Ok(());
    };
    let Some(imports) = imports.as_object() else {
        return Err(LoadError::new("$imports must be an object"));
    };
    let defs = obj
        .entry("$defs")
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
    let Some(defs) = defs.as_object_mut() else {
        return Err(LoadError::new("$defs must be an object"));
    };
    for (ns, entry) in imports {
        let uri = entry
            .get("$ref")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                LoadError::new(format!("$imports entry '{}' has no $ref string", ns))
            })?;
        defs.insert(
            ns.clone(),
            serde_json::json!({ "$ref": format!("{}#/$defs", uri) }),
        );
    }
    Ok(())
}

/// Replace `{id, $ref}` nodes by the JSON-Pointer target, keeping the id.
/// Only intra-document fragments (`#/...`) resolve here.
fn splice_ref_nodes(raw: &mut JsonValue) -> Result<(), LoadError> {
    let root = raw.clone();
    let Some(nodes) = raw.get_mut("nodes").and_then(JsonValue::as_array_mut) else {
        return Ok(()); // shape error surfaces at deserialization
    };
    for node in nodes.iter_mut() {
        let Some(reference) = node.get("$ref").and_then(JsonValue::as_str) else {
            continue;
        };
        let id = node
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| LoadError::new("reference node has no id"))?
            .to_string();
        let pointer = reference.strip_prefix('#').ok_or_else(|| {
            LoadError::new(format!(
                "node '{}': only intra-document references resolve, got '{}'",
                id, reference
            ))
        })?;
        let mut target = root.pointer(pointer).cloned().ok_or_else(|| {
            LoadError::new(format!("node '{}': '{}' resolves to nothing", id, reference))
        })?;
        let Some(target_obj) = target.as_object_mut() else {
            return Err(LoadError::new(format!(
                "node '{}': '{}' does not reference an object",
                id, reference
            )));
        };
        target_obj.insert("id".to_string(), JsonValue::String(id));
        *node = target;
    }
    Ok(())
}
