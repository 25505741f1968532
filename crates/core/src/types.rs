//! Type descriptors.
//!
//! Documents annotate literals, operator signatures, and task returns with
//! structural type descriptors. The evaluator is dynamically typed; these
//! descriptors drive literal decoding and are carried through signatures
//! without being checked (a separate type checker is the collaborator that
//! enforces them).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural type descriptor, `{"kind": "...", ...}` on the wire.
///
/// Element-type fields are optional everywhere: a bare `{"kind": "list"}`
/// is a list of anything. The set element key has accumulated three
/// spellings in existing documents (`of`, `elem`, `elementType`); all are
/// accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Type {
    Bool,
    Int,
    Float,
    String,
    Void,
    Set {
        #[serde(default, alias = "elem", alias = "elementType", skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    Map {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Box<Type>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Box<Type>>,
    },
    Option {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    Opaque {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Fn {
        #[serde(default)]
        params: Vec<Type>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returns: Option<Box<Type>>,
    },
    Ref {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    Future {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    Channel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
    Task {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returns: Option<Box<Type>>,
    },
    Async {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Box<Type>>,
    },
}

impl Type {
    /// Short name of the kind, matching the wire tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::String => "string",
            Type::Void => "void",
            Type::Set { .. } => "set",
            Type::List { .. } => "list",
            Type::Map { .. } => "map",
            Type::Option { .. } => "option",
            Type::Opaque { .. } => "opaque",
            Type::Fn { .. } => "fn",
            Type::Ref { .. } => "ref",
            Type::Future { .. } => "future",
            Type::Channel { .. } => "channel",
            Type::Task { .. } => "task",
            Type::Async { .. } => "async",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind_name())
    }
}

/// Channel discipline declared at creation.
///
/// All four kinds share the bounded-FIFO contract; `broadcast` fans each
/// send out to every attached receiver instead of delivering to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Mpsc,
    Spsc,
    Mpmc,
    Broadcast,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Mpsc => "mpsc",
            ChannelKind::Spsc => "spsc",
            ChannelKind::Mpmc => "mpmc",
            ChannelKind::Broadcast => "broadcast",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_kind_round_trip() {
        let json = serde_json::to_string(&Type::Int).unwrap();
        assert_eq!(json, r#"{"kind":"int"}"#);
        let back: Type = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Type::Int);
    }

    #[test]
    fn test_set_element_aliases() {
        for key in ["of", "elem", "elementType"] {
            let json = format!(r#"{{"kind":"set","{}":{{"kind":"int"}}}}"#, key);
            let ty: Type = serde_json::from_str(&json).unwrap();
            assert_eq!(
                ty,
                Type::Set {
                    of: Some(Box::new(Type::Int))
                },
                "alias {} should parse",
                key
            );
        }
    }

    #[test]
    fn test_fn_type() {
        let json = r#"{"kind":"fn","params":[{"kind":"int"}],"returns":{"kind":"int"}}"#;
        let ty: Type = serde_json::from_str(json).unwrap();
        assert_eq!(
            ty,
            Type::Fn {
                params: vec![Type::Int],
                returns: Some(Box::new(Type::Int)),
            }
        );
    }

    #[test]
    fn test_bare_collection_types() {
        let ty: Type = serde_json::from_str(r#"{"kind":"list"}"#).unwrap();
        assert_eq!(ty, Type::List { of: None });
        let ty: Type = serde_json::from_str(r#"{"kind":"map"}"#).unwrap();
        assert_eq!(ty, Type::Map { key: None, value: None });
    }

    #[test]
    fn test_channel_kind_round_trip() {
        let json = serde_json::to_string(&ChannelKind::Broadcast).unwrap();
        assert_eq!(json, "\"broadcast\"");
        let back: ChannelKind = serde_json::from_str("\"mpmc\"").unwrap();
        assert_eq!(back, ChannelKind::Mpmc);
    }
}
