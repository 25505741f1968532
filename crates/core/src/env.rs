//! Persistent environments.
//!
//! An environment maps identifiers to values. Extension never mutates:
//! `extend` returns a new environment whose new binding shadows any older
//! one, sharing the tail with the original. Closures capture environments
//! by cloning the handle, which is a single reference-count bump, so
//! lexical scoping falls out of the sharing structure.

use std::rc::Rc;

struct Node<V> {
    name: String,
    value: V,
    next: Option<Rc<Node<V>>>,
}

/// Immutable identifier-to-value mapping.
///
/// Lookup walks the chain from the newest binding outward, so shadowing
/// is resolution order, not replacement.
pub struct Env<V> {
    head: Option<Rc<Node<V>>>,
}

impl<V> Clone for Env<V> {
    fn clone(&self) -> Self {
        Env {
            head: self.head.clone(),
        }
    }
}

impl<V> Default for Env<V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<V> Env<V> {
    /// A fresh environment with no bindings.
    pub fn empty() -> Self {
        Env { head: None }
    }

    /// Look up the innermost binding for `name`.
    pub fn lookup(&self, name: &str) -> Option<&V> {
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            if node.name == name {
                return Some(&node.value);
            }
            cursor = node.next.as_deref();
        }
        None
    }

    /// Return a new environment where `name` is bound to `value`,
    /// shadowing any existing binding of the same name.
    pub fn extend(&self, name: impl Into<String>, value: V) -> Self {
        Env {
            head: Some(Rc::new(Node {
                name: name.into(),
                value,
                next: self.head.clone(),
            })),
        }
    }

    /// Whether any binding exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for Env<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        let mut seen = std::collections::HashSet::new();
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            // Shadowed bindings are unreachable; show the visible view.
            if seen.insert(node.name.as_str()) {
                map.entry(&node.name, &node.value);
            }
            cursor = node.next.as_deref();
        }
        map.finish()
    }
}
