//! Path keys: structural addresses of doc parts
//!
//! A schemaless document maps to one table per nesting level. The path key
//! identifies one such level: the collection root, or a named child path
//! reached through object fields and arrays. Path keys are the join key
//! between logical index fields and doc parts, and their total order is
//! used to process doc parts parent-before-child (creation) or
//! child-before-parent (destruction).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Tree-structured address of a doc part within a collection.
///
/// Two path keys are equal iff their segment sequences are equal. The
/// derived total order sorts by depth first, then lexicographically by
/// segments, so any parent sorts before all of its children.
///
/// # Example
///
/// ```
/// use shred_core::PathKey;
///
/// let root = PathKey::root();
/// let addresses = root.child("addresses");
/// assert_eq!(addresses.depth(), 1);
/// assert_eq!(addresses.parent(), Some(root.clone()));
/// assert!(root < addresses);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    segments: Vec<String>,
}

impl PathKey {
    /// The path key of a collection's root doc part.
    pub fn root() -> Self {
        PathKey {
            segments: Vec::new(),
        }
    }

    /// The path key of the named child of this path.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend(self.segments.iter().cloned());
        segments.push(name.into());
        PathKey { segments }
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<PathKey> {
        if self.segments.is_empty() {
            return None;
        }
        Some(PathKey {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Number of segments from the collection root (root = 0).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the collection root.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The last segment name, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The full segment sequence, root-first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `self` is `other` or an ancestor of `other`.
    pub fn is_ancestor_or_self(&self, other: &PathKey) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth()
            .cmp(&other.depth())
            .then_with(|| self.segments.cmp(&other.segments))
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "<root>");
        }
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromIterator<String> for PathKey {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        PathKey {
            segments: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // === Construction ===

    #[test]
    fn test_root_has_depth_zero() {
        let root = PathKey::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);
        assert_eq!(root.name(), None);
    }

    #[test]
    fn test_child_extends_parent() {
        let path = PathKey::root().child("a").child("b");
        assert_eq!(path.depth(), 2);
        assert_eq!(path.name(), Some("b"));
        assert_eq!(path.segments(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parent_of_child_round_trips() {
        let parent = PathKey::root().child("a");
        let child = parent.child("b");
        assert_eq!(child.parent(), Some(parent));
    }

    // === Equality ===

    #[test]
    fn test_equality_is_structural() {
        let a = PathKey::root().child("x").child("y");
        let b = PathKey::root().child("x").child("y");
        let c = PathKey::root().child("x").child("z");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_iterator() {
        let built: PathKey = ["a".to_string(), "b".to_string()].into_iter().collect();
        assert_eq!(built, PathKey::root().child("a").child("b"));
    }

    // === Ordering ===

    #[test]
    fn test_order_is_depth_first() {
        let root = PathKey::root();
        let a = root.child("a");
        let zz = root.child("zz");
        let ab = a.child("b");
        assert!(root < a);
        assert!(a < zz);
        // deeper paths always sort after shallower ones
        assert!(zz < ab);
    }

    #[test]
    fn test_sort_yields_parent_before_child() {
        let root = PathKey::root();
        let mut paths = vec![
            root.child("b").child("c"),
            root.clone(),
            root.child("b"),
            root.child("a"),
        ];
        paths.sort();
        assert_eq!(paths[0], root);
        assert_eq!(paths[3], root.child("b").child("c"));
    }

    // === Ancestry ===

    #[test]
    fn test_ancestor_or_self() {
        let root = PathKey::root();
        let a = root.child("a");
        let ab = a.child("b");
        assert!(root.is_ancestor_or_self(&ab));
        assert!(a.is_ancestor_or_self(&ab));
        assert!(ab.is_ancestor_or_self(&ab));
        assert!(!ab.is_ancestor_or_self(&a));
        assert!(!root.child("x").is_ancestor_or_self(&ab));
    }

    // === Display ===

    #[test]
    fn test_display() {
        assert_eq!(PathKey::root().to_string(), "<root>");
        assert_eq!(
            PathKey::root().child("a").child("b").to_string(),
            "a.b"
        );
    }

    // === Properties ===

    proptest! {
        #[test]
        fn prop_parent_sorts_before_child(segments in proptest::collection::vec("[a-z]{1,8}", 1..5)) {
            let path: PathKey = segments.into_iter().collect();
            let parent = path.parent().unwrap();
            prop_assert!(parent < path);
            prop_assert!(parent.is_ancestor_or_self(&path));
        }

        #[test]
        fn prop_child_then_parent_is_identity(
            segments in proptest::collection::vec("[a-z]{1,8}", 0..4),
            name in "[a-z]{1,8}",
        ) {
            let base: PathKey = segments.into_iter().collect();
            prop_assert_eq!(base.child(name).parent(), Some(base));
        }
    }
}
