//! Core store types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a path currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Nothing stored, or an ancestor is a leaf.
    None,
    /// A value and no children.
    Leaf,
    /// Children, and possibly a value in the reserved `~` child.
    Node,
}

impl EntityType {
    /// Returns true if anything exists at the path.
    pub fn exists(&self) -> bool {
        !matches!(self, EntityType::None)
    }

    /// Returns true if this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, EntityType::Leaf)
    }

    /// Returns true if this is a node.
    pub fn is_node(&self) -> bool {
        matches!(self, EntityType::Node)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityType::None => "none",
            EntityType::Leaf => "leaf",
            EntityType::Node => "node",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&EntityType::Node).unwrap(), "\"node\"");
        let parsed: EntityType = serde_json::from_str("\"leaf\"").unwrap();
        assert_eq!(parsed, EntityType::Leaf);
        assert_eq!(EntityType::None.to_string(), "none");
    }

    #[test]
    fn test_predicates() {
        assert!(!EntityType::None.exists());
        assert!(EntityType::Leaf.exists() && EntityType::Leaf.is_leaf());
        assert!(EntityType::Node.exists() && EntityType::Node.is_node());
        assert!(!EntityType::Node.is_leaf());
    }
}
