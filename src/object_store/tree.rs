//! Tree snapshots: a sorted list of named children, each either a blob
//! (with a content kind) or a nested tree.

use serde::{Deserialize, Serialize};

use crate::errors::DogmaError;
use crate::hash::ObjectHash;
use crate::object_store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeNode {
    Blob { kind: BlobKind, hash: ObjectHash },
    Tree { hash: ObjectHash },
}

/// One named child of a [`Tree`]. The list a `Tree` holds is always kept
/// sorted by `name` so that two trees with the same children hash
/// identically regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub node: TreeNode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Returns a copy of this tree with `name` set to `node`, inserted in
    /// sorted position (or replacing the existing entry of that name).
    pub fn with_entry(&self, name: &str, node: TreeNode) -> Tree {
        let mut entries: Vec<TreeEntry> =
            self.entries.iter().filter(|e| e.name != name).cloned().collect();
        entries.push(TreeEntry {
            name: name.to_string(),
            node,
        });
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Tree { entries }
    }

    /// Returns a copy of this tree with `name` removed, if present.
    pub fn without_entry(&self, name: &str) -> Tree {
        Tree {
            entries: self.entries.iter().filter(|e| e.name != name).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Tree always serializes")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Tree, DogmaError> {
        serde_json::from_slice(data).map_err(|e| DogmaError::Codec(e.to_string()))
    }

    pub fn write(&self, store: &dyn ObjectStore) -> Result<ObjectHash, DogmaError> {
        store.write(&self.to_bytes())
    }

    pub fn read(store: &dyn ObjectStore, hash: &ObjectHash) -> Result<Tree, DogmaError> {
        Tree::from_bytes(&store.read(hash)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;

    #[test]
    fn insertion_order_does_not_affect_hash() {
        let a = Tree::new()
            .with_entry("b.json", TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"1") })
            .with_entry("a.json", TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"2") });
        let b = Tree::new()
            .with_entry("a.json", TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"2") })
            .with_entry("b.json", TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"1") });
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn with_entry_replaces_existing() {
        let t = Tree::new().with_entry(
            "a.json",
            TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"1") },
        );
        let t2 = t.with_entry(
            "a.json",
            TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"2") },
        );
        assert_eq!(t2.entries.len(), 1);
        assert_eq!(t2.get("a.json").unwrap().node, TreeNode::Blob { kind: BlobKind::Json, hash: ObjectHash::of(b"2") });
    }

    #[test]
    fn round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path(), 1024 * 1024).unwrap();
        let t = Tree::new().with_entry("x", TreeNode::Tree { hash: ObjectHash::of(b"sub") });
        let h = t.write(&store).unwrap();
        let back = Tree::read(&store, &h).unwrap();
        assert_eq!(t, back);
    }
}
