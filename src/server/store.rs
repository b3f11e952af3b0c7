//! Node store for the embedded server.
//!
//! A thread-safe, in-memory tree of nodes keyed by absolute path. It uses
//! `Arc<RwLock<BTreeMap>>` so child listings come out sorted and multiple
//! connection tasks can read concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Path of the root node, which always exists.
pub const ROOT: &str = "/";

/// Errors returned by node operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The node (or the parent, on create) does not exist.
    #[error("No node: {0}")]
    NoNode(String),

    /// A node already exists at the path.
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// The node still has children.
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// The path is not absolute, has a trailing slash, or an empty segment.
    #[error("Invalid path: '{0}'")]
    InvalidPath(String),
}

/// A single node: payload plus a version bumped on every `set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node payload.
    pub data: Vec<u8>,
    /// Number of times the payload was overwritten.
    pub version: u32,
}

/// Thread-safe node tree.
#[derive(Debug, Clone)]
pub struct NodeStore {
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
}

impl NodeStore {
    /// Creates a store holding only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node {
                data: Vec::new(),
                version: 0,
            },
        );
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Creates a node. The parent must exist.
    pub async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
        validate_path(path)?;
        if path == ROOT {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path);
        if !nodes.contains_key(parent) {
            return Err(StoreError::NoNode(parent.to_string()));
        }
        nodes.insert(path.to_string(), Node { data, version: 0 });
        Ok(())
    }

    /// Returns a clone of the node at `path`.
    pub async fn get(&self, path: &str) -> Result<Node, StoreError> {
        validate_path(path)?;
        let nodes = self.nodes.read().await;
        nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    /// Overwrites a node's data and returns the new version.
    pub async fn set(&self, path: &str, data: Vec<u8>) -> Result<u32, StoreError> {
        validate_path(path)?;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        node.data = data;
        node.version += 1;
        Ok(node.version)
    }

    /// Deletes a childless node.
    pub async fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        if path == ROOT {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if has_children(&nodes, path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        nodes.remove(path);
        Ok(())
    }

    /// Returns whether a node exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        validate_path(path)?;
        Ok(self.nodes.read().await.contains_key(path))
    }

    /// Returns the sorted names of the node's direct children.
    pub async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(path)?;
        let nodes = self.nodes.read().await;
        if !nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    /// Returns a copy of the whole tree.
    pub async fn snapshot(&self) -> BTreeMap<String, Node> {
        self.nodes.read().await.clone()
    }

    /// Number of nodes, including the root.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    if path == ROOT {
        return Ok(());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

fn child_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", path)
    }
}

fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_has_root() {
        let store = NodeStore::new();
        assert!(store.exists(ROOT).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = NodeStore::new();
        store.create("/a", vec![1, 2]).await.unwrap();
        let node = store.get("/a").await.unwrap();
        assert_eq!(node.data, vec![1, 2]);
        assert_eq!(node.version, 0);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = NodeStore::new();
        let err = store.create("/a/b", vec![]).await.unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a".to_string()));
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = NodeStore::new();
        store.create("/a", vec![]).await.unwrap();
        let err = store.create("/a", vec![9]).await.unwrap_err();
        assert_eq!(err, StoreError::NodeExists("/a".to_string()));
        assert!(store.get("/a").await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn test_set_bumps_version() {
        let store = NodeStore::new();
        store.create("/a", vec![1]).await.unwrap();
        assert_eq!(store.set("/a", vec![2]).await.unwrap(), 1);
        assert_eq!(store.set("/a", vec![3]).await.unwrap(), 2);
        assert_eq!(store.get("/a").await.unwrap().data, vec![3]);
    }

    #[tokio::test]
    async fn test_set_missing_node_fails() {
        let store = NodeStore::new();
        assert!(matches!(
            store.set("/missing", vec![]).await,
            Err(StoreError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_rejects_non_empty() {
        let store = NodeStore::new();
        store.create("/a", vec![]).await.unwrap();
        store.create("/a/b", vec![]).await.unwrap();
        assert_eq!(
            store.delete("/a").await.unwrap_err(),
            StoreError::NotEmpty("/a".to_string())
        );
        store.delete("/a/b").await.unwrap();
        store.delete("/a").await.unwrap();
        assert!(!store.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_does_not_confuse_sibling_prefixes() {
        let store = NodeStore::new();
        store.create("/a", vec![]).await.unwrap();
        store.create("/ab", vec![]).await.unwrap();
        store.delete("/a").await.unwrap();
        assert!(store.exists("/ab").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_root_is_invalid() {
        let store = NodeStore::new();
        assert!(matches!(
            store.delete(ROOT).await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_children_sorted_and_direct_only() {
        let store = NodeStore::new();
        store.create("/ns", vec![]).await.unwrap();
        store.create("/ns/b", vec![]).await.unwrap();
        store.create("/ns/a", vec![]).await.unwrap();
        store.create("/ns/a/deep", vec![]).await.unwrap();
        store.create("/nsx", vec![]).await.unwrap();

        assert_eq!(store.children("/ns").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.children(ROOT).await.unwrap(), vec!["ns", "nsx"]);
    }

    #[tokio::test]
    async fn test_invalid_paths_rejected() {
        let store = NodeStore::new();
        for path in ["relative", "/trailing/", "/double//slash", ""] {
            assert!(
                matches!(store.exists(path).await, Err(StoreError::InvalidPath(_))),
                "path {:?} should be invalid",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let store = NodeStore::new();
        let cloned = store.clone();
        store.create("/shared", vec![7]).await.unwrap();
        assert_eq!(cloned.get("/shared").await.unwrap().data, vec![7]);
    }

    #[tokio::test]
    async fn test_concurrent_creates_distinct_paths() {
        let store = NodeStore::new();
        let mut handles = vec![];
        for i in 0..20 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                store_clone
                    .create(&format!("/writer-{}", i), vec![i as u8])
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("Writer task panicked").unwrap();
        }
        assert_eq!(store.len().await, 21);
    }

    #[tokio::test]
    async fn test_concurrent_creates_same_path_one_wins() {
        let store = NodeStore::new();
        let mut handles = vec![];
        for _ in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                store_clone.create("/contested", vec![]).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.expect("task panicked").is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
