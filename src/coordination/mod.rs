// Coordination directory contract
//
// A hierarchical namespace with one-shot watches, modeled after the
// directory services the plane is deployed against. The consumer
// re-registers a watch after each fire. Entries are persistent or
// ephemeral; ephemeral entries disappear when the owning session closes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod memory;

pub use memory::MemorySession;

/// Entry lifetime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMode {
    Persistent,
    Ephemeral,
}

/// One-shot change notification. Fired at most once per registration;
/// consumers re-register on the next read.
pub type Watch = Arc<dyn Fn() + Send + Sync>;

/// Primitive operations against the coordination directory.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Create `path` and any missing parents. Parents are persistent;
    /// the leaf gets `mode`. Idempotent for existing entries.
    async fn mkdir_recursive(&self, path: &str, mode: DirMode) -> Result<()>;

    /// Child names of `path`. `watch` fires when the child set changes.
    async fn get_subdirs(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>>;

    /// Data stored at `path`. `watch` fires when the data changes or the
    /// entry is removed.
    async fn get_data(&self, path: &str, watch: Option<Watch>) -> Result<Bytes>;

    /// Replace the data at an existing `path`.
    async fn set_data(&self, path: &str, data: Bytes) -> Result<()>;

    /// Remove `path` and everything under it.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Directory of node registrations under an application root.
pub fn nodes_dir(root: &str) -> String {
    format!("{}/nodes", root)
}

/// Registration path for one node.
pub fn node_path(root: &str, guid: &str) -> String {
    format!("{}/nodes/{}", root, guid)
}
