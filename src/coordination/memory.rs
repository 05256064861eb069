// In-process coordination directory
//
// Backs tests and single-process clusters. All handles created with
// `attach` share one tree; each handle tracks the ephemeral entries it
// created and removes them on close.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{CoordinationSession, DirMode, Watch};
use crate::error::{MeshError, Result};

#[derive(Default)]
struct Entry {
    data: Bytes,
    children: BTreeMap<String, Entry>,
    data_watches: Vec<Watch>,
    child_watches: Vec<Watch>,
}

impl Entry {
    /// Drain every watch in this subtree, for firing after removal.
    fn drain_watches(&mut self, into: &mut Vec<Watch>) {
        into.append(&mut self.data_watches);
        into.append(&mut self.child_watches);
        for child in self.children.values_mut() {
            child.drain_watches(into);
        }
    }
}

/// Shared in-process directory tree plus this handle's ephemeral entries.
pub struct MemorySession {
    root: Arc<Mutex<Entry>>,
    ephemeral: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Mutex::new(Entry::default())),
            ephemeral: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A second handle onto the same tree, with its own ephemeral scope.
    pub fn attach(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            ephemeral: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Remove this handle's ephemeral entries. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let paths: Vec<String> = self.ephemeral.lock().drain(..).collect();
        for path in paths {
            if let Err(e) = self.remove(&path) {
                debug!("ephemeral cleanup of {} skipped: {}", path, e);
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Coordination("session closed".to_string()));
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let fired = {
            let mut root = self.root.lock();
            let segments = split(path)?;
            let (parent_segments, leaf) = segments.split_at(segments.len() - 1);

            let mut cur = &mut *root;
            for seg in parent_segments {
                cur = cur
                    .children
                    .get_mut(*seg)
                    .ok_or_else(|| missing(path))?;
            }

            let mut removed = cur.children.remove(leaf[0]).ok_or_else(|| missing(path))?;
            let mut fired = Vec::new();
            removed.drain_watches(&mut fired);
            fired.append(&mut cur.child_watches);
            fired
        };
        fire(fired);
        Ok(())
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    async fn mkdir_recursive(&self, path: &str, mode: DirMode) -> Result<()> {
        self.check_open()?;
        let fired = {
            let mut root = self.root.lock();
            let segments = split(path)?;

            let mut fired = Vec::new();
            let mut cur = &mut *root;
            for seg in &segments {
                if !cur.children.contains_key(*seg) {
                    cur.children.insert(seg.to_string(), Entry::default());
                    fired.append(&mut cur.child_watches);
                }
                cur = cur.children.get_mut(*seg).expect("just inserted");
            }
            fired
        };

        if mode == DirMode::Ephemeral {
            self.ephemeral.lock().push(path.to_string());
        }
        fire(fired);
        Ok(())
    }

    async fn get_subdirs(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>> {
        self.check_open()?;
        let mut root = self.root.lock();
        let entry = find(&mut root, path)?;
        if let Some(w) = watch {
            entry.child_watches.push(w);
        }
        Ok(entry.children.keys().cloned().collect())
    }

    async fn get_data(&self, path: &str, watch: Option<Watch>) -> Result<Bytes> {
        self.check_open()?;
        let mut root = self.root.lock();
        let entry = find(&mut root, path)?;
        if let Some(w) = watch {
            entry.data_watches.push(w);
        }
        Ok(entry.data.clone())
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<()> {
        self.check_open()?;
        let fired = {
            let mut root = self.root.lock();
            let entry = find(&mut root, path)?;
            entry.data = data;
            std::mem::take(&mut entry.data_watches)
        };
        fire(fired);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        self.remove(path)
    }
}

fn split(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(MeshError::Coordination(format!("invalid path: {}", path)));
    }
    Ok(segments)
}

fn missing(path: &str) -> MeshError {
    MeshError::Coordination(format!("no such entry: {}", path))
}

fn find<'a>(root: &'a mut Entry, path: &str) -> Result<&'a mut Entry> {
    let mut cur = root;
    for seg in split(path)? {
        cur = cur.children.get_mut(seg).ok_or_else(|| missing(path))?;
    }
    Ok(cur)
}

fn fire(watches: Vec<Watch>) {
    for w in watches {
        w();
    }
}
