//! An in-memory `Store`.
//!
//! This is the reference implementation of the store contract: versioned values, conditional
//! writes, atomic batches and one-shot watches whose notifications are published on a broadcast
//! channel. It backs embedded deployments and all tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::store::{parent_path, ChangeKind, Store, StoreChange, StoreError, StoreResult, Versioned, WriteMode};
use crate::watch::WatchRegistrar;

/// The capacity of the change notification channel.
const CHANGES_CAPACITY: usize = 1024;

/// An in-memory hierarchical store.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    changes: broadcast::Sender<StoreChange>,
}

#[derive(Default)]
struct MemoryStoreInner {
    nodes: BTreeMap<String, Versioned<Value>>,
    data_watches: BTreeSet<String>,
    child_watches: BTreeSet<String>,
    /// The number of upcoming operations which will fail as unavailable.
    injected_failures: u32,
    /// The number of successful writes by path.
    writes: BTreeMap<String, u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            inner: Mutex::new(MemoryStoreInner::default()),
            changes,
        }
    }

    /// Subscribe to the change notifications of watched paths.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Make the next `count` operations fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.injected_failures = count;
        }
    }

    /// The number of successful writes made to paths starting with the given prefix.
    pub fn write_count(&self, prefix: &str) -> u64 {
        match self.inner.lock() {
            Ok(inner) => inner.writes.iter().filter(|(path, _)| path.starts_with(prefix)).map(|(_, count)| count).sum(),
            Err(_) => 0,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryStoreInner>> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        if inner.injected_failures > 0 {
            inner.injected_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(inner)
    }

    fn publish(&self, changes: Vec<StoreChange>) {
        for change in changes {
            // No receivers simply means nobody is watching right now.
            let _ = self.changes.send(change);
        }
    }
}

impl MemoryStoreInner {
    /// Check if a value exists at or below the given path.
    fn path_exists(&self, path: &str) -> bool {
        if self.nodes.contains_key(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.nodes.range(prefix.clone()..).next().map(|(key, _)| key.starts_with(&prefix)).unwrap_or(false)
    }

    /// Check a single write against its mode, returning the value to be stored.
    fn prepare(&self, key: &str, value: Value, mode: WriteMode) -> StoreResult<Versioned<Value>> {
        let existing = self.nodes.get(key);
        let version = existing.map(|node| node.version + 1).unwrap_or(1);
        let value = match (mode, existing) {
            (WriteMode::CreateIfAbsent, Some(_)) => return Err(StoreError::AlreadyExists(key.into())),
            (WriteMode::CreateIfAbsent, None) | (WriteMode::Overwrite, _) => value,
            (WriteMode::Merge, Some(node)) => {
                let mut merged = node.value.clone();
                merge_json(&mut merged, value);
                merged
            }
            (WriteMode::Merge, None) => value,
            (WriteMode::CompareAndSet(expected), node) => match node {
                Some(node) if node.version == expected => value,
                node => {
                    return Err(StoreError::VersionConflict {
                        key: key.into(),
                        expected,
                        found: node.map(|node| node.version),
                    })
                }
            },
        };
        Ok(Versioned { value, version })
    }

    /// Apply a prepared write, returning the notifications it triggers.
    fn apply(&mut self, key: String, node: Versioned<Value>) -> Vec<StoreChange> {
        let mut changes = vec![];
        if !self.nodes.contains_key(&key) {
            // Walk up while the intermediate paths are new; the first pre-existing ancestor's
            // child set is the last one which changes.
            let mut child = key.as_str();
            while let Some(parent) = parent_path(child) {
                let child_existed = self.path_exists(child);
                if !child_existed {
                    self.fire_children(parent, &mut changes);
                }
                if child_existed || self.path_exists(parent) {
                    break;
                }
                child = parent;
            }
        }
        if self.data_watches.remove(&key) {
            changes.push(StoreChange {
                path: key.clone(),
                kind: ChangeKind::DataChanged,
            });
        }
        *self.writes.entry(key.clone()).or_default() += 1;
        self.nodes.insert(key, node);
        changes
    }

    fn fire_children(&mut self, path: &str, changes: &mut Vec<StoreChange>) {
        if self.child_watches.remove(path) {
            changes.push(StoreChange {
                path: path.into(),
                kind: ChangeKind::ChildrenChanged,
            });
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Versioned<Value>>> {
        let inner = self.lock()?;
        Ok(inner.nodes.get(key).cloned())
    }

    fn children(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock()?;
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let children: BTreeSet<String> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| path[prefix.len()..].split('/').next().map(String::from))
            .filter(|name| !name.is_empty())
            .collect();
        Ok(children.into_iter().collect())
    }

    fn write(&self, key: &str, value: Value, mode: WriteMode) -> StoreResult<u64> {
        let changes = {
            let mut inner = self.lock()?;
            let node = inner.prepare(key, value, mode)?;
            let version = node.version;
            (inner.apply(key.to_string(), node), version)
        };
        self.publish(changes.0);
        Ok(changes.1)
    }

    fn write_batch(&self, entries: Vec<(String, Value)>, mode: WriteMode) -> StoreResult<()> {
        if let WriteMode::CompareAndSet(_) = mode {
            return Err(StoreError::Unsupported("compare-and-set batch writes".into()));
        }
        let changes = {
            let mut inner = self.lock()?;
            let mut keys = BTreeSet::new();
            let mut prepared = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                if !keys.insert(key.clone()) {
                    return Err(StoreError::Unsupported(format!("duplicate key {} in batch", key)));
                }
                let node = inner.prepare(&key, value, mode)?;
                prepared.push((key, node));
            }
            let mut changes = vec![];
            for (key, node) in prepared {
                changes.extend(inner.apply(key, node));
            }
            changes
        };
        self.publish(changes);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let changes = {
            let mut inner = self.lock()?;
            let prefix = format!("{}/", key);
            let mut removed: Vec<String> = inner
                .nodes
                .range(prefix.clone()..)
                .take_while(|(path, _)| path.starts_with(&prefix))
                .map(|(path, _)| path.clone())
                .collect();
            if inner.nodes.contains_key(key) {
                removed.push(key.to_string());
            }
            if removed.is_empty() {
                return Ok(false);
            }

            let mut changes = vec![];
            let mut parents = BTreeSet::new();
            for path in removed.iter() {
                inner.nodes.remove(path);
                if inner.data_watches.remove(path) {
                    changes.push(StoreChange {
                        path: path.clone(),
                        kind: ChangeKind::Deleted,
                    });
                }
                if let Some(parent) = parent_path(path) {
                    parents.insert(parent.to_string());
                }
            }
            // Every parent inside the deleted subtree lost children, as did the subtree's own
            // parent and any ancestor left without children.
            let mut child = key;
            while let Some(parent) = parent_path(child) {
                parents.insert(parent.to_string());
                if inner.path_exists(parent) {
                    break;
                }
                child = parent;
            }
            for parent in parents {
                inner.fire_children(&parent, &mut changes);
            }
            changes
        };
        self.publish(changes);
        Ok(true)
    }
}

impl WatchRegistrar for MemoryStore {
    fn watch_data(&self, path: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.data_watches.insert(path.to_string());
        }
    }

    fn watch_children(&self, path: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.child_watches.insert(path.to_string());
        }
    }

    fn unwatch(&self, path: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.data_watches.remove(path);
            inner.child_watches.remove(path);
        }
    }
}

/// Deep-merge `patch` into `base`. Objects are merged key by key; anything else is replaced.
pub(crate) fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, val) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, val),
                    None => {
                        base.insert(key, val);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
