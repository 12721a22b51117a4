//! Change watches.
//!
//! Store watches are one-shot: after a notification fires, the watch must be armed again. The
//! `ChangeListener` owns all watches of a cluster and re-arms them as notifications arrive,
//! tracking the children seen under every watched parent in a `WatchSet` so that it only
//! subscribes to paths which appeared and unsubscribes from paths which disappeared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::event::{ChangeCategory, ChangeEvent, ChangePhase};
use crate::store::{with_retry, ChangeKind, Store, StoreChange, StoreResult};
use keel_core::Keys;

/// Registration of one-shot watches with a store's notification transport.
pub trait WatchRegistrar: Send + Sync {
    /// Watch the value at the given path.
    fn watch_data(&self, path: &str);

    /// Watch the set of children below the given path.
    fn watch_children(&self, path: &str);

    /// Remove any watch of the given path.
    fn unwatch(&self, path: &str);
}

/// The difference between two observations of a parent's children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// The last observed children of every watched parent path.
#[derive(Clone, Debug, Default)]
pub struct WatchSet {
    children: BTreeMap<String, BTreeSet<String>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current children of a parent, returning the full paths which appeared and
    /// disappeared since the last observation.
    pub fn update(&mut self, parent: &str, children: Vec<String>) -> WatchDiff {
        let next: BTreeSet<String> = children.into_iter().collect();
        let previous = self.children.insert(parent.to_string(), next.clone()).unwrap_or_default();
        WatchDiff {
            added: next.difference(&previous).map(|child| join(parent, child)).collect(),
            removed: previous.difference(&next).map(|child| join(parent, child)).collect(),
        }
    }

    /// Forget the given path along with everything recorded below it.
    pub fn forget(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.children.retain(|parent, _| parent != path && !parent.starts_with(&prefix));
    }

    /// The last observed children of the given parent.
    pub fn children(&self, parent: &str) -> Option<&BTreeSet<String>> {
        self.children.get(parent)
    }

    pub fn is_watched(&self, parent: &str) -> bool {
        self.children.contains_key(parent)
    }
}

/// A watched subtree: a parent path and the number of levels of children below it. Paths at
/// the deepest level are records and are watched for data changes.
#[derive(Clone, Debug)]
struct WatchRoot {
    path: String,
    depth: usize,
}

/// Translates store notifications of one cluster into controller events.
pub struct ChangeListener {
    keys: Keys,
    store: Arc<dyn Store>,
    registrar: Arc<dyn WatchRegistrar>,
    attempts: u32,
    roots: Vec<WatchRoot>,
    /// Single records watched for data changes only.
    records: Vec<String>,
    watches: WatchSet,
}

impl ChangeListener {
    pub fn new(keys: Keys, store: Arc<dyn Store>, registrar: Arc<dyn WatchRegistrar>, attempts: u32) -> Self {
        let roots = vec![
            WatchRoot { path: keys.ideal_states(), depth: 1 },
            WatchRoot { path: keys.live_instances(), depth: 1 },
            WatchRoot { path: keys.participant_configs(), depth: 1 },
            WatchRoot { path: keys.state_model_defs(), depth: 1 },
            WatchRoot { path: keys.current_states_root(), depth: 3 },
            WatchRoot { path: keys.messages_root(), depth: 2 },
            WatchRoot { path: keys.external_views(), depth: 1 },
        ];
        let records = vec![keys.cluster_config(), keys.leader(), keys.pause()];
        Self {
            keys,
            store,
            registrar,
            attempts,
            roots,
            records,
            watches: WatchSet::new(),
        }
    }

    /// Arm every watch of the cluster, returning the event which triggers the first run.
    pub fn init(&mut self) -> StoreResult<ChangeEvent> {
        self.resync()?;
        Ok(ChangeEvent::new(ChangeCategory::Controller, ChangePhase::Init, None))
    }

    /// Re-arm every watch of the cluster, reconciling the tracked children with the store.
    pub fn resync(&mut self) -> StoreResult<()> {
        for record in self.records.iter() {
            self.registrar.watch_data(record);
        }
        let roots = self.roots.clone();
        for root in roots.iter() {
            self.arm(&root.path, root.depth)?;
        }
        Ok(())
    }

    /// Re-arm the watch which fired and translate the notification into an event.
    ///
    /// Returns `None` for notifications outside of the cluster. A failure to re-arm is logged;
    /// the next resync recovers the lost watches.
    pub fn on_change(&mut self, change: &StoreChange) -> Option<ChangeEvent> {
        let category = ChangeCategory::for_path(&self.keys, &change.path)?;
        match change.kind {
            ChangeKind::ChildrenChanged => {
                if let Some(depth) = self.depth_of(&change.path) {
                    if let Err(err) = self.arm(&change.path, depth) {
                        tracing::error!(error = ?err, path = %change.path, "error re-arming children watch");
                    }
                }
            }
            ChangeKind::DataChanged => self.registrar.watch_data(&change.path),
            // Removal is observed by the parent's children watch.
            ChangeKind::Deleted => (),
        }
        Some(ChangeEvent::new(category, ChangePhase::Callback, Some(change.path.clone())))
    }

    /// Remove every watch of the cluster.
    pub fn finalize(&mut self) -> ChangeEvent {
        for record in self.records.iter() {
            self.registrar.unwatch(record);
        }
        let roots = self.roots.clone();
        for root in roots.iter() {
            self.unwatch_tree(&root.path);
        }
        ChangeEvent::new(ChangeCategory::Controller, ChangePhase::Finalize, None)
    }

    /// The last observed children of the given watched parent.
    pub fn watched_children(&self, parent: &str) -> Option<&BTreeSet<String>> {
        self.watches.children(parent)
    }

    /// The number of child levels below the given path, if it is a watched parent.
    fn depth_of(&self, path: &str) -> Option<usize> {
        self.roots.iter().find_map(|root| {
            if path == root.path {
                return Some(root.depth);
            }
            let rest = path.strip_prefix(root.path.as_str())?.strip_prefix('/')?;
            let levels = rest.split('/').count();
            root.depth.checked_sub(levels).filter(|depth| *depth > 0)
        })
    }

    /// Watch the children of a parent and, recursively, everything below it.
    fn arm(&mut self, parent: &str, depth: usize) -> StoreResult<()> {
        self.registrar.watch_children(parent);
        let store = self.store.clone();
        let children = with_retry(self.attempts, "children", || store.children(parent))?;
        let diff = self.watches.update(parent, children);

        for removed in diff.removed.iter() {
            self.unwatch_tree(removed);
        }
        // Children seen before keep their watches.
        for child in diff.added {
            if depth > 1 {
                self.arm(&child, depth - 1)?;
            } else {
                self.registrar.watch_data(&child);
            }
        }
        Ok(())
    }

    fn unwatch_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let watched: Vec<String> = self
            .watches
            .children
            .iter()
            .filter(|(parent, _)| parent.as_str() == path || parent.starts_with(&prefix))
            .flat_map(|(parent, children)| children.iter().map(move |child| join(parent, child)))
            .collect();
        for child in watched {
            self.registrar.unwatch(&child);
        }
        self.registrar.unwatch(path);
        self.watches.forget(path);
    }
}

fn join(parent: &str, child: &str) -> String {
    format!("{}/{}", parent, child)
}
