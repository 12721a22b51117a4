use std::collections::BTreeMap;

use crate::error::{PipelineError, StoreError};
use crate::pipeline::{RunContext, Slot, Stage};
use crate::store::{encode, with_retry, Store, WriteMode};
use keel_core::model::{ExternalView, STATE_DROPPED};

const METRIC_EXTERNAL_VIEW_WRITES: &str = "keel_external_view_writes";

/// Publishes the external view of every managed resource.
///
/// Views are built from the actual state reported by live instances, and only written when they
/// differ from the last published view. Views of resources which are no longer managed are
/// deleted.
pub struct ExternalViewComputeStage;

impl Stage for ExternalViewComputeStage {
    fn name(&self) -> &'static str {
        "external-view-compute"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot, Slot::Resources, Slot::CurrentState]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::ExternalViews]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let resources = ctx.resources()?;
        let current = ctx.current_state()?;
        let attempts = ctx.config.store_retry_attempts;

        let mut views = BTreeMap::new();
        for resource in resources.values() {
            let mut view = ExternalView::new(resource.name.as_str());
            view.bucket_size = resource.bucket_size;
            for (partition, states) in current.resource_current_states(&resource.name).into_iter().flatten() {
                for (instance, state) in states.iter().filter(|(_, state)| state.as_str() != STATE_DROPPED) {
                    view.set_state(partition, instance, state);
                }
            }

            let previous = snapshot.external_views.get(&resource.name);
            if previous.map(|prev| prev.value == view).unwrap_or(false) {
                views.insert(resource.name.clone(), view);
                continue;
            }
            let key = ctx.keys.external_view(&resource.name);
            publish(ctx.store, attempts, &key, &view, previous.map(|prev| prev.version)).map_err(|source| PipelineError::Persist {
                what: format!("external view of {}", resource.name),
                source,
            })?;
            metrics::increment_counter!(METRIC_EXTERNAL_VIEW_WRITES);
            tracing::debug!(resource = %resource.name, "external view published");
            views.insert(resource.name.clone(), view);
        }

        for resource in snapshot.external_views.keys().filter(|name| !resources.contains_key(*name)) {
            let key = ctx.keys.external_view(resource);
            with_retry(attempts, "delete", || ctx.store.delete(&key)).map_err(|source| PipelineError::Persist {
                what: format!("external view of {}", resource),
                source,
            })?;
            tracing::debug!(resource = %resource, "external view of unmanaged resource removed");
        }

        ctx.set_external_views(views)
    }
}

/// Write a view conditionally on the version it was last read at.
///
/// A conflicting concurrent write is resolved by re-reading the latest version and writing
/// again, at most `attempts` times.
fn publish(store: &dyn Store, attempts: u32, key: &str, view: &ExternalView, mut version: Option<u64>) -> Result<(), StoreError> {
    let value = encode(key, view)?;
    let mut attempt = 1;
    loop {
        let mode = match version {
            Some(version) => WriteMode::CompareAndSet(version),
            None => WriteMode::CreateIfAbsent,
        };
        match with_retry(attempts, "write", || store.write(key, value.clone(), mode)) {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::AlreadyExists(_)) if attempt < attempts => {
                tracing::debug!(key, attempt, "external view changed concurrently, re-reading version");
                version = with_retry(attempts, "get", || store.get(key))?.map(|node| node.version);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Describe the metrics recorded by this stage.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_EXTERNAL_VIEW_WRITES, metrics::Unit::Count, "external view writes");
}
