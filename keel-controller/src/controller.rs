//! The controller event dispatcher.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::Config;
use crate::error::PipelineError;
use crate::event::{ChangeCategory, ChangeEvent, ChangePhase};
use crate::pipeline::{self, PipelineRegistry, RunContext};
use crate::snapshot::{ClusterSnapshot, ControllerMarkers};
use crate::stages;
use crate::store::Store;
use keel_core::Keys;

const METRIC_PIPELINE_RUNS: &str = "keel_pipeline_runs";
const METRIC_EVENTS_SKIPPED: &str = "keel_events_skipped";

/// The reason an event was dropped without running any pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The event is of the finalize phase.
    Finalize,
    /// This controller is not the elected leader of the cluster.
    NotLeader,
    /// The cluster is paused.
    Paused,
    /// The controller markers could not be read.
    MarkersUnavailable,
}

/// The outcome of the handling of a single event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No pipeline was run.
    Skipped(SkipReason),
    /// Every registered pipeline ran to completion.
    Completed { pipelines: usize },
    /// A pipeline failed; the remaining pipelines of the event were not run.
    Aborted { pipeline: &'static str, error: PipelineError },
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// The controller of a single cluster.
///
/// Events are handled one at a time through `&mut self`; independent clusters are managed by
/// independent controllers.
pub struct Controller {
    config: Arc<Config>,
    keys: Keys,
    store: Arc<dyn Store>,
    registry: PipelineRegistry,
    /// The last read controller markers, `None` until first read.
    markers: Option<ControllerMarkers>,
    /// The snapshot of the last run which refreshed one.
    snapshot: Arc<ArcSwapOption<ClusterSnapshot>>,
}

impl Controller {
    /// Create a new instance running the given pipelines.
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, registry: PipelineRegistry) -> Self {
        pipeline::register_metrics();
        stages::register_metrics();
        metrics::register_counter!(METRIC_PIPELINE_RUNS, metrics::Unit::Count, "pipeline runs by category and outcome");
        metrics::register_counter!(METRIC_EVENTS_SKIPPED, metrics::Unit::Count, "events dropped without running pipelines");
        let keys = Keys::new(config.cluster_name.as_str());
        Self {
            config,
            keys,
            store,
            registry,
            markers: None,
            snapshot: Default::default(),
        }
    }

    /// Create a new instance running the standard pipelines.
    pub fn with_standard_pipelines(config: Arc<Config>, store: Arc<dyn Store>) -> Result<Self, PipelineError> {
        let registry = PipelineRegistry::standard()?;
        Ok(Self::new(config, store, registry))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// The snapshot of the last run which refreshed one.
    pub fn latest_snapshot(&self) -> Option<Arc<ClusterSnapshot>> {
        self.snapshot.load_full()
    }

    /// A shared handle to the latest snapshot, for observers outside of the controller.
    pub fn snapshot_handle(&self) -> Arc<ArcSwapOption<ClusterSnapshot>> {
        self.snapshot.clone()
    }

    /// Handle a single change event.
    ///
    /// Errors never escape as panics; they are logged and returned in the outcome.
    #[tracing::instrument(level = "debug", skip(self, event), fields(category = %event.category, phase = ?event.phase))]
    pub fn handle(&mut self, event: &ChangeEvent) -> DispatchOutcome {
        if let Some(reason) = self.gate(event) {
            metrics::increment_counter!(METRIC_EVENTS_SKIPPED, "reason" => skip_reason_label(reason));
            tracing::debug!(?reason, path = ?event.path, "dropping event");
            return DispatchOutcome::Skipped(reason);
        }

        let pipelines = self.registry.pipelines(event.category);
        let mut ctx = RunContext::new(&self.config, &self.keys, self.store.as_ref(), event);
        let mut outcome = DispatchOutcome::Completed { pipelines: pipelines.len() };
        for pipeline in pipelines {
            if let Err(error) = pipeline.run(&mut ctx) {
                tracing::error!(error = ?error, pipeline = pipeline.name(), category = %event.category, path = ?event.path, "pipeline aborted");
                outcome = DispatchOutcome::Aborted { pipeline: pipeline.name(), error };
                break;
            }
        }
        if let Some(snapshot) = ctx.take_snapshot() {
            self.snapshot.store(Some(snapshot));
        }

        let label = if outcome.is_completed() { "completed" } else { "aborted" };
        metrics::increment_counter!(METRIC_PIPELINE_RUNS, "category" => event.category.as_str(), "outcome" => label);
        outcome
    }

    /// Decide if the given event must be dropped, refreshing the markers when needed.
    fn gate(&mut self, event: &ChangeEvent) -> Option<SkipReason> {
        if event.phase == ChangePhase::Finalize {
            return Some(SkipReason::Finalize);
        }
        if event.category == ChangeCategory::Controller || self.markers.is_none() {
            match ControllerMarkers::read(self.store.as_ref(), &self.keys, self.config.store_retry_attempts) {
                Ok(markers) => {
                    tracing::debug!(leader = ?markers.leader, paused = markers.paused, "controller markers refreshed");
                    self.markers = Some(markers);
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error reading controller markers");
                    self.markers = None;
                    return Some(SkipReason::MarkersUnavailable);
                }
            }
        }
        let markers = match self.markers.as_ref() {
            Some(markers) => markers,
            None => return Some(SkipReason::MarkersUnavailable),
        };
        if !markers.is_leader(&self.config.controller_id) {
            return Some(SkipReason::NotLeader);
        }
        if markers.paused {
            return Some(SkipReason::Paused);
        }
        None
    }
}

fn skip_reason_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Finalize => "finalize",
        SkipReason::NotLeader => "not-leader",
        SkipReason::Paused => "paused",
        SkipReason::MarkersUnavailable => "markers-unavailable",
    }
}
