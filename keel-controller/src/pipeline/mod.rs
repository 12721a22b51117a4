//! Pipeline framework.
//!
//! A pipeline is an ordered list of stages. Stages communicate through the typed slots of a
//! `RunContext` which lives for the handling of a single event: every slot is written by exactly
//! one stage and read by any later stage. Each stage declares the slots it reads and writes so
//! that a pipeline list which could read an unwritten slot is rejected when it is registered,
//! rather than when it runs.

mod context;
mod registry;

use std::fmt;
use std::time::Instant;

pub use crate::error::PipelineError;
pub use context::{BestPossibleOutput, CurrentStateOutput, ResourceMap, RunContext, StateMap};
pub use registry::{
    cleanup_pipeline, data_refresh_pipeline, external_view_pipeline, rebalance_pipeline, PipelineRegistry, PIPELINE_CLEANUP, PIPELINE_DATA_REFRESH, PIPELINE_EXTERNAL_VIEW,
    PIPELINE_REBALANCE,
};

const METRIC_STAGE_DURATION: &str = "keel_pipeline_stage_duration_seconds";
const METRIC_STAGE_ERRORS: &str = "keel_pipeline_stage_errors";

/// A typed output of a pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// The cluster snapshot of the run.
    Snapshot,
    /// The resources managed during the run.
    Resources,
    /// The pending-aware current state.
    CurrentState,
    /// The best possible state.
    BestPossible,
    /// All messages needed to converge one hop toward the best possible state.
    GeneratedMessages,
    /// The generated messages which respect per-state upper bounds.
    SelectedMessages,
    /// The selected messages admitted by the cluster constraints.
    ThrottledMessages,
    /// The computed external views.
    ExternalViews,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "snapshot",
            Self::Resources => "resources",
            Self::CurrentState => "current-state",
            Self::BestPossible => "best-possible",
            Self::GeneratedMessages => "generated-messages",
            Self::SelectedMessages => "selected-messages",
            Self::ThrottledMessages => "throttled-messages",
            Self::ExternalViews => "external-views",
        };
        f.write_str(name)
    }
}

/// A single computation step of a pipeline.
pub trait Stage: Send + Sync {
    /// The name of this stage, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// The slots this stage reads.
    fn inputs(&self) -> &'static [Slot];

    /// The slots this stage writes.
    fn outputs(&self) -> &'static [Slot];

    /// Run this stage over the given context.
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError>;
}

/// An ordered list of stages.
pub struct Pipeline {
    name: &'static str,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Create a new pipeline from the given stages.
    pub fn new(name: &'static str, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { name, stages }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Run every stage in order, stopping at the first error.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(pipeline = self.name))]
    pub fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        for stage in self.stages.iter() {
            let start = Instant::now();
            let res = stage.process(ctx);
            metrics::histogram!(METRIC_STAGE_DURATION, start.elapsed().as_secs_f64(), "stage" => stage.name());
            if let Err(err) = res {
                metrics::increment_counter!(METRIC_STAGE_ERRORS, "stage" => stage.name());
                tracing::debug!(error = ?err, stage = stage.name(), "pipeline stage failed");
                return Err(err);
            }
            tracing::trace!(stage = stage.name(), "pipeline stage finished");
        }
        Ok(())
    }
}

/// Describe the metrics recorded by pipelines.
pub fn register_metrics() {
    metrics::register_histogram!(METRIC_STAGE_DURATION, metrics::Unit::Seconds, "the duration of each pipeline stage");
    metrics::register_counter!(METRIC_STAGE_ERRORS, metrics::Unit::Count, "pipeline stage failures");
}
