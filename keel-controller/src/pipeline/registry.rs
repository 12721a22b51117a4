use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::event::ChangeCategory;
use crate::pipeline::{Pipeline, Slot};
use crate::stages::{
    BestPossibleStateCalcStage, CurrentStateCleanupStage, CurrentStateComputationStage, ExternalViewComputeStage, MessageGenerationStage, MessageSelectionStage,
    MessageThrottleStage, ReadClusterDataStage, ResourceComputationStage, TaskAssignmentStage,
};

pub const PIPELINE_DATA_REFRESH: &str = "data-refresh";
pub const PIPELINE_REBALANCE: &str = "rebalance";
pub const PIPELINE_EXTERNAL_VIEW: &str = "external-view";
pub const PIPELINE_CLEANUP: &str = "cleanup";

/// The ordered pipelines to run for each change category.
///
/// Categories without a registration run no pipelines.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<ChangeCategory, Vec<Arc<Pipeline>>>,
}

impl PipelineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the standard pipelines of a controller.
    pub fn standard() -> Result<Self, PipelineError> {
        let refresh = Arc::new(data_refresh_pipeline());
        let rebalance = Arc::new(rebalance_pipeline());
        let external_view = Arc::new(external_view_pipeline());
        let cleanup = Arc::new(cleanup_pipeline());

        let mut registry = Self::new();
        for category in [ChangeCategory::IdealState, ChangeCategory::Config, ChangeCategory::Message] {
            registry.register(category, vec![refresh.clone(), rebalance.clone()])?;
        }
        registry.register(
            ChangeCategory::LiveInstance,
            vec![refresh.clone(), rebalance.clone(), external_view.clone(), cleanup],
        )?;
        for category in [ChangeCategory::CurrentState, ChangeCategory::Controller, ChangeCategory::Periodic] {
            registry.register(category, vec![refresh.clone(), rebalance.clone(), external_view.clone()])?;
        }
        registry.register(ChangeCategory::ExternalView, vec![])?;
        Ok(registry)
    }

    /// Register the ordered pipelines of a category, replacing any previous registration.
    ///
    /// The pipelines of a category share one run context, so every slot read by a stage must
    /// be written by an earlier stage of the list, and no slot may be written twice.
    pub fn register(&mut self, category: ChangeCategory, pipelines: Vec<Arc<Pipeline>>) -> Result<&mut Self, PipelineError> {
        validate(&pipelines)?;
        self.pipelines.insert(category, pipelines);
        Ok(self)
    }

    /// The pipelines registered for the given category.
    pub fn pipelines(&self, category: ChangeCategory) -> &[Arc<Pipeline>] {
        self.pipelines.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn validate(pipelines: &[Arc<Pipeline>]) -> Result<(), PipelineError> {
    let mut produced: BTreeSet<Slot> = BTreeSet::new();
    for pipeline in pipelines {
        for stage in pipeline.stages() {
            if let Some(missing) = stage.inputs().iter().find(|slot| !produced.contains(slot)) {
                return Err(PipelineError::InvalidPipeline {
                    pipeline: pipeline.name().into(),
                    reason: format!("stage {} reads {} which no earlier stage writes", stage.name(), missing),
                });
            }
            for slot in stage.outputs() {
                if !produced.insert(*slot) {
                    return Err(PipelineError::InvalidPipeline {
                        pipeline: pipeline.name().into(),
                        reason: format!("stage {} writes {} which an earlier stage already writes", stage.name(), slot),
                    });
                }
            }
        }
    }
    Ok(())
}

/// The pipeline which refreshes the cluster snapshot.
pub fn data_refresh_pipeline() -> Pipeline {
    Pipeline::new(PIPELINE_DATA_REFRESH, vec![Box::new(ReadClusterDataStage)])
}

/// The pipeline which computes and sends the messages converging the cluster.
pub fn rebalance_pipeline() -> Pipeline {
    Pipeline::new(
        PIPELINE_REBALANCE,
        vec![
            Box::new(ResourceComputationStage),
            Box::new(CurrentStateComputationStage),
            Box::new(BestPossibleStateCalcStage),
            Box::new(MessageGenerationStage),
            Box::new(MessageSelectionStage),
            Box::new(MessageThrottleStage),
            Box::new(TaskAssignmentStage),
        ],
    )
}

/// The pipeline which publishes external views.
pub fn external_view_pipeline() -> Pipeline {
    Pipeline::new(PIPELINE_EXTERNAL_VIEW, vec![Box::new(ExternalViewComputeStage)])
}

/// The pipeline which prunes stale current state epochs.
pub fn cleanup_pipeline() -> Pipeline {
    Pipeline::new(PIPELINE_CLEANUP, vec![Box::new(CurrentStateCleanupStage)])
}
