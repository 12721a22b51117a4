use std::sync::Arc;

use crate::error::PipelineError;
use crate::pipeline::{RunContext, Slot, Stage};
use crate::snapshot::ClusterSnapshot;

/// Refreshes the cluster snapshot of the run.
pub struct ReadClusterDataStage;

impl Stage for ReadClusterDataStage {
    fn name(&self) -> &'static str {
        "read-cluster-data"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot]
    }

    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ClusterSnapshot::refresh(ctx.store, ctx.keys, ctx.config.store_retry_attempts).map_err(PipelineError::Refresh)?;
        ctx.set_snapshot(Arc::new(snapshot))
    }
}
