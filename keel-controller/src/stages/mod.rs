//! The controller pipeline stages.

mod best_possible;
mod cleanup;
#[cfg(test)]
mod cleanup_test;
mod current_state;
mod external_view;
mod message_generation;
mod message_selection;
mod message_throttle;
mod placement;
mod read_cluster_data;
mod resource_computation;
mod task_assignment;
#[cfg(test)]
mod task_assignment_test;

pub use best_possible::BestPossibleStateCalcStage;
pub use cleanup::CurrentStateCleanupStage;
pub use current_state::CurrentStateComputationStage;
pub use external_view::ExternalViewComputeStage;
pub use message_generation::MessageGenerationStage;
pub use message_selection::MessageSelectionStage;
pub use message_throttle::MessageThrottleStage;
pub use read_cluster_data::ReadClusterDataStage;
pub use resource_computation::ResourceComputationStage;
pub use task_assignment::TaskAssignmentStage;

/// Describe the metrics recorded by the stages.
pub fn register_metrics() {
    external_view::register_metrics();
    message_throttle::register_metrics();
    task_assignment::register_metrics();
}
