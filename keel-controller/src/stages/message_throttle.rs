use std::collections::HashMap;

use crate::error::PipelineError;
use crate::pipeline::{RunContext, Slot, Stage};
use keel_core::model::{CompiledConstraint, ConstraintValue};

const METRIC_MESSAGES_THROTTLED: &str = "keel_messages_throttled";

/// Admits the selected messages which fit within the cluster's message constraints.
///
/// Every constraint item bounds the number of outstanding messages per scope. Outstanding
/// messages of live sessions count against the budgets; withheld messages are simply dropped
/// and regenerated by a later run.
pub struct MessageThrottleStage;

impl Stage for MessageThrottleStage {
    fn name(&self) -> &'static str {
        "message-throttle"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot, Slot::SelectedMessages]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::ThrottledMessages]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let selected = ctx.selected_messages()?;

        let constraints: Vec<CompiledConstraint> = snapshot
            .cluster_config
            .constraints
            .iter()
            .filter_map(|item| match item.compile() {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring invalid constraint");
                    None
                }
            })
            .filter(|compiled| compiled.value() != ConstraintValue::Any)
            .collect();
        if constraints.is_empty() {
            let admitted = selected.clone();
            return ctx.set_throttled_messages(admitted);
        }

        // Outstanding counts by constraint index and scope.
        let mut outstanding: HashMap<(usize, Vec<String>), usize> = HashMap::new();
        let live_messages = snapshot
            .all_messages()
            .filter(|msg| snapshot.live_session(&msg.tgt) == Some(msg.tgt_session.as_str()));
        for msg in live_messages {
            for (idx, constraint) in constraints.iter().enumerate() {
                if constraint.matches(msg) {
                    *outstanding.entry((idx, constraint.scope(msg))).or_default() += 1;
                }
            }
        }

        let mut admitted = Vec::with_capacity(selected.len());
        for msg in selected.iter() {
            let matching: Vec<(usize, Vec<String>, usize)> = constraints
                .iter()
                .enumerate()
                .filter(|(_, constraint)| constraint.matches(msg))
                .filter_map(|(idx, constraint)| match constraint.value() {
                    ConstraintValue::Limit(limit) => Some((idx, constraint.scope(msg), limit)),
                    ConstraintValue::Any => None,
                })
                .collect();
            let exhausted = matching
                .iter()
                .find(|(idx, scope, limit)| outstanding.get(&(*idx, scope.clone())).copied().unwrap_or(0) >= *limit);
            if let Some((idx, scope, limit)) = exhausted {
                metrics::increment_counter!(METRIC_MESSAGES_THROTTLED);
                tracing::debug!(
                    msg = %msg.id, constraint = constraints[*idx].id(), scope = ?scope, limit,
                    "withholding message, constraint budget exhausted"
                );
                continue;
            }
            for (idx, scope, _) in matching {
                *outstanding.entry((idx, scope)).or_default() += 1;
            }
            admitted.push(msg.clone());
        }

        ctx.set_throttled_messages(admitted)
    }
}

/// Describe the metrics recorded by this stage.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_MESSAGES_THROTTLED, metrics::Unit::Count, "messages withheld by cluster constraints");
}
