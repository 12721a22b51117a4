use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::pipeline::{RunContext, Slot, Stage};
use crate::store::{encode, with_retry, WriteMode};
use keel_core::model::Message;

const METRIC_MESSAGES_SENT: &str = "keel_messages_sent";

/// Persists the admitted messages.
///
/// All messages of a run are written in one atomic batch: either every message is sent or none
/// is, in which case the run fails and the messages are regenerated by the next one.
pub struct TaskAssignmentStage;

impl Stage for TaskAssignmentStage {
    fn name(&self) -> &'static str {
        "task-assignment"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Resources, Slot::ThrottledMessages]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let resources = ctx.resources()?;
        let admitted = ctx.throttled_messages()?;

        let grouped_resources = resources.values().filter(|r| r.group_message_mode).map(|r| r.name.as_str());
        let messages = group_messages(admitted, &grouped_resources.collect::<Vec<_>>());
        if messages.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(messages.len());
        for msg in messages.iter() {
            let key = ctx.keys.message(&msg.tgt, &msg.id_str());
            let value = encode(&key, msg).map_err(|source| PipelineError::Persist { what: "messages".into(), source })?;
            entries.push((key, value));
        }
        let store = ctx.store;
        with_retry(ctx.config.store_retry_attempts, "write_batch", || store.write_batch(entries.clone(), WriteMode::CreateIfAbsent))
            .map_err(|source| PipelineError::Persist { what: "messages".into(), source })?;

        metrics::counter!(METRIC_MESSAGES_SENT, messages.len() as u64);
        tracing::debug!(count = messages.len(), "messages sent");
        Ok(())
    }
}

/// Merge the messages of grouped resources which share target, session, resource and
/// transition into a single message listing all of their partitions.
pub(super) fn group_messages(messages: &[Message], grouped_resources: &[&str]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut groups: BTreeMap<(String, String, String, String, String), usize> = BTreeMap::new();
    for msg in messages {
        if !grouped_resources.contains(&msg.resource.as_str()) {
            out.push(msg.clone());
            continue;
        }
        let key = (msg.tgt.clone(), msg.tgt_session.clone(), msg.resource.clone(), msg.from_state.clone(), msg.to_state.clone());
        match groups.get(&key) {
            Some(idx) => out[*idx].partitions.extend(msg.partitions.iter().cloned()),
            None => {
                let mut grouped = msg.clone();
                grouped.group_message = true;
                groups.insert(key, out.len());
                out.push(grouped);
            }
        }
    }
    out
}

/// Describe the metrics recorded by this stage.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_MESSAGES_SENT, metrics::Unit::Count, "state transition messages sent");
}
