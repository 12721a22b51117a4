use crate::error::PipelineError;
use crate::pipeline::{RunContext, Slot, Stage};
use crate::store::with_retry;

/// Prunes the records of sessions which are no longer live.
///
/// Current state recorded under any session other than the instance's live session describes
/// replicas which no longer exist, and messages targeting such a session will never be
/// executed.
pub struct CurrentStateCleanupStage;

impl Stage for CurrentStateCleanupStage {
    fn name(&self) -> &'static str {
        "current-state-cleanup"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let attempts = ctx.config.store_retry_attempts;
        let store = ctx.store;

        let mut stale = vec![];
        for (instance, sessions) in snapshot.current_states.iter() {
            let live_session = snapshot.live_session(instance);
            for session in sessions.keys().filter(|session| live_session != Some(session.as_str())) {
                stale.push(ctx.keys.current_state_session(instance, session));
            }
        }
        for (instance, messages) in snapshot.messages.iter() {
            let live_session = snapshot.live_session(instance);
            for (id, msg) in messages.iter() {
                if live_session != Some(msg.tgt_session.as_str()) {
                    stale.push(ctx.keys.message(instance, id));
                }
            }
        }

        for key in stale {
            with_retry(attempts, "delete", || store.delete(&key)).map_err(|source| PipelineError::Persist {
                what: format!("stale record {}", key),
                source,
            })?;
            tracing::debug!(key = %key, "pruned record of stale session");
        }
        Ok(())
    }
}
