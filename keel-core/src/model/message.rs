use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The type of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Instructs a node to transition partitions between two states.
    StateTransition,
    /// A message carrying no instruction, used to probe a node.
    NoOp,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateTransition => "STATE_TRANSITION",
            Self::NoOp => "NO_OP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed instruction from the controller to a node.
///
/// Messages are created by the controller and deleted by the target node once executed. A
/// message is only valid for the session it targets; a node which reconnected ignores it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// The unique id of this message.
    pub id: Uuid,
    /// The type of this message.
    pub msg_type: MessageType,
    /// The identity of the sending controller.
    pub src: String,
    /// The target instance.
    pub tgt: String,
    /// The session of the target instance this message is valid for.
    pub tgt_session: String,
    /// The resource of the affected partitions.
    pub resource: String,
    /// The affected partitions. Holds more than one partition only for grouped messages.
    pub partitions: Vec<String>,
    /// The state the partitions are expected to be in.
    pub from_state: String,
    /// The state the partitions are to be transitioned to.
    pub to_state: String,
    /// The state model under which the transition is to be applied.
    pub state_model: String,
    /// The partition grouping factor of the resource.
    #[serde(default)]
    pub bucket_size: u32,
    /// Whether this message groups the same transition for several partitions.
    #[serde(default)]
    pub group_message: bool,
    /// Unix timestamp in milliseconds of when this message was created.
    pub create_timestamp_ms: i64,
    /// The number of times the node should retry a failed execution.
    #[serde(default)]
    pub retry_count: u32,
    /// The time after which the node cancels the execution of this message.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
}

impl Message {
    /// Create a new state transition message for a single partition.
    #[allow(clippy::too_many_arguments)]
    pub fn state_transition(
        src: impl Into<String>, tgt: impl Into<String>, tgt_session: impl Into<String>, resource: impl Into<String>, partition: impl Into<String>,
        from_state: impl Into<String>, to_state: impl Into<String>, state_model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: MessageType::StateTransition,
            src: src.into(),
            tgt: tgt.into(),
            tgt_session: tgt_session.into(),
            resource: resource.into(),
            partitions: vec![partition.into()],
            from_state: from_state.into(),
            to_state: to_state.into(),
            state_model: state_model.into(),
            bucket_size: 0,
            group_message: false,
            create_timestamp_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            retry_count: 0,
            execution_timeout_ms: None,
        }
    }

    /// The id of this message as a string, which is also its key below the target's messages.
    pub fn id_str(&self) -> String {
        self.id.to_hyphenated().to_string()
    }

    /// The first (or only) partition of this message.
    pub fn partition(&self) -> Option<&str> {
        self.partitions.first().map(String::as_str)
    }

    /// The transition of this message formatted as `FROM-TO`.
    pub fn transition_name(&self) -> String {
        format!("{}-{}", self.from_state, self.to_state)
    }

    /// Check if this is a state transition message.
    pub fn is_state_transition(&self) -> bool {
        self.msg_type == MessageType::StateTransition
    }
}
