//! Message admission constraints.
//!
//! A constraint item bounds the number of concurrently outstanding messages within a scope.
//! Every attribute of an item is a regular expression which must fully match the corresponding
//! value of a message for the item to apply. The scope of an item is the tuple of the message's
//! values for the item's attributes, so `INSTANCE=.*` yields one budget per instance while
//! `TRANSITION=OFFLINE-SLAVE` yields a single cluster-wide budget.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::Message;

/// The value of a constraint which places no bound at all.
pub const CONSTRAINT_VALUE_ANY: &str = "ANY";

/// A message attribute which a constraint may be scoped by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintAttribute {
    MessageType,
    Transition,
    Resource,
    Instance,
}

impl ConstraintAttribute {
    /// The value of this attribute for the given message.
    pub fn value_of(&self, msg: &Message) -> String {
        match self {
            Self::MessageType => msg.msg_type.as_str().to_string(),
            Self::Transition => msg.transition_name(),
            Self::Resource => msg.resource.clone(),
            Self::Instance => msg.tgt.clone(),
        }
    }
}

impl fmt::Display for ConstraintAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MessageType => "MESSAGE_TYPE",
            Self::Transition => "TRANSITION",
            Self::Resource => "RESOURCE",
            Self::Instance => "INSTANCE",
        };
        f.write_str(name)
    }
}

/// A persisted constraint item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintItem {
    /// The id of the item.
    pub id: String,
    /// Scope patterns by attribute.
    #[serde(default)]
    pub attributes: BTreeMap<ConstraintAttribute, String>,
    /// The bound, either a non-negative integer or `ANY`.
    #[serde(rename = "CONSTRAINT_VALUE")]
    pub value: String,
}

impl ConstraintItem {
    /// Create a new item from attribute patterns.
    pub fn new(id: impl Into<String>, attributes: impl IntoIterator<Item = (ConstraintAttribute, String)>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: attributes.into_iter().collect(),
            value: value.into(),
        }
    }

    /// Compile the patterns and parse the bound of this item.
    pub fn compile(&self) -> Result<CompiledConstraint, CoreError> {
        let invalid = |reason: String| CoreError::InvalidConstraint {
            id: self.id.clone(),
            reason,
        };
        let value = match self.value.trim() {
            CONSTRAINT_VALUE_ANY => ConstraintValue::Any,
            raw => raw
                .parse::<usize>()
                .map(ConstraintValue::Limit)
                .map_err(|_| invalid(format!("unparseable constraint value {:?}", self.value)))?,
        };
        let mut patterns = Vec::with_capacity(self.attributes.len());
        for (attr, pattern) in self.attributes.iter() {
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|err| invalid(format!("invalid pattern for {}: {}", attr, err)))?;
            patterns.push((*attr, regex));
        }
        Ok(CompiledConstraint {
            id: self.id.clone(),
            patterns,
            value,
        })
    }
}

/// The bound of a constraint item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintValue {
    /// No bound.
    Any,
    /// At most this many outstanding messages per scope.
    Limit(usize),
}

/// A constraint item ready to be matched against messages.
#[derive(Clone, Debug)]
pub struct CompiledConstraint {
    id: String,
    patterns: Vec<(ConstraintAttribute, Regex)>,
    value: ConstraintValue,
}

impl CompiledConstraint {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> ConstraintValue {
        self.value
    }

    /// Check if this constraint applies to the given message.
    pub fn matches(&self, msg: &Message) -> bool {
        self.patterns.iter().all(|(attr, regex)| regex.is_match(&attr.value_of(msg)))
    }

    /// The concrete scope of the given message under this constraint.
    pub fn scope(&self, msg: &Message) -> Vec<String> {
        self.patterns.iter().map(|(attr, _)| attr.value_of(msg)).collect()
    }
}

/// Cluster scoped configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Message admission constraints.
    #[serde(default)]
    pub constraints: Vec<ConstraintItem>,
}
