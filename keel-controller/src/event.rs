//! Change events driving the controller.

use std::fmt;

use keel_core::keys::{
    SEGMENT_CONFIGS, SEGMENT_CONTROLLER, SEGMENT_CURRENT_STATES, SEGMENT_EXTERNAL_VIEW, SEGMENT_IDEAL_STATES, SEGMENT_LIVE_INSTANCES, SEGMENT_MESSAGES,
    SEGMENT_STATE_MODEL_DEFS,
};
use keel_core::Keys;

/// The category of a change, which selects the pipelines to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeCategory {
    IdealState,
    LiveInstance,
    Config,
    CurrentState,
    Message,
    ExternalView,
    Controller,
    /// The periodic rebalance timer. Never produced by the store.
    Periodic,
}

impl ChangeCategory {
    /// All categories.
    pub const ALL: [ChangeCategory; 8] = [
        Self::IdealState,
        Self::LiveInstance,
        Self::Config,
        Self::CurrentState,
        Self::Message,
        Self::ExternalView,
        Self::Controller,
        Self::Periodic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdealState => "IDEAL_STATE",
            Self::LiveInstance => "LIVE_INSTANCE",
            Self::Config => "CONFIG",
            Self::CurrentState => "CURRENT_STATE",
            Self::Message => "MESSAGE",
            Self::ExternalView => "EXTERNAL_VIEW",
            Self::Controller => "CONTROLLER",
            Self::Periodic => "PERIODIC",
        }
    }

    /// The category of a change to the given path of the given cluster.
    ///
    /// State model definitions are cluster configuration. Paths outside of the cluster map to
    /// `None`.
    pub fn for_path(keys: &Keys, path: &str) -> Option<Self> {
        let segments = keys.relative_segments(path)?;
        let category = match *segments.first()? {
            SEGMENT_IDEAL_STATES => Self::IdealState,
            SEGMENT_LIVE_INSTANCES => Self::LiveInstance,
            SEGMENT_CONFIGS | SEGMENT_STATE_MODEL_DEFS => Self::Config,
            SEGMENT_CURRENT_STATES => Self::CurrentState,
            SEGMENT_MESSAGES => Self::Message,
            SEGMENT_EXTERNAL_VIEW => Self::ExternalView,
            SEGMENT_CONTROLLER => Self::Controller,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phase of a change listener's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangePhase {
    /// The listener was just registered.
    Init,
    /// A watched path changed.
    Callback,
    /// The listener is being torn down.
    Finalize,
}

/// A single change notification handed to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub category: ChangeCategory,
    pub phase: ChangePhase,
    /// The path which changed, if any.
    pub path: Option<String>,
}

impl ChangeEvent {
    pub fn new(category: ChangeCategory, phase: ChangePhase, path: Option<String>) -> Self {
        Self { category, phase, path }
    }

    /// A callback event for the given category.
    pub fn callback(category: ChangeCategory) -> Self {
        Self::new(category, ChangePhase::Callback, None)
    }

    /// The event produced by the periodic rebalance timer.
    pub fn periodic() -> Self {
        Self::callback(ChangeCategory::Periodic)
    }
}
