//! Canonical store paths of all cluster records.
//!
//! The layout is store agnostic. Every record of a cluster lives below `/<cluster>`:
//!
//! ```text
//! /<cluster>/IDEALSTATES/<resource>
//! /<cluster>/LIVEINSTANCES/<instance>
//! /<cluster>/CONFIGS/PARTICIPANT/<instance>
//! /<cluster>/CONFIGS/CLUSTER/<cluster>
//! /<cluster>/CURRENTSTATES/<instance>/<session>/<resource>
//! /<cluster>/MESSAGES/<instance>/<msgId>
//! /<cluster>/EXTERNALVIEW/<resource>
//! /<cluster>/STATEMODELDEFS/<name>
//! /<cluster>/CONTROLLER/{LEADER,PAUSE}
//! ```

pub const SEGMENT_IDEAL_STATES: &str = "IDEALSTATES";
pub const SEGMENT_LIVE_INSTANCES: &str = "LIVEINSTANCES";
pub const SEGMENT_CONFIGS: &str = "CONFIGS";
pub const SEGMENT_CURRENT_STATES: &str = "CURRENTSTATES";
pub const SEGMENT_MESSAGES: &str = "MESSAGES";
pub const SEGMENT_EXTERNAL_VIEW: &str = "EXTERNALVIEW";
pub const SEGMENT_STATE_MODEL_DEFS: &str = "STATEMODELDEFS";
pub const SEGMENT_CONTROLLER: &str = "CONTROLLER";

const CONFIG_SCOPE_PARTICIPANT: &str = "PARTICIPANT";
const CONFIG_SCOPE_CLUSTER: &str = "CLUSTER";
const CONTROLLER_LEADER: &str = "LEADER";
const CONTROLLER_PAUSE: &str = "PAUSE";

/// Path builder for the records of a single cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keys {
    cluster: String,
    root: String,
}

impl Keys {
    /// Create a new instance for the given cluster.
    pub fn new(cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        let root = format!("/{}", cluster);
        Self { cluster, root }
    }

    /// The name of the cluster.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The root path of the cluster.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn ideal_states(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_IDEAL_STATES)
    }

    pub fn ideal_state(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_IDEAL_STATES, resource)
    }

    pub fn live_instances(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_LIVE_INSTANCES)
    }

    pub fn live_instance(&self, instance: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_LIVE_INSTANCES, instance)
    }

    pub fn participant_configs(&self) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_CONFIGS, CONFIG_SCOPE_PARTICIPANT)
    }

    pub fn participant_config(&self, instance: &str) -> String {
        format!("{}/{}/{}/{}", self.root, SEGMENT_CONFIGS, CONFIG_SCOPE_PARTICIPANT, instance)
    }

    /// The cluster scoped config record, which carries the message constraints.
    pub fn cluster_config(&self) -> String {
        format!("{}/{}/{}/{}", self.root, SEGMENT_CONFIGS, CONFIG_SCOPE_CLUSTER, self.cluster)
    }

    /// The parent of the current state records of all instances.
    pub fn current_states_root(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_CURRENT_STATES)
    }

    pub fn current_states(&self, instance: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_CURRENT_STATES, instance)
    }

    pub fn current_state_session(&self, instance: &str, session: &str) -> String {
        format!("{}/{}/{}/{}", self.root, SEGMENT_CURRENT_STATES, instance, session)
    }

    pub fn current_state(&self, instance: &str, session: &str, resource: &str) -> String {
        format!("{}/{}/{}/{}/{}", self.root, SEGMENT_CURRENT_STATES, instance, session, resource)
    }

    /// The parent of the message queues of all instances.
    pub fn messages_root(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_MESSAGES)
    }

    pub fn messages(&self, instance: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_MESSAGES, instance)
    }

    pub fn message(&self, instance: &str, id: &str) -> String {
        format!("{}/{}/{}/{}", self.root, SEGMENT_MESSAGES, instance, id)
    }

    pub fn external_views(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_EXTERNAL_VIEW)
    }

    pub fn external_view(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_EXTERNAL_VIEW, resource)
    }

    pub fn state_model_defs(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_STATE_MODEL_DEFS)
    }

    pub fn state_model_def(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_STATE_MODEL_DEFS, name)
    }

    pub fn controller(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_CONTROLLER)
    }

    pub fn leader(&self) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_CONTROLLER, CONTROLLER_LEADER)
    }

    pub fn pause(&self) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_CONTROLLER, CONTROLLER_PAUSE)
    }

    /// Split the given path into its segments below the cluster root.
    ///
    /// Returns `None` if the path does not belong to this cluster.
    pub fn relative_segments<'a>(&self, path: &'a str) -> Option<Vec<&'a str>> {
        let rest = path.strip_prefix(self.root.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(rest.split('/').filter(|seg| !seg.is_empty()).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_follow_cluster_layout() {
        let keys = Keys::new("test-cluster");
        assert_eq!(keys.ideal_state("TestDB0"), "/test-cluster/IDEALSTATES/TestDB0");
        assert_eq!(keys.current_state("node-0", "s1", "TestDB0"), "/test-cluster/CURRENTSTATES/node-0/s1/TestDB0");
        assert_eq!(keys.cluster_config(), "/test-cluster/CONFIGS/CLUSTER/test-cluster");
        assert_eq!(keys.pause(), "/test-cluster/CONTROLLER/PAUSE");
    }

    #[test]
    fn relative_segments_rejects_foreign_paths() {
        let keys = Keys::new("c1");
        assert_eq!(keys.relative_segments("/c1/MESSAGES/node-0"), Some(vec!["MESSAGES", "node-0"]));
        assert_eq!(keys.relative_segments("/c1"), Some(vec![]));
        assert_eq!(keys.relative_segments("/c10/MESSAGES"), None);
        assert_eq!(keys.relative_segments("/c2/MESSAGES"), None);
    }
}
