use std::cmp::Ordering;

/// A partitioned logical unit managed by the controller during a single pipeline run.
///
/// Resources are derived from ideal states, and from current state for resources whose ideal
/// state has been deleted while replicas are still being drained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    /// The name of the resource.
    pub name: String,
    /// The state model of the resource, if known.
    pub state_model: Option<String>,
    /// The partitions of the resource, in natural order.
    pub partitions: Vec<String>,
    /// The partition grouping factor used when persisting large state records.
    pub bucket_size: u32,
    /// Whether messages for this resource are grouped into multi-partition messages.
    pub group_message_mode: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_model: None,
            partitions: Vec::new(),
            bucket_size: 0,
            group_message_mode: false,
        }
    }

    /// Add the given partition if it is not already present, keeping natural order.
    pub fn add_partition(&mut self, partition: &str) {
        if self.partitions.iter().any(|p| p == partition) {
            return;
        }
        self.partitions.push(partition.to_string());
        sort_partitions(&mut self.partitions);
    }
}

/// The canonical name of the partition at the given index.
pub fn partition_name(resource: &str, index: u32) -> String {
    format!("{}_{}", resource, index)
}

/// Sort partition names by their numeric suffix, falling back to lexicographic order.
///
/// `TestDB0_2` sorts before `TestDB0_10`.
pub fn sort_partitions(partitions: &mut [String]) {
    partitions.sort_by(|a, b| compare_partitions(a, b));
}

fn compare_partitions(a: &str, b: &str) -> Ordering {
    match (split_index(a), split_index(b)) {
        (Some((pa, ia)), Some((pb, ib))) => pa.cmp(pb).then(ia.cmp(&ib)).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn split_index(partition: &str) -> Option<(&str, u64)> {
    let (prefix, index) = partition.rsplit_once('_')?;
    index.parse().ok().map(|index| (prefix, index))
}
