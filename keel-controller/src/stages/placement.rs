//! Controller computed placement for `AUTO_REBALANCE` resources.
//!
//! The placement is a preference list per partition. It is recomputed on every run from the
//! live membership and the current holders of each partition, and never persisted.

use std::collections::{BTreeMap, BTreeSet};

/// The inputs of a placement computation.
pub struct PlacementInput<'a> {
    /// The partitions of the resource, in natural order.
    pub partitions: &'a [String],
    /// The requested number of replicas per partition.
    pub replicas: usize,
    /// The live and enabled instances, sorted.
    pub instances: &'a [String],
    /// The live instances holding a replica of each partition, highest state priority first.
    pub holders: &'a BTreeMap<String, Vec<String>>,
    /// The live instances whose replica of each partition is in `ERROR`. They are never
    /// placed, so that a healthy instance takes their slot.
    pub errors: &'a BTreeMap<String, BTreeSet<String>>,
}

impl PlacementInput<'_> {
    fn in_error(&self, partition: &str, instance: &str) -> bool {
        self.errors.get(partition).map(|errors| errors.contains(instance)).unwrap_or(false)
    }
}

/// Compute the preference list of every partition.
///
/// `enabled` reports whether an instance may hold a replica of a partition.
pub fn compute_preference_lists<F>(input: &PlacementInput<'_>, enabled: F) -> BTreeMap<String, Vec<String>>
where
    F: Fn(&str, &str) -> bool,
{
    let holders_exist = input.holders.values().any(|holders| !holders.is_empty());
    let mut lists = if holders_exist {
        balanced(input, &enabled)
    } else {
        round_robin(input)
    };

    // Live holders which may not keep their replica stay listed last, so they are moved to the
    // initial state instead of being dropped outright.
    for (partition, list) in lists.iter_mut() {
        for holder in input.holders.get(partition).into_iter().flatten() {
            if !list.contains(holder) && !enabled(holder, partition) {
                list.push(holder.clone());
            }
        }
    }
    lists
}

/// Partition `i` is placed on instances `(i + r) mod n` for `r < replicas`, skipping instances
/// whose replica of the partition is in `ERROR`.
fn round_robin(input: &PlacementInput<'_>) -> BTreeMap<String, Vec<String>> {
    let n = input.instances.len();
    input
        .partitions
        .iter()
        .enumerate()
        .map(|(idx, partition)| {
            let list = (0..n)
                .map(|r| &input.instances[(idx + r) % n])
                .filter(|instance| !input.in_error(partition, instance))
                .take(input.replicas)
                .cloned()
                .collect();
            (partition.clone(), list)
        })
        .collect()
}

/// Keep current holders up to a per-instance cap, then fill from the least loaded instances.
fn balanced<F>(input: &PlacementInput<'_>, enabled: &F) -> BTreeMap<String, Vec<String>>
where
    F: Fn(&str, &str) -> bool,
{
    let n = input.instances.len();
    let replicas = input.replicas.min(n);
    let mut lists: BTreeMap<String, Vec<String>> = input.partitions.iter().map(|p| (p.clone(), Vec::with_capacity(replicas))).collect();
    if n == 0 || replicas == 0 {
        return lists;
    }
    let cap = (input.partitions.len() * replicas + n - 1) / n;
    let candidates: BTreeSet<&str> = input.instances.iter().map(String::as_str).collect();
    let mut load: BTreeMap<&str, usize> = input.instances.iter().map(|i| (i.as_str(), 0)).collect();

    for partition in input.partitions.iter() {
        let list = match lists.get_mut(partition) {
            Some(list) => list,
            None => continue,
        };
        for holder in input.holders.get(partition).into_iter().flatten() {
            if list.len() >= replicas {
                break;
            }
            if !candidates.contains(holder.as_str()) || !enabled(holder, partition) || list.contains(holder) {
                continue;
            }
            let count = load.entry(holder.as_str()).or_default();
            if *count < cap {
                *count += 1;
                list.push(holder.clone());
            }
        }
    }

    for partition in input.partitions.iter() {
        let list = match lists.get_mut(partition) {
            Some(list) => list,
            None => continue,
        };
        while list.len() < replicas {
            // Least loaded first; ties go to the lowest instance id.
            let next = input
                .instances
                .iter()
                .filter(|i| !list.contains(*i) && enabled(i.as_str(), partition) && !input.in_error(partition, i))
                .min_by_key(|i| (load.get(i.as_str()).copied().unwrap_or(0), *i));
            match next {
                Some(instance) => {
                    *load.entry(instance.as_str()).or_default() += 1;
                    list.push(instance.clone());
                }
                None => break,
            }
        }
    }
    lists
}
