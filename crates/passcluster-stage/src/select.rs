//! One representative pass per cluster.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use passcluster_core::{ClusterAssignment, Pass};

/// Picks the pass with the greatest `custom_ontester` in every populated
/// cluster. Among equal maxima the one latest in `passes` order wins.
///
/// The returned assignments are ordered by cluster and carry `id_task`, the
/// task being processed, rather than the task that produced each pass.
pub fn select_representatives(
    id_task: i64,
    passes: &[Pass],
    labels: &[usize],
) -> Vec<ClusterAssignment> {
    debug_assert_eq!(passes.len(), labels.len());

    let mut best: BTreeMap<usize, &Pass> = BTreeMap::new();
    for (pass, &label) in passes.iter().zip(labels) {
        match best.entry(label) {
            Entry::Vacant(slot) => {
                slot.insert(pass);
            }
            Entry::Occupied(mut slot) => {
                if pass.metrics.custom_ontester >= slot.get().metrics.custom_ontester {
                    slot.insert(pass);
                }
            }
        }
    }

    best.into_iter()
        .map(|(cluster, pass)| ClusterAssignment {
            id_task,
            id_pass: pass.id_pass,
            cluster: cluster as i64,
        })
        .collect()
}
