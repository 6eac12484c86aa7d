use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{AgentError, Result};
use crate::metrics::{Metric, MetricGroup};

/// Selects a conflict-free request set for the next experiment.
///
/// Hardware-counter metrics are bucketed by counter set and the largest
/// bucket wins whole (ties go to the lowest set id). Time and MPI metrics
/// need no counters and always ride along. Energy metrics occupy the
/// measurement substrate's plugin slots and ride along only when no
/// counter set was scheduled. Everything not selected stays queued for a
/// later experiment.
pub fn form_request_set(pending: &mut Vec<Metric>) -> Result<Vec<Metric>> {
    let mut buckets: BTreeMap<u32, Vec<Metric>> = BTreeMap::new();
    let mut ride_along = Vec::new();
    let mut energy = Vec::new();

    for metric in pending.drain(..) {
        match metric.group() {
            MetricGroup::Papi | MetricGroup::PapiNehalem => {
                let set = metric
                    .counter_set()
                    .ok_or(AgentError::UnsupportedMetric(metric.wire_name()))?;
                buckets.entry(set).or_default().push(metric);
            }
            MetricGroup::Time | MetricGroup::Mpi => ride_along.push(metric),
            MetricGroup::Hdeem | MetricGroup::Energy => energy.push(metric),
            MetricGroup::Omp | MetricGroup::Other => {
                return Err(AgentError::UnsupportedMetric(metric.wire_name()));
            }
        }
    }

    let winner = buckets
        .iter()
        .fold(None, |best: Option<u32>, (&set, metrics)| match best {
            Some(best_set) if buckets[&best_set].len() >= metrics.len() => Some(best_set),
            _ => Some(set),
        });

    let mut selected = Vec::new();
    for (set, mut metrics) in buckets {
        if Some(set) == winner {
            selected.append(&mut metrics);
        } else {
            pending.append(&mut metrics);
        }
    }
    selected.append(&mut ride_along);
    if winner.is_none() {
        selected.append(&mut energy);
    } else {
        pending.append(&mut energy);
    }

    selected.sort();
    selected.dedup();
    debug!(
        selected = selected.len(),
        requeued = pending.len(),
        "formed measurement request set"
    );
    Ok(selected)
}
