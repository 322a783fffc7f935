//! Folds grouped store rows into a [`QueueStats`] snapshot.

use std::collections::BTreeMap;

use crate::model::{Breakdown, QueueStats, TaskBreakdown};
use crate::store::{LeaseMode, StatsRow};

/// Build stats from one aggregate pass. `mode` decides whether an expired
/// lease counts as available (expiring leases) or still locked.
pub fn fold(rows: &[StatsRow], mode: LeaseMode) -> QueueStats {
    let mut stats = QueueStats::default();
    let mut tasks: BTreeMap<Option<String>, Breakdown> = BTreeMap::new();

    for row in rows {
        stats.total += row.items;

        let priority = stats.priority.entry(row.priority).or_default();
        let task = tasks.entry(row.task.clone()).or_default();

        if row.complete {
            stats.complete += row.items;
            stats.redundant_completes += row.completions.saturating_sub(row.items);
            priority.complete += row.items;
            task.complete += row.items;
            continue;
        }

        priority.waiting += row.items;
        task.waiting += row.items;

        let free = !row.locked || (mode == LeaseMode::Expiring && row.expired);
        if free {
            stats.available += row.items;
        } else {
            stats.locked += row.items;
        }
    }

    stats.tasks = tasks
        .into_iter()
        .map(|(task, counts)| TaskBreakdown { task, counts })
        .collect();
    stats
}
