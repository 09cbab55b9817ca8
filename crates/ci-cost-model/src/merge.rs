//! Merging cost rows into a dataset and folding daily rollups.
//!
//! Rows are write-once per graph id: an existing row always wins over a new
//! one for the same graph. The single exception is artifact data, which may
//! be filled into an existing row that has none. Rollups are additive, so the
//! delta of a merge is built only from rows that actually changed.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ci_cost_core::{CostRow, Origin};
use serde::Serialize;

/// Grouping key of the daily rollup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RollupKey {
    pub project: String,
    pub product: String,
    pub date: NaiveDate,
    pub origin: Origin,
}

impl RollupKey {
    pub fn for_row(row: &CostRow) -> Self {
        Self {
            project: row.project.clone(),
            product: row.product.clone(),
            date: row.graph_date,
            origin: row.origin,
        }
    }
}

/// Summed values for one rollup key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DailyTotals {
    pub graph_count: u64,
    pub total_cost: f64,
    pub final_run_cost: f64,
    pub task_count: u64,
    pub compute_time: f64,
    pub artifact_size: u64,
    pub artifact_cost: f64,
}

impl DailyTotals {
    pub fn from_row(row: &CostRow) -> Self {
        Self {
            graph_count: 1,
            total_cost: row.total_cost,
            final_run_cost: row.final_run_cost,
            task_count: row.task_count,
            compute_time: row.compute_time,
            artifact_size: row.artifact_size.unwrap_or(0),
            artifact_cost: row.artifact_cost.unwrap_or(0.0),
        }
    }

    /// Only the artifact columns of a row, for rows whose artifacts were filled in.
    pub fn artifacts_only(row: &CostRow) -> Self {
        Self {
            artifact_size: row.artifact_size.unwrap_or(0),
            artifact_cost: row.artifact_cost.unwrap_or(0.0),
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: &DailyTotals) {
        self.graph_count += other.graph_count;
        self.total_cost += other.total_cost;
        self.final_run_cost += other.final_run_cost;
        self.task_count += other.task_count;
        self.compute_time += other.compute_time;
        self.artifact_size += other.artifact_size;
        self.artifact_cost += other.artifact_cost;
    }
}

/// Daily totals keyed by project, product, date and origin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyRollup {
    days: BTreeMap<RollupKey, DailyTotals>,
}

impl DailyRollup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a CostRow>,
    {
        let mut rollup = Self::new();
        for row in rows {
            rollup.add(RollupKey::for_row(row), &DailyTotals::from_row(row));
        }
        rollup
    }

    pub fn add(&mut self, key: RollupKey, totals: &DailyTotals) {
        self.days.entry(key).or_default().add(totals);
    }

    /// Fold another rollup in additively.
    pub fn merge(&mut self, other: &DailyRollup) {
        for (key, totals) in &other.days {
            self.add(key.clone(), totals);
        }
    }

    pub fn get(&self, key: &RollupKey) -> Option<&DailyTotals> {
        self.days.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RollupKey, &DailyTotals)> {
        self.days.iter()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

impl FromIterator<(RollupKey, DailyTotals)> for DailyRollup {
    fn from_iter<T: IntoIterator<Item = (RollupKey, DailyTotals)>>(iter: T) -> Self {
        let mut rollup = Self::new();
        for (key, totals) in iter {
            rollup.add(key, &totals);
        }
        rollup
    }
}

/// Result of merging new rows into existing ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// The merged dataset, ordered by graph id
    pub rows: Vec<CostRow>,
    /// New rows for graphs not seen before
    pub inserted: Vec<CostRow>,
    /// Existing rows that gained artifact data, in their merged form
    pub filled: Vec<CostRow>,
    /// New rows dropped because their graph id was already present
    pub ignored: usize,
}

impl MergeOutcome {
    /// The change this merge makes to the daily rollup.
    pub fn rollup_delta(&self) -> DailyRollup {
        let mut delta = DailyRollup::from_rows(&self.inserted);
        for row in &self.filled {
            delta.add(RollupKey::for_row(row), &DailyTotals::artifacts_only(row));
        }
        delta
    }
}

/// Merges cost rows keyed by graph id.
pub struct DatasetMerger;

impl DatasetMerger {
    pub fn merge(existing: Vec<CostRow>, new: Vec<CostRow>) -> MergeOutcome {
        let mut by_id: HashMap<String, CostRow> = existing
            .into_iter()
            .map(|row| (row.graph_id.clone(), row))
            .collect();
        let mut outcome = MergeOutcome::default();

        for row in new {
            match by_id.get_mut(&row.graph_id) {
                Some(current) => {
                    if !current.has_artifact_data() && row.has_artifact_data() {
                        current.artifact_size = row.artifact_size;
                        current.artifact_cost = row.artifact_cost;
                        outcome.filled.push(current.clone());
                    } else {
                        outcome.ignored += 1;
                    }
                }
                None => {
                    outcome.inserted.push(row.clone());
                    by_id.insert(row.graph_id.clone(), row);
                }
            }
        }

        let mut rows: Vec<CostRow> = by_id.into_values().collect();
        rows.sort_by(|a, b| a.graph_id.cmp(&b.graph_id));
        outcome.rows = rows;
        outcome
    }

    /// Additive fold: each key's totals are summed.
    pub fn merge_rollups(existing: &DailyRollup, new: &DailyRollup) -> DailyRollup {
        let mut merged = existing.clone();
        merged.merge(new);
        merged
    }
}
