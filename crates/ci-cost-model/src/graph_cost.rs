//! Compute cost of an execution graph.
//!
//! Run wall time is bucketed by worker type twice: once over every run
//! (retries and failures included) and once over the final run of each
//! completed task. Each bucket is priced with the unit cost in effect at the
//! graph's earliest start time.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use ci_cost_core::ExecutionGraph;
use serde::Serialize;
use tracing::{debug, warn};

use crate::pricing::PriceTable;

/// Wall time per worker type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WallTimeBuckets {
    pub total: BTreeMap<String, Duration>,
    pub final_run: BTreeMap<String, Duration>,
}

impl WallTimeBuckets {
    pub fn from_graph(graph: &ExecutionGraph) -> Self {
        let mut buckets = Self::default();
        for task in graph.tasks() {
            let total = task.total_run_time();
            *buckets
                .total
                .entry(task.worker_type.clone())
                .or_insert_with(Duration::zero) += total;

            if let Some(final_time) = task.final_run_duration() {
                *buckets
                    .final_run
                    .entry(task.worker_type.clone())
                    .or_insert_with(Duration::zero) += final_time;
            }
        }
        buckets
    }
}

/// Priced totals for one worker type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerTypeCost {
    pub worker_type: String,
    pub unit_cost: f64,
    pub total_hours: f64,
    pub final_run_hours: f64,
    pub total_cost: f64,
    pub final_run_cost: f64,
}

/// Cost of one graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphCost {
    pub total_cost: f64,
    pub final_run_cost: f64,
    pub by_worker_type: Vec<WorkerTypeCost>,
    /// Worker types that had wall time but no price entry
    pub unpriced_worker_types: Vec<String>,
}

impl GraphCost {
    pub fn totals(&self) -> (f64, f64) {
        (self.total_cost, self.final_run_cost)
    }
}

fn hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

/// Prices execution graphs against a [`PriceTable`].
pub struct CostModel<'a> {
    prices: &'a PriceTable,
}

impl<'a> CostModel<'a> {
    pub fn new(prices: &'a PriceTable) -> Self {
        Self { prices }
    }

    /// Compute total and final-run cost of `graph`.
    ///
    /// Worker types missing from the price table contribute zero and are
    /// reported in [`GraphCost::unpriced_worker_types`].
    pub fn compute(&self, graph: &ExecutionGraph) -> GraphCost {
        let Some(start) = graph.earliest_start_time() else {
            debug!(graph_id = graph.graph_id(), "graph has no started runs");
            return GraphCost::default();
        };
        self.compute_at(graph, start.date_naive())
    }

    /// Compute costs using unit prices in effect on `date`.
    pub fn compute_at(&self, graph: &ExecutionGraph, date: NaiveDate) -> GraphCost {
        let buckets = WallTimeBuckets::from_graph(graph);
        let mut cost = GraphCost::default();

        for (worker_type, total) in &buckets.total {
            let final_time = buckets
                .final_run
                .get(worker_type)
                .copied()
                .unwrap_or_else(Duration::zero);

            let Some(unit_cost) = self.prices.unit_cost(worker_type, date) else {
                if !total.is_zero() {
                    warn!(
                        graph_id = graph.graph_id(),
                        worker_type = %worker_type,
                        "no unit cost for worker type, counting as zero"
                    );
                    cost.unpriced_worker_types.push(worker_type.clone());
                }
                continue;
            };

            let entry = WorkerTypeCost {
                worker_type: worker_type.clone(),
                unit_cost,
                total_hours: hours(*total),
                final_run_hours: hours(final_time),
                total_cost: hours(*total) * unit_cost,
                final_run_cost: hours(final_time) * unit_cost,
            };
            cost.total_cost += entry.total_cost;
            cost.final_run_cost += entry.final_run_cost;
            cost.by_worker_type.push(entry);
        }

        debug!(
            graph_id = graph.graph_id(),
            total_cost = cost.total_cost,
            final_run_cost = cost.final_run_cost,
            "graph priced"
        );
        cost
    }
}
