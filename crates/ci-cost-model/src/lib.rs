//! # ci-cost-model
//!
//! Turns fetched execution graphs into cost rows and keeps them.
//!
//! - [`PriceTable`] reads worker unit costs from CSV and answers
//!   nearest-month lookups.
//! - [`CostModel`] prices run wall time per worker type.
//! - [`ArtifactCostModel`] and [`ExpiryTable`] price artifact storage.
//! - [`DatasetMerger`] and [`DailyRollup`] implement write-once merging and
//!   additive daily totals; [`CostDataset`] persists both in SQLite.

pub mod artifacts;
pub mod db;
pub mod error;
pub mod graph_cost;
pub mod merge;
pub mod pricing;

pub use artifacts::{ArtifactCost, ArtifactCostModel, ExpiryTable, StorageRates, TierSplit};
pub use db::{CostDataset, MergeStats};
pub use error::{CostError, Result};
pub use graph_cost::{CostModel, GraphCost, WallTimeBuckets, WorkerTypeCost};
pub use merge::{DailyRollup, DailyTotals, DatasetMerger, MergeOutcome, RollupKey};
pub use pricing::{EXPECTED_COLUMNS, PriceTable, WorkerUnitCostRecord};
