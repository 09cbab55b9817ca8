//! # ci-cost-scan
//!
//! The scan pipeline: [`PushDiscovery`] finds pushes and their graph ids,
//! [`GraphFetcher`] materializes graphs, and [`ScanPipeline`] prices them and
//! merges the rows into a [`ci_cost_model::CostDataset`].

pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod pipeline;

#[cfg(test)]
mod testing;

pub use discovery::{DiscoveryReport, PushCache, PushDiscovery, push_window};
pub use error::{Result, ScanError};
pub use fetcher::GraphFetcher;
pub use pipeline::{FailedGraph, GraphContext, ProjectScan, ScanPipeline, ScanReport};
