//! Per-project scan: discover pushes, fetch graphs, price them, merge rows.
//!
//! Every remote call goes through one shared [`ConcurrencyLimiter`]. Graphs
//! are fanned out without holding a permit themselves, so a graph waiting for
//! its artifact listings never starves the listings of permits.
//!
//! A graph that fails to fetch is logged and left out of the merge. Because
//! merging is write-once per graph id, the next scan simply picks it up again.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use ci_cost_client::{
    ConcurrencyLimiter, HttpObjectStore, ObjectStore, PushlogClient, PushlogSource,
    TaskclusterClient,
};
use ci_cost_config::ScannerConfig;
use ci_cost_core::{CoreError, CostRow, ExecutionGraph, Origin, short_project};
use ci_cost_model::{
    ArtifactCost, ArtifactCostModel, CostDataset, CostModel, ExpiryTable, MergeStats, PriceTable,
};
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::discovery::{DiscoveryReport, PushCache, PushDiscovery};
use crate::error::Result;
use crate::fetcher::GraphFetcher;

/// What to scan for one project.
#[derive(Debug, Clone)]
pub struct ProjectScan {
    pub project: String,
    pub product: String,
    /// Push-history URL, already resolved for `project`
    pub pushlog_url: String,
    pub starting_push: Option<u64>,
    pub backfill_count: Option<u64>,
}

/// Where a cost row came from, attached to the row as-is.
#[derive(Debug, Clone)]
pub struct GraphContext {
    pub project: String,
    pub product: String,
    pub origin: Origin,
    pub push_id: Option<u64>,
    /// Used as the graph date when no run of the graph ever started
    pub fallback_date: Option<NaiveDate>,
}

/// A graph that could not be costed this time.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedGraph {
    pub graph_id: String,
    pub error: String,
    pub transient: bool,
}

/// Counters for one project scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub project: String,
    pub discovery: DiscoveryReport,
    /// Pushes whose lookup found no graph, or has not happened yet
    pub no_graph: usize,
    /// Pushes younger than the finished threshold
    pub not_finished: usize,
    /// Graphs already present in the dataset
    pub already_costed: usize,
    pub costed: usize,
    pub failed: Vec<FailedGraph>,
    pub merge: MergeStats,
}

/// Fetches, prices and merges execution graphs.
pub struct ScanPipeline {
    fetcher: GraphFetcher,
    pushlog: Arc<dyn PushlogSource>,
    store: Option<Arc<dyn ObjectStore>>,
    limiter: ConcurrencyLimiter,
    prices: Arc<PriceTable>,
    artifact_model: ArtifactCostModel,
    finished_after: Duration,
}

impl ScanPipeline {
    pub fn new(
        fetcher: GraphFetcher,
        pushlog: Arc<dyn PushlogSource>,
        prices: Arc<PriceTable>,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        Self {
            fetcher,
            pushlog,
            store: None,
            limiter,
            prices,
            artifact_model: ArtifactCostModel::default(),
            finished_after: Duration::hours(24),
        }
    }

    /// Build the pipeline with HTTP clients described by `config`.
    pub fn from_config(config: &ScannerConfig, prices: Arc<PriceTable>) -> Result<Self> {
        let finished_after = Duration::try_hours(config.finished_after_hours).ok_or_else(|| {
            CoreError::ConfigValidation {
                message: format!(
                    "finished_after_hours {} is out of range",
                    config.finished_after_hours
                ),
            }
        })?;
        let timeout = StdDuration::from_secs(config.request_timeout_secs);
        let service =
            TaskclusterClient::new(&config.taskcluster_root_url, timeout, config.page_size)?;
        let fetcher = GraphFetcher::from_config(Arc::new(service), config);
        let pushlog = PushlogClient::new(timeout)?;

        let mut pipeline = Self::new(
            fetcher,
            Arc::new(pushlog),
            prices,
            ConcurrencyLimiter::new(config.concurrency),
        )
        .with_finished_after(finished_after);

        if let Some(store) = &config.artifact_store {
            let store =
                HttpObjectStore::new(&store.base_url, &store.bucket, timeout, config.page_size)?;
            pipeline = pipeline.with_object_store(Arc::new(store));
        }
        Ok(pipeline)
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_finished_after(mut self, threshold: Duration) -> Self {
        self.finished_after = threshold;
        self
    }

    pub fn fetcher(&self) -> &GraphFetcher {
        &self.fetcher
    }

    fn discovery(&self) -> PushDiscovery {
        PushDiscovery::new(self.pushlog.clone(), self.fetcher.clone(), self.limiter.clone())
    }

    /// Scan one project and merge new cost rows into `dataset`.
    #[instrument(skip_all, fields(project = %scan.project))]
    pub async fn scan_project(
        &self,
        scan: &ProjectScan,
        cache: &mut PushCache,
        dataset: &CostDataset,
        now: DateTime<Utc>,
    ) -> Result<ScanReport> {
        let discovery = self
            .discovery()
            .scan(
                &scan.pushlog_url,
                &scan.project,
                &scan.product,
                scan.starting_push,
                scan.backfill_count,
                cache,
            )
            .await?;

        let examined = if self.store.is_some() {
            dataset.graph_ids_with_artifacts()?
        } else {
            dataset.graph_ids()?
        };
        let mut report = ScanReport {
            project: scan.project.clone(),
            discovery,
            no_graph: 0,
            not_finished: 0,
            already_costed: 0,
            costed: 0,
            failed: Vec::new(),
            merge: MergeStats::default(),
        };

        let mut candidates = Vec::new();
        for (push_id, push) in cache.pushes(&scan.project) {
            let Some(graph_id) = push.graph_id() else {
                report.no_graph += 1;
                continue;
            };
            if !push.probably_finished(now, self.finished_after) {
                report.not_finished += 1;
                continue;
            }
            if examined.contains(graph_id) {
                report.already_costed += 1;
                continue;
            }
            let context = GraphContext {
                project: short_project(&scan.project).to_string(),
                product: scan.product.clone(),
                origin: Origin::Push,
                push_id: Some(push_id),
                fallback_date: push.pushed_at().map(|at| at.date_naive()),
            };
            candidates.push((graph_id.to_string(), context));
        }
        info!(
            candidates = candidates.len(),
            no_graph = report.no_graph,
            not_finished = report.not_finished,
            already_costed = report.already_costed,
            "graphs selected for costing"
        );

        let results = join_all(
            candidates
                .iter()
                .map(|(graph_id, context)| self.cost_graph(graph_id, context)),
        )
        .await;

        let mut rows = Vec::with_capacity(results.len());
        for ((graph_id, _), result) in candidates.iter().zip(results) {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(%graph_id, error = %e, "graph not costed, will retry next scan");
                    report.failed.push(FailedGraph {
                        graph_id: graph_id.clone(),
                        error: e.to_string(),
                        transient: e.is_transient(),
                    });
                }
            }
        }

        report.costed = rows.len();
        report.merge = dataset.merge_rows(&rows)?;
        info!(
            costed = report.costed,
            failed = report.failed.len(),
            inserted = report.merge.inserted,
            "project scan finished"
        );
        Ok(report)
    }

    /// Fetch and price one graph.
    #[instrument(skip(self, context), fields(origin = %context.origin))]
    pub async fn cost_graph(&self, graph_id: &str, context: &GraphContext) -> Result<CostRow> {
        let graph = self.limiter.run(self.fetcher.fetch_graph(graph_id)).await?;
        self.price_graph(&graph, context).await
    }

    /// Price an already fetched graph, listing its artifacts when a store is configured.
    pub async fn price_graph(
        &self,
        graph: &ExecutionGraph,
        context: &GraphContext,
    ) -> Result<CostRow> {
        let graph_date = graph
            .earliest_start_time()
            .map(|at| at.date_naive())
            .or(context.fallback_date)
            .ok_or_else(|| {
                let message = "no run has started and no fallback date";
                CoreError::invalid_record(graph.graph_id(), message)
            })?;

        let cost = CostModel::new(&self.prices).compute_at(graph, graph_date);
        let artifacts = self.collect_artifacts(graph).await;
        ci_cost_core::log_cost_event!(
            graph_id = graph.graph_id(),
            %graph_date,
            total_cost = cost.total_cost,
            final_run_cost = cost.final_run_cost,
            artifact_cost = ?artifacts.map(|a| a.total_cost)
        );

        Ok(CostRow {
            project: context.project.clone(),
            product: context.product.clone(),
            graph_id: graph.graph_id().to_string(),
            push_id: context.push_id,
            graph_date,
            origin: context.origin,
            total_cost: cost.total_cost,
            final_run_cost: cost.final_run_cost,
            task_count: graph.task_count() as u64,
            compute_time: graph.total_compute_time().num_milliseconds() as f64 / 1000.0,
            artifact_size: artifacts.map(|a| a.total_size),
            artifact_cost: artifacts.map(|a| a.total_cost),
        })
    }

    /// Storage cost of every task's artifacts.
    ///
    /// A task whose listing fails counts as having no artifacts.
    async fn collect_artifacts(&self, graph: &ExecutionGraph) -> Option<ArtifactCost> {
        let store = self.store.as_ref()?;
        let listings = self
            .limiter
            .run_all(graph.tasks().iter().map(|task| {
                let prefix = format!("{}/", task.task_id);
                async move { (task, store.list_all(&prefix).await) }
            }))
            .await;

        let mut artifacts = Vec::new();
        for (task, listing) in listings {
            match listing {
                Ok(objects) => {
                    let expiry = ExpiryTable::for_task(task);
                    artifacts.extend(
                        objects
                            .into_iter()
                            .map(|o| expiry.annotate(o.key, o.size, o.last_modified)),
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        error = %e,
                        "artifact listing failed, counting no artifacts"
                    );
                }
            }
        }
        debug!(graph_id = graph.graph_id(), artifacts = artifacts.len(), "artifacts listed");
        Some(self.artifact_model.compute(&artifacts))
    }
}
