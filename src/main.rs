//! ci-cost - cost attribution for CI execution graphs
//!
//! ## Usage
//!
//! ```bash
//! # Scan the configured projects for new pushes and cost their graphs
//! ci-cost --config scanner.yaml scan
//!
//! # Backfill 500 pushes older than the oldest cached one
//! ci-cost scan --project mozilla-central --backfill-count 500
//!
//! # Cost a single graph, or the nightly graph of a revision
//! ci-cost graph --graph-id Xf2bQ9vTQ3yW1lYv0Z3c1Q
//! ci-cost graph --revision 5a1b2c3d --nightly
//!
//! # Print per-day totals, dropping rows older than a date first
//! ci-cost rollup --project mozilla-central --compact-before 2019-01-01
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use ci_cost_config::ScannerConfig;
use ci_cost_core::{CoreError, LogGuard, Origin, init_logging, short_project};
use ci_cost_model::{CostDataset, PriceTable};
use ci_cost_scan::{GraphContext, ProjectScan, PushCache, ScanError, ScanPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

/// Attribute compute and storage cost to CI execution graphs
#[derive(Parser, Debug)]
#[command(name = "ci-cost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scanner configuration file
    #[arg(short, long, global = true, default_value = "ci-cost.yaml")]
    config: PathBuf,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.ci-cost/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover new pushes and cost their execution graphs
    Scan(ScanArgs),
    /// Cost one execution graph and merge it into the dataset
    Graph(GraphArgs),
    /// Print per-day totals for a project
    Rollup(RollupArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Project to scan (repeatable; defaults to the configured list)
    #[arg(short, long = "project")]
    projects: Vec<String>,

    #[arg(long)]
    product: Option<String>,

    /// Scan forward from this push id when nothing is cached
    #[arg(long)]
    starting_push: Option<u64>,

    /// Fetch this many pushes older than the oldest cached one
    #[arg(long)]
    backfill_count: Option<u64>,
}

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["graph_id", "revision"])))]
struct GraphArgs {
    #[arg(long)]
    graph_id: Option<String>,

    /// Resolve the graph through the index from this revision
    #[arg(long)]
    revision: Option<String>,

    /// Project the graph belongs to (defaults to the first configured project)
    #[arg(short, long)]
    project: Option<String>,

    #[arg(long)]
    product: Option<String>,

    /// Look the revision up in the nightly index and record the row as nightly
    #[arg(long)]
    nightly: bool,
}

#[derive(Args, Debug)]
struct RollupArgs {
    /// Project to report (defaults to the first configured project)
    #[arg(short, long)]
    project: Option<String>,

    /// Delete rows dated before this day (YYYY-MM-DD) and rebuild the totals first
    #[arg(long)]
    compact_before: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            if let Some(hint) = guidance(&e) {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> ci_cost_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

/// Guidance from the first error in the chain that offers any.
fn guidance(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ScanError>() {
            e.guidance()
        } else if let Some(e) = cause.downcast_ref::<CoreError>() {
            e.guidance()
        } else {
            None
        }
    })
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ScannerConfig::load(&cli.config)?;
    match cli.command {
        Command::Scan(args) => scan(config, args).await,
        Command::Graph(args) => graph(config, args).await,
        Command::Rollup(args) => rollup(&config, args),
    }
}

/// Price tables are loaded before any remote call so a bad table fails fast.
fn load_prices(config: &ScannerConfig) -> anyhow::Result<Arc<PriceTable>> {
    let other = config.other_costs_csv_file.as_deref();
    let prices = PriceTable::load_all(&config.costs_csv_file, other)
        .map_err(ScanError::from)
        .context("loading worker unit costs")?;
    info!(worker_types = prices.worker_type_count(), "price table loaded");
    Ok(Arc::new(prices))
}

fn default_project(config: &ScannerConfig, project: Option<String>) -> anyhow::Result<String> {
    project
        .or_else(|| config.projects.first().cloned())
        .context("no project given and none configured")
}

/// A project's local state: its push cache and its cost dataset.
struct ProjectState {
    project: String,
    cache: PushCache,
    dataset: CostDataset,
}

fn open_project(config: &ScannerConfig, project: &str) -> anyhow::Result<ProjectState> {
    let cache = PushCache::load(config.pushlog_cache_file_for(project))
        .with_context(|| format!("loading push cache for {project}"))?;
    let dataset = CostDataset::open(config.dataset_path_for(project))
        .map_err(ScanError::from)
        .with_context(|| format!("opening dataset for {project}"))?;
    Ok(ProjectState {
        project: project.to_string(),
        cache,
        dataset,
    })
}

/// Every project's cache and dataset are opened before the first remote call.
fn open_projects(config: &ScannerConfig) -> anyhow::Result<Vec<ProjectState>> {
    config
        .projects
        .iter()
        .map(|project| open_project(config, project))
        .collect()
}

async fn scan(mut config: ScannerConfig, args: ScanArgs) -> anyhow::Result<ExitCode> {
    if !args.projects.is_empty() {
        config.projects = args.projects;
    }
    if let Some(product) = args.product {
        config.product = product;
    }
    config.starting_push = args.starting_push.or(config.starting_push);
    config.backfill_count = args.backfill_count.or(config.backfill_count);

    let prices = load_prices(&config)?;
    let states = open_projects(&config)?;
    let pipeline = ScanPipeline::from_config(&config, prices)?;

    let mut failed_projects = 0;
    for ProjectState {
        project,
        mut cache,
        dataset,
    } in states
    {
        let scan = ProjectScan {
            project: project.clone(),
            product: config.product.clone(),
            pushlog_url: config.pushlog_url_for(&project),
            starting_push: config.starting_push,
            backfill_count: config.backfill_count,
        };

        match pipeline.scan_project(&scan, &mut cache, &dataset, Utc::now()).await {
            Ok(report) => {
                println!(
                    "{}: {} pushes fetched, {} graphs costed, {} inserted, {} filled, {} failed",
                    project,
                    report.discovery.fetched,
                    report.costed,
                    report.merge.inserted,
                    report.merge.filled,
                    report.failed.len()
                );
                for failed in &report.failed {
                    println!("  {} not costed: {}", failed.graph_id, failed.error);
                }
            }
            Err(e) if e.is_fatal() => {
                return Err(anyhow::Error::new(e).context(format!("scanning {project}")));
            }
            Err(e) => {
                warn!(
                    %project,
                    error = %e,
                    "project scan failed, continuing with the next project"
                );
                eprintln!("{project}: scan failed: {e}");
                failed_projects += 1;
            }
        }
    }

    Ok(if failed_projects == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn graph(config: ScannerConfig, args: GraphArgs) -> anyhow::Result<ExitCode> {
    let project = default_project(&config, args.project)?;
    let product = args.product.unwrap_or_else(|| config.product.clone());

    let prices = load_prices(&config)?;
    let state = open_project(&config, &project)?;
    let pipeline = ScanPipeline::from_config(&config, prices)?;

    let graph_id = match (args.graph_id, args.revision) {
        (Some(graph_id), _) => graph_id,
        (None, Some(revision)) => pipeline
            .fetcher()
            .resolve_graph_id(&revision, &project, &product, args.nightly)
            .await
            .map_err(ScanError::from)
            .with_context(|| format!("resolving revision {revision}"))?,
        (None, None) => anyhow::bail!("either --graph-id or --revision is required"),
    };

    let push = state.cache.push_for_graph(&project, &graph_id);
    let context = GraphContext {
        project: short_project(&project).to_string(),
        product,
        origin: if args.nightly { Origin::Nightly } else { Origin::Adhoc },
        push_id: push.map(|(id, _)| id),
        fallback_date: push.and_then(|(_, p)| p.pushed_at()).map(|at| at.date_naive()),
    };

    let row = pipeline
        .cost_graph(&graph_id, &context)
        .await
        .with_context(|| format!("costing graph {graph_id}"))?;
    let stats = state
        .dataset
        .merge_rows(std::slice::from_ref(&row))
        .map_err(ScanError::from)?;
    if stats.inserted == 0 && stats.filled == 0 {
        info!(%graph_id, "graph already in the dataset, kept the existing row");
    }

    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(ExitCode::SUCCESS)
}

fn rollup(config: &ScannerConfig, args: RollupArgs) -> anyhow::Result<ExitCode> {
    let project = default_project(config, args.project)?;
    let dataset = CostDataset::open(config.dataset_path_for(&project)).map_err(ScanError::from)?;

    if let Some(before) = args.compact_before {
        let removed = dataset.compact(before).map_err(ScanError::from)?;
        println!("compacted {removed} rows dated before {before}");
    }

    let totals = dataset
        .daily_rollup(Some(short_project(&project)))
        .map_err(ScanError::from)?;
    if totals.is_empty() {
        println!("no rows for {project}");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<10}  {:<8}  {:<10}  {:>6}  {:>12}  {:>12}  {:>7}  {:>10}  {:>10}",
        "date", "origin", "product", "graphs", "total", "final-run", "tasks", "hours", "artifacts"
    );
    for (key, day) in totals.iter() {
        println!(
            "{:<10}  {:<8}  {:<10}  {:>6}  {:>12.2}  {:>12.2}  {:>7}  {:>10.1}  {:>10.2}",
            key.date,
            key.origin.as_str(),
            key.product,
            day.graph_count,
            day.total_cost,
            day.final_run_cost,
            day.task_count,
            day.compute_time / 3600.0,
            day.artifact_cost,
        );
    }
    Ok(ExitCode::SUCCESS)
}
