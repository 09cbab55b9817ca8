//! Push discovery and the push cache.
//!
//! The push cache is a JSON document `{project: {pushId: {date, changeset,
//! taskgraph}}}`. Entries are appended and never overwritten; the only
//! in-place change is filling in `taskgraph` for a push that has not been
//! looked up yet.
//!
//! A scan resumes forward from the highest cached push id. With a backfill
//! count and an existing checkpoint it instead requests the window just
//! below the lowest cached id, leaving the forward checkpoint untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ci_cost_client::{ConcurrencyLimiter, PushWindow, PushlogSource};
use ci_cost_core::{CoreError, Push};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::fetcher::GraphFetcher;

type ProjectPushes = BTreeMap<u64, Push>;

/// Cached pushes for every scanned project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushCache {
    path: Option<PathBuf>,
    projects: BTreeMap<String, ProjectPushes>,
}

impl PushCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache file, or start empty when it does not exist.
    ///
    /// A file that exists but does not parse is a fatal error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let projects = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::json_parse(path.display().to_string(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no push cache yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(CoreError::io("reading push cache", &path, e).into()),
        };
        Ok(Self {
            path: Some(path),
            projects,
        })
    }

    /// Write the cache to a temporary file and rename it into place.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DirectoryCreation {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_vec_pretty(&self.projects)
            .map_err(|e| CoreError::json_parse("push cache", e))?;
        let tmp = tmp_path(path);
        std::fs::write(&tmp, json).map_err(|e| CoreError::io("writing push cache", &tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| CoreError::io("replacing push cache", path, e))?;
        debug!(path = %path.display(), "push cache saved");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Pushes of a project ordered by push id.
    pub fn pushes(&self, project: &str) -> impl Iterator<Item = (u64, &Push)> {
        self.projects
            .get(project)
            .into_iter()
            .flat_map(|pushes| pushes.iter().map(|(id, push)| (*id, push)))
    }

    pub fn get(&self, project: &str, push_id: u64) -> Option<&Push> {
        self.projects.get(project)?.get(&push_id)
    }

    pub fn len(&self, project: &str) -> usize {
        self.projects.get(project).map_or(0, BTreeMap::len)
    }

    pub fn min_push_id(&self, project: &str) -> Option<u64> {
        self.projects.get(project)?.keys().next().copied()
    }

    pub fn max_push_id(&self, project: &str) -> Option<u64> {
        self.projects.get(project)?.keys().next_back().copied()
    }

    /// Add a push unless one with the same id is already cached.
    pub fn insert(&mut self, project: &str, push_id: u64, push: Push) -> bool {
        let pushes = self.projects.entry(project.to_string()).or_default();
        if pushes.contains_key(&push_id) {
            return false;
        }
        pushes.insert(push_id, push);
        true
    }

    /// Record the lookup result for a push that has not been looked up yet.
    pub fn record_graph(&mut self, project: &str, push_id: u64, graph_id: String) -> bool {
        match self.projects.get_mut(project).and_then(|p| p.get_mut(&push_id)) {
            Some(push) if push.taskgraph.is_none() => {
                push.taskgraph = Some(graph_id);
                true
            }
            _ => false,
        }
    }

    /// The push that produced a graph.
    pub fn push_for_graph(&self, project: &str, graph_id: &str) -> Option<(u64, &Push)> {
        self.pushes(project).find(|(_, push)| push.graph_id() == Some(graph_id))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Choose the push-history window for a scan.
pub fn push_window(
    known_min: Option<u64>,
    known_max: Option<u64>,
    starting_push: Option<u64>,
    backfill_count: Option<u64>,
) -> PushWindow {
    if let Some(count) = backfill_count {
        match known_min {
            Some(min) => {
                return PushWindow::Range {
                    start: min.saturating_sub(count + 1),
                    end: min.saturating_sub(1),
                };
            }
            None => warn!(
                backfill_count = count,
                "backfill requested without cached pushes, scanning forward"
            ),
        }
    }
    match starting_push.or(known_max) {
        Some(start) => PushWindow::After(start),
        None => PushWindow::Latest,
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    pub window: PushWindow,
    /// Pushes returned by the feed
    pub fetched: usize,
    /// Pushes not previously cached
    pub added: usize,
    pub resolved: usize,
    /// Lookups that found no graph and stored the empty sentinel
    pub not_found: usize,
    /// Lookups that failed and will be retried on the next scan
    pub failed: usize,
}

/// Finds new pushes and resolves them to graph ids.
pub struct PushDiscovery {
    pushlog: Arc<dyn PushlogSource>,
    fetcher: GraphFetcher,
    limiter: ConcurrencyLimiter,
}

impl PushDiscovery {
    pub fn new(
        pushlog: Arc<dyn PushlogSource>,
        fetcher: GraphFetcher,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        Self {
            pushlog,
            fetcher,
            limiter,
        }
    }

    /// Fetch new pushes for `project` from `pushlog_url`, resolve them and persist the cache.
    #[instrument(skip(self, cache))]
    pub async fn scan(
        &self,
        pushlog_url: &str,
        project: &str,
        product: &str,
        starting_push: Option<u64>,
        backfill_count: Option<u64>,
        cache: &mut PushCache,
    ) -> Result<DiscoveryReport> {
        let window = push_window(
            cache.min_push_id(project),
            cache.max_push_id(project),
            starting_push,
            backfill_count,
        );
        let entries = self.pushlog.fetch_pushes(pushlog_url, window).await?;

        let mut report = DiscoveryReport {
            window,
            fetched: entries.len(),
            added: 0,
            resolved: 0,
            not_found: 0,
            failed: 0,
        };

        for entry in &entries {
            let Some(tip) = entry.tip() else { continue };
            if cache.insert(project, entry.push_id, Push::new(entry.date, tip)) {
                report.added += 1;
            }
        }

        // Includes pushes left unresolved by an earlier failed scan.
        let pending: Vec<(u64, String)> = cache
            .pushes(project)
            .filter(|(_, push)| push.taskgraph.is_none())
            .map(|(id, push)| (id, push.changeset.clone()))
            .collect();

        let lookups = pending.iter().map(|(_, revision)| {
            self.limiter
                .run(self.fetcher.resolve_graph_id(revision, project, product, false))
        });
        let results = futures_util::future::join_all(lookups).await;

        for ((push_id, revision), result) in pending.into_iter().zip(results) {
            match result {
                Ok(graph_id) => {
                    cache.record_graph(project, push_id, graph_id);
                    report.resolved += 1;
                }
                Err(e) if e.is_not_found() => {
                    warn!(push_id, %revision, "no graph found for push");
                    cache.record_graph(project, push_id, String::new());
                    report.not_found += 1;
                }
                Err(e) => {
                    warn!(
                        push_id,
                        %revision,
                        error = %e,
                        "graph lookup failed, will retry next scan"
                    );
                    report.failed += 1;
                }
            }
        }

        cache.save()?;
        info!(
            window = ?report.window,
            fetched = report.fetched,
            added = report.added,
            resolved = report.resolved,
            not_found = report.not_found,
            failed = report.failed,
            "push discovery finished"
        );
        Ok(report)
    }
}
