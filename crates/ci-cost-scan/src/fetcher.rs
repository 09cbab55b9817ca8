//! Resolving revisions to graph ids and materializing graphs.
//!
//! Fetched graphs are cached as `{cache_dir}/{graph_id}.json`. Graphs are
//! immutable once complete, so a cache entry is never invalidated; an entry
//! that fails to parse or validate is ignored and fetched again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ci_cost_client::{ClientError, TaskService, revision_index_key};
use ci_cost_config::ScannerConfig;
use ci_cost_core::ExecutionGraph;
use tracing::{debug, instrument, warn};

use crate::error::Result;

/// Fetches execution graphs through a [`TaskService`].
#[derive(Clone)]
pub struct GraphFetcher {
    service: Arc<dyn TaskService>,
    cache_dir: Option<PathBuf>,
    namespace: String,
    platform: String,
}

impl GraphFetcher {
    pub fn new(
        service: Arc<dyn TaskService>,
        namespace: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            service,
            cache_dir: None,
            namespace: namespace.into(),
            platform: platform.into(),
        }
    }

    pub fn from_config(service: Arc<dyn TaskService>, config: &ScannerConfig) -> Self {
        let fetcher = Self::new(service, &config.index_namespace, &config.index_platform);
        match &config.graph_cache_dir {
            Some(dir) => fetcher.with_cache_dir(dir),
            None => fetcher,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn service(&self) -> &Arc<dyn TaskService> {
        &self.service
    }

    /// Resolve a revision to the id of the graph that built it.
    ///
    /// An index miss is returned as [`ClientError::NotFound`].
    #[instrument(skip(self))]
    pub async fn resolve_graph_id(
        &self,
        revision: &str,
        project: &str,
        product: &str,
        nightly: bool,
    ) -> std::result::Result<String, ClientError> {
        let key = revision_index_key(
            &self.namespace,
            project,
            revision,
            product,
            &self.platform,
            nightly,
        );
        let task_id = self.service.find_task(&key).await?;
        let graph_id = self.service.task_group_id(&task_id).await?;
        debug!(%graph_id, "revision resolved");
        Ok(graph_id)
    }

    /// Fetch every task of a graph, following continuation tokens.
    #[instrument(skip(self))]
    pub async fn fetch_graph(&self, graph_id: &str) -> Result<ExecutionGraph> {
        let cache_path = self.cache_path(graph_id);
        if let Some(path) = &cache_path
            && let Some(graph) = read_cached(path, graph_id).await
        {
            debug!(tasks = graph.task_count(), "graph cache hit");
            return Ok(graph);
        }

        let mut tasks = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.service.list_task_group(graph_id, token.as_deref()).await?;
            tasks.extend(page.tasks);
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let graph = ExecutionGraph::new(graph_id, tasks)?;
        debug!(tasks = graph.task_count(), "graph fetched");

        if let Some(path) = &cache_path {
            write_cache(path, &graph).await;
        }
        Ok(graph)
    }

    fn cache_path(&self, graph_id: &str) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(format!("{graph_id}.json")))
    }
}

async fn read_cached(path: &Path, graph_id: &str) -> Option<ExecutionGraph> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let graph = match serde_json::from_slice::<ExecutionGraph>(&bytes) {
        Ok(graph) => graph,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable graph cache entry");
            return None;
        }
    };
    if graph.graph_id() != graph_id || graph.validate().is_err() {
        warn!(path = %path.display(), "ignoring invalid graph cache entry");
        return None;
    }
    Some(graph)
}

async fn write_cache(path: &Path, graph: &ExecutionGraph) {
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(graph).map_err(std::io::Error::other)?;
        tokio::fs::write(path, json).await
    }
    .await;
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to write graph cache entry");
    }
}
