//! Index and queue service client.
//!
//! The index maps structured keys such as
//! `gecko.v2.mozilla-central.revision.<rev>.firefox.linux64-opt` to a task id;
//! the queue returns task definitions and, per graph, every task with its
//! run history. Queue payloads are converted into typed
//! [`ci_cost_core::Task`] records here, so malformed upstream data is rejected
//! at this boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ci_cost_core::{ArtifactDeclaration, Run, RunState, Task};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{ClientError, Result};
use crate::http::{build_client, get_json};

const INDEX: &str = "index";
const QUEUE: &str = "queue";

/// One page of a graph's task listing.
#[derive(Debug, Clone)]
pub struct TaskGroupPage {
    pub tasks: Vec<Task>,
    pub continuation_token: Option<String>,
}

/// Operations the cost pipeline needs from the index and queue services.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Look up the task id indexed under `namespace`.
    async fn find_task(&self, namespace: &str) -> Result<String>;

    /// Graph id owning a task.
    async fn task_group_id(&self, task_id: &str) -> Result<String>;

    /// One page of tasks belonging to a graph.
    async fn list_task_group(
        &self,
        graph_id: &str,
        continuation_token: Option<&str>,
    ) -> Result<TaskGroupPage>;
}

/// HTTP client for the index and queue services.
pub struct TaskclusterClient {
    client: reqwest::Client,
    root_url: String,
    page_size: u32,
}

impl TaskclusterClient {
    pub fn new(root_url: impl Into<String>, timeout: Duration, page_size: u32) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            root_url: root_url.into().trim_end_matches('/').to_string(),
            page_size,
        })
    }

    /// Use an existing reqwest client.
    pub fn with_client(
        client: reqwest::Client,
        root_url: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            root_url: root_url.into().trim_end_matches('/').to_string(),
            page_size,
        }
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }
}

#[async_trait]
impl TaskService for TaskclusterClient {
    #[instrument(skip(self))]
    async fn find_task(&self, namespace: &str) -> Result<String> {
        let url = format!("{}/api/index/v1/task/{}", self.root_url, namespace);
        let indexed: IndexedTask = get_json(INDEX, self.client.get(&url))
            .await
            .map_err(|e| match e {
                ClientError::NotFound { service, .. } => ClientError::NotFound {
                    service,
                    what: namespace.to_string(),
                },
                other => other,
            })?;
        debug!(namespace, task_id = %indexed.task_id, "index hit");
        Ok(indexed.task_id)
    }

    #[instrument(skip(self))]
    async fn task_group_id(&self, task_id: &str) -> Result<String> {
        let url = format!("{}/api/queue/v1/task/{}", self.root_url, task_id);
        let definition: TaskDefinition = get_json(QUEUE, self.client.get(&url)).await?;
        definition.task_group_id.ok_or_else(|| {
            ClientError::invalid_payload(format!("task {task_id}"), "missing taskGroupId")
        })
    }

    #[instrument(skip(self))]
    async fn list_task_group(
        &self,
        graph_id: &str,
        continuation_token: Option<&str>,
    ) -> Result<TaskGroupPage> {
        let url = format!("{}/api/queue/v1/task-group/{}/list", self.root_url, graph_id);
        let mut request = self
            .client
            .get(&url)
            .query(&[("limit", self.page_size.to_string())]);
        if let Some(token) = continuation_token {
            request = request.query(&[("continuationToken", token)]);
        }
        let listing: TaskGroupListing = get_json(QUEUE, request).await?;
        let tasks = listing
            .tasks
            .into_iter()
            .map(TaskEntry::into_task)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            graph_id,
            count = tasks.len(),
            more = listing.continuation_token.is_some(),
            "task group page"
        );
        Ok(TaskGroupPage {
            tasks,
            continuation_token: listing.continuation_token,
        })
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexedTask {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskGroupListing {
    #[serde(default)]
    tasks: Vec<TaskEntry>,
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    status: TaskStatus,
    task: TaskDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskStatus {
    task_id: String,
    worker_type: String,
    state: String,
    #[serde(default)]
    runs: Vec<RunStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunStatus {
    run_id: u32,
    state: String,
    scheduled: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    resolved: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDefinition {
    task_group_id: Option<String>,
    expires: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: TaskMetadata,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    payload: TaskPayload,
}

#[derive(Debug, Default, Deserialize)]
struct TaskMetadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct TaskPayload {
    artifacts: Option<ArtifactsPayload>,
}

/// Declared artifacts come either as a list or as a map keyed by name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArtifactsPayload {
    List(Vec<ListedArtifact>),
    Map(BTreeMap<String, MappedArtifact>),
}

#[derive(Debug, Deserialize)]
struct ListedArtifact {
    name: Option<String>,
    expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MappedArtifact {
    expires: Option<DateTime<Utc>>,
}

impl ArtifactsPayload {
    /// Declarations with missing expiries filled from the task's own.
    fn declarations(self, task_expires: DateTime<Utc>) -> Vec<ArtifactDeclaration> {
        match self {
            ArtifactsPayload::List(list) => list
                .into_iter()
                .filter_map(|a| {
                    a.name.map(|name| ArtifactDeclaration {
                        name,
                        expires: a.expires.unwrap_or(task_expires),
                    })
                })
                .collect(),
            ArtifactsPayload::Map(map) => map
                .into_iter()
                .map(|(name, a)| ArtifactDeclaration {
                    name,
                    expires: a.expires.unwrap_or(task_expires),
                })
                .collect(),
        }
    }
}

impl TaskEntry {
    fn into_task(self) -> Result<Task> {
        let TaskEntry { status, task } = self;
        let expires = task.expires.ok_or_else(|| {
            ClientError::invalid_payload(format!("task {}", status.task_id), "missing expires")
        })?;
        let artifacts = task
            .payload
            .artifacts
            .map(|a| a.declarations(expires))
            .unwrap_or_default();
        let runs = status
            .runs
            .into_iter()
            .map(|r| Run {
                run_id: r.run_id,
                state: RunState::from_upstream(&r.state),
                scheduled: r.scheduled,
                started: r.started,
                resolved: r.resolved,
            })
            .collect();
        let task = Task {
            completed: status.state == "completed",
            kind: task.tags.get("kind").cloned().unwrap_or_default(),
            name: task.metadata.name,
            task_id: status.task_id,
            worker_type: status.worker_type,
            runs,
            expires,
            artifacts,
        };
        Ok(task)
    }
}

/// Build an index key for a revision's build task.
///
/// `<namespace>.<project>.[nightly.]revision.<revision>.<product>.<platform>`,
/// with path prefixes such as `releases/` stripped from the project.
pub fn revision_index_key(
    namespace: &str,
    project: &str,
    revision: &str,
    product: &str,
    platform: &str,
    nightly: bool,
) -> String {
    let nightly = if nightly { "nightly." } else { "" };
    format!(
        "{namespace}.{project}.{nightly}revision.{revision}.{product}.{platform}",
        project = ci_cost_core::short_project(project),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_index_key() {
        assert_eq!(
            revision_index_key(
                "gecko.v2",
                "mozilla-central",
                "abc123",
                "firefox",
                "linux64-opt",
                false
            ),
            "gecko.v2.mozilla-central.revision.abc123.firefox.linux64-opt"
        );
        assert_eq!(
            revision_index_key(
                "gecko.v2",
                "releases/mozilla-beta",
                "abc123",
                "firefox",
                "linux64-opt",
                true
            ),
            "gecko.v2.mozilla-beta.nightly.revision.abc123.firefox.linux64-opt"
        );
    }

    #[test]
    fn test_task_entry_with_listed_artifacts() {
        let json = serde_json::json!({
            "status": {
                "taskId": "T1",
                "workerType": "b-linux",
                "state": "completed",
                "runs": [{
                    "runId": 0,
                    "state": "completed",
                    "scheduled": "2019-02-20T10:00:00.000Z",
                    "started": "2019-02-20T10:01:00.000Z",
                    "resolved": "2019-02-20T10:31:00.000Z"
                }]
            },
            "task": {
                "taskGroupId": "G1",
                "expires": "2020-02-20T10:00:00.000Z",
                "metadata": {"name": "build-linux64/opt"},
                "tags": {"kind": "build"},
                "payload": {"artifacts": [
                    {"name": "public/build", "expires": "2019-06-20T10:00:00.000Z"},
                    {"name": "public/logs"},
                    {"path": "/builds/worker/unnamed"}
                ]}
            }
        });
        let entry: TaskEntry = serde_json::from_value(json).unwrap();
        let task = entry.into_task().unwrap();
        assert!(task.completed);
        assert_eq!(task.kind, "build");
        assert_eq!(task.runs.len(), 1);
        assert_eq!(task.artifacts.len(), 2);
        assert_eq!(task.artifacts[1].expires, task.expires);
    }

    #[test]
    fn test_task_entry_with_mapped_artifacts() {
        let json = serde_json::json!({
            "status": {"taskId": "T2", "workerType": "t-win10", "state": "failed", "runs": []},
            "task": {
                "expires": "2020-02-20T10:00:00.000Z",
                "payload": {"artifacts": {
                    "public/test_info": {"expires": "2019-03-20T10:00:00.000Z", "type": "directory"}
                }}
            }
        });
        let entry: TaskEntry = serde_json::from_value(json).unwrap();
        let task = entry.into_task().unwrap();
        assert!(!task.completed);
        assert_eq!(task.artifacts[0].name, "public/test_info");
        assert_eq!(task.kind, "");
    }

    #[test]
    fn test_task_entry_without_expiry_is_rejected() {
        let json = serde_json::json!({
            "status": {"taskId": "T3", "workerType": "b-linux", "state": "completed"},
            "task": {}
        });
        let entry: TaskEntry = serde_json::from_value(json).unwrap();
        assert!(matches!(entry.into_task(), Err(ClientError::InvalidPayload { .. })));
    }
}
