//! Typed records shared by the fetch, cost and persistence layers.
//!
//! Upstream task/run JSON is converted into these records at the fetch
//! boundary and validated there, so the cost model never deals with missing
//! keys or out-of-order timestamps.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// State of a single run of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
    Unknown,
}

impl RunState {
    /// Map an upstream state name; unrecognised names become `Unknown`.
    pub fn from_upstream(state: &str) -> Self {
        match state {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "exception" => Self::Exception,
            _ => Self::Unknown,
        }
    }
}

/// One attempt at executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run number within the task, starting at 0
    pub run_id: u32,
    pub state: RunState,
    pub scheduled: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub resolved: Option<DateTime<Utc>>,
}

impl Run {
    /// Billed wall time of this run, if it both started and resolved.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started, self.resolved) {
            (Some(started), Some(resolved)) => Some(resolved - started),
            _ => None,
        }
    }

    /// Check `resolved >= started >= scheduled` for the timestamps present.
    pub fn validate(&self, task_id: &str) -> Result<()> {
        if let Some(started) = self.started
            && started < self.scheduled
        {
            return Err(CoreError::invalid_record(
                format!("{task_id}/{}", self.run_id),
                "run started before it was scheduled",
            ));
        }
        if let Some(resolved) = self.resolved {
            let lower = self.started.unwrap_or(self.scheduled);
            if resolved < lower {
                return Err(CoreError::invalid_record(
                    format!("{task_id}/{}", self.run_id),
                    "run resolved before it started",
                ));
            }
        }
        Ok(())
    }
}

/// An artifact expiry declared in a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDeclaration {
    /// Artifact name or directory, e.g. `public/build`
    pub name: String,
    pub expires: DateTime<Utc>,
}

/// A single task of an execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Billing category of the worker the task ran on
    pub worker_type: String,
    /// Task kind (e.g. `build`, `test`)
    pub kind: String,
    pub name: String,
    /// True when the task's final run completed successfully
    pub completed: bool,
    pub runs: Vec<Run>,
    /// The task's own expiry, used as the default for its artifacts
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDeclaration>,
}

impl Task {
    /// Durations of every run that started and resolved, including retries.
    pub fn run_durations(&self) -> impl Iterator<Item = Duration> + '_ {
        self.runs.iter().filter_map(Run::duration)
    }

    /// Sum of all run durations.
    pub fn total_run_time(&self) -> Duration {
        self.run_durations().fold(Duration::zero(), |acc, d| acc + d)
    }

    /// The run considered authoritative: the last one.
    pub fn final_run(&self) -> Option<&Run> {
        self.runs.last()
    }

    /// Duration of the final run, when the task completed.
    pub fn final_run_duration(&self) -> Option<Duration> {
        if !self.completed {
            return None;
        }
        self.final_run().and_then(Run::duration)
    }

    /// Earliest start time over all runs.
    pub fn earliest_start(&self) -> Option<DateTime<Utc>> {
        self.runs.iter().filter_map(|r| r.started).min()
    }

    fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(CoreError::invalid_record("<unknown>", "task without an id"));
        }
        if self.worker_type.is_empty() {
            return Err(CoreError::invalid_record(&self.task_id, "task without a worker type"));
        }
        for run in &self.runs {
            run.validate(&self.task_id)?;
        }
        Ok(())
    }
}

/// A set of tasks sharing one graph id.
///
/// Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    graph_id: String,
    tasks: Vec<Task>,
}

impl ExecutionGraph {
    /// Build a graph, validating every task and run.
    pub fn new(graph_id: impl Into<String>, tasks: Vec<Task>) -> Result<Self> {
        let graph = Self {
            graph_id: graph_id.into(),
            tasks,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Validate all records, e.g. after reading the graph back from a cache.
    pub fn validate(&self) -> Result<()> {
        if self.graph_id.is_empty() {
            return Err(CoreError::invalid_record("<unknown>", "graph without an id"));
        }
        self.tasks.iter().try_for_each(Task::validate)
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Minimum over all task run start times.
    pub fn earliest_start_time(&self) -> Option<DateTime<Utc>> {
        self.tasks.iter().filter_map(Task::earliest_start).min()
    }

    /// Sum of all task run durations.
    pub fn total_compute_time(&self) -> Duration {
        self.tasks
            .iter()
            .fold(Duration::zero(), |acc, t| acc + t.total_run_time())
    }
}

/// A push record as kept in the push cache.
///
/// `taskgraph` distinguishes three cases: `None` (not looked up yet),
/// `Some("")` (looked up, no graph found) and `Some(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    /// Push time as seconds since the epoch
    pub date: i64,
    /// Tip changeset of the push, used for CI indexing
    pub changeset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taskgraph: Option<String>,
}

impl Push {
    pub fn new(date: i64, changeset: impl Into<String>) -> Self {
        Self {
            date,
            changeset: changeset.into(),
            taskgraph: None,
        }
    }

    /// The resolved graph id, if a non-empty one is recorded.
    pub fn graph_id(&self) -> Option<&str> {
        self.taskgraph.as_deref().filter(|id| !id.is_empty())
    }

    /// True when a lookup happened and found nothing.
    pub fn is_unresolved(&self) -> bool {
        self.taskgraph.as_deref() == Some("")
    }

    pub fn pushed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.date, 0).single()
    }

    /// Guess whether CI for this push has finished: older than `threshold`.
    pub fn probably_finished(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.pushed_at().is_some_and(|at| now - at > threshold)
    }
}

/// Storage metadata for one produced artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Storage key, `{taskId}/{runId}/{artifactName}`
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl ArtifactInfo {
    /// Time the artifact is kept in storage. Never negative.
    pub fn storage_duration(&self) -> Duration {
        (self.expires - self.created).max(Duration::zero())
    }
}

/// What triggered an execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Push,
    Nightly,
    Release,
    Adhoc,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Nightly => "nightly",
            Self::Release => "release",
            Self::Adhoc => "adhoc",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(Self::Push),
            "nightly" => Ok(Self::Nightly),
            "release" => Ok(Self::Release),
            "adhoc" => Ok(Self::Adhoc),
            other => Err(CoreError::schema("origin", format!("unknown origin '{other}'"))),
        }
    }
}

/// One row of the cost dataset, keyed by graph id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRow {
    pub project: String,
    pub product: String,
    pub graph_id: String,
    pub push_id: Option<u64>,
    pub graph_date: NaiveDate,
    pub origin: Origin,
    /// Cost of every run, including failed and retried ones
    pub total_cost: f64,
    /// Cost as if every completed task succeeded on its final run only
    pub final_run_cost: f64,
    pub task_count: u64,
    /// Total compute time in seconds
    pub compute_time: f64,
    /// Total artifact size in bytes; `None` when artifacts were not examined
    pub artifact_size: Option<u64>,
    pub artifact_cost: Option<f64>,
}

impl CostRow {
    pub fn has_artifact_data(&self) -> bool {
        self.artifact_size.is_some() && self.artifact_cost.is_some()
    }
}

/// Strip path prefixes like `releases/` from a project name.
pub fn short_project(project: &str) -> &str {
    project.rsplit('/').next().unwrap_or(project)
}
