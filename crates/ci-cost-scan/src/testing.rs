//! In-memory stand-ins for the remote services, used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ci_cost_client::{
    ClientError, ObjectPage, ObjectStore, PushWindow, PushlogEntry, PushlogSource, StoredObject,
    TaskGroupPage, TaskService,
};
use ci_cost_core::{Run, RunState, Task};

pub fn started_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 2, 20, 10, 0, 0).unwrap()
}

/// A completed single-run task starting at [`started_at`].
pub fn task(task_id: &str, worker_type: &str, minutes: i64) -> Task {
    Task {
        task_id: task_id.into(),
        worker_type: worker_type.into(),
        kind: "build".into(),
        name: task_id.into(),
        completed: true,
        runs: vec![Run {
            run_id: 0,
            state: RunState::Completed,
            scheduled: started_at(),
            started: Some(started_at()),
            resolved: Some(started_at() + Duration::minutes(minutes)),
        }],
        expires: started_at() + Duration::days(60),
        artifacts: vec![],
    }
}

#[derive(Default)]
pub struct FakeTaskService {
    index: HashMap<String, String>,
    groups: HashMap<String, String>,
    graphs: HashMap<String, Vec<Task>>,
    page_size: Option<usize>,
    list_calls: AtomicUsize,
    lookups: AtomicUsize,
}

impl FakeTaskService {
    pub fn with_index(mut self, namespace: &str, task_id: &str, graph_id: &str) -> Self {
        self.index.insert(namespace.into(), task_id.into());
        self.groups.insert(task_id.into(), graph_id.into());
        self
    }

    /// Index every revision in `revisions` to `{revision}-graph`.
    pub fn with_revisions(mut self, project: &str, revisions: &[&str]) -> Self {
        for rev in revisions {
            let key = format!("gecko.v2.{project}.revision.{rev}.firefox.linux64-opt");
            self = self.with_index(&key, &format!("{rev}-build"), &format!("{rev}-graph"));
        }
        self
    }

    pub fn with_graph(mut self, graph_id: &str, tasks: Vec<Task>) -> Self {
        self.graphs.insert(graph_id.into(), tasks);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskService for FakeTaskService {
    async fn find_task(&self, namespace: &str) -> ci_cost_client::Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.index.get(namespace).cloned().ok_or(ClientError::NotFound {
            service: "index",
            what: namespace.to_string(),
        })
    }

    async fn task_group_id(&self, task_id: &str) -> ci_cost_client::Result<String> {
        self.groups.get(task_id).cloned().ok_or(ClientError::NotFound {
            service: "queue",
            what: task_id.to_string(),
        })
    }

    async fn list_task_group(
        &self,
        graph_id: &str,
        continuation_token: Option<&str>,
    ) -> ci_cost_client::Result<TaskGroupPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let Some(tasks) = self.graphs.get(graph_id) else {
            return Err(ClientError::Upstream {
                service: "queue",
                message: format!("HTTP 503 for {graph_id}"),
            });
        };
        let offset: usize = continuation_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let size = self.page_size.unwrap_or(tasks.len().max(1));
        let end = (offset + size).min(tasks.len());
        Ok(TaskGroupPage {
            tasks: tasks[offset..end].to_vec(),
            continuation_token: (end < tasks.len()).then(|| end.to_string()),
        })
    }
}

/// Serves a fixed push history and records the URLs and windows requested.
pub struct FakePushlog {
    entries: Vec<PushlogEntry>,
    urls: Mutex<Vec<String>>,
    windows: Mutex<Vec<PushWindow>>,
}

impl FakePushlog {
    /// Pushes `ids`, each with the single changeset `rev{id}` and date `date`.
    pub fn new(ids: impl IntoIterator<Item = u64>, date: i64) -> Self {
        Self {
            entries: ids
                .into_iter()
                .map(|push_id| PushlogEntry {
                    push_id,
                    date,
                    changesets: vec![format!("parent{push_id}"), format!("rev{push_id}")],
                })
                .collect(),
            urls: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn windows(&self) -> Vec<PushWindow> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushlogSource for FakePushlog {
    async fn fetch_pushes(
        &self,
        url: &str,
        window: PushWindow,
    ) -> ci_cost_client::Result<Vec<PushlogEntry>> {
        self.urls.lock().unwrap().push(url.to_string());
        self.windows.lock().unwrap().push(window);
        let selected: Vec<PushlogEntry> = match window {
            PushWindow::Latest => {
                let skip = self.entries.len().saturating_sub(10);
                self.entries[skip..].to_vec()
            }
            PushWindow::After(id) => {
                self.entries.iter().filter(|e| e.push_id > id).cloned().collect()
            }
            PushWindow::Range { start, end } => self
                .entries
                .iter()
                .filter(|e| e.push_id > start && e.push_id <= end)
                .cloned()
                .collect(),
        };
        Ok(selected)
    }
}

/// Objects keyed by task id; listing a task in `failing` errors.
#[derive(Default)]
pub struct FakeStore {
    objects: HashMap<String, Vec<StoredObject>>,
    failing: HashSet<String>,
}

impl FakeStore {
    pub fn with_object(mut self, task_id: &str, key: &str, size: u64) -> Self {
        self.objects.entry(task_id.into()).or_default().push(StoredObject {
            key: key.into(),
            size,
            last_modified: started_at(),
        });
        self
    }

    pub fn with_failing(mut self, task_id: &str) -> Self {
        self.failing.insert(task_id.into());
        self
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_page(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> ci_cost_client::Result<ObjectPage> {
        let task_id = prefix.trim_end_matches('/');
        if self.failing.contains(task_id) {
            return Err(ClientError::Upstream {
                service: "object-storage",
                message: "connection reset".into(),
            });
        }
        let contents = self.objects.get(task_id).cloned().unwrap_or_default();
        Ok(ObjectPage {
            key_count: contents.len() as u64,
            is_truncated: false,
            next_continuation_token: None,
            contents,
        })
    }
}
