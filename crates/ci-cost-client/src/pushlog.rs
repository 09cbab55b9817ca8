//! Push-history client.
//!
//! Reads the `json-pushes` feed (version 2): an object mapping push ids to
//! `{date, changesets}`. The feed accepts `startID` (exclusive) and `endID`
//! (inclusive) bounds; with neither it returns the most recent pushes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::{ClientError, Result};
use crate::http::{build_client, get_json};

const PUSHLOG: &str = "pushlog";

/// Which slice of the push history to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushWindow {
    /// The service default (typically the most recent ~10 pushes)
    Latest,
    /// Every push with an id greater than the given one
    After(u64),
    /// Pushes with `start < id <= end`
    Range { start: u64, end: u64 },
}

/// One push as returned by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushlogEntry {
    pub push_id: u64,
    /// Seconds since the epoch
    pub date: i64,
    /// Changesets in push order; the last one is the tip
    pub changesets: Vec<String>,
}

impl PushlogEntry {
    /// The tip changeset, used for CI indexing.
    pub fn tip(&self) -> Option<&str> {
        self.changesets.last().map(String::as_str)
    }
}

/// Source of push history.
#[async_trait]
pub trait PushlogSource: Send + Sync {
    /// Fetch the pushes in `window` from `url`, ordered by push id.
    async fn fetch_pushes(&self, url: &str, window: PushWindow) -> Result<Vec<PushlogEntry>>;
}

/// HTTP client for the `json-pushes` feed.
pub struct PushlogClient {
    client: reqwest::Client,
}

impl PushlogClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PushlogSource for PushlogClient {
    #[instrument(skip(self))]
    async fn fetch_pushes(&self, url: &str, window: PushWindow) -> Result<Vec<PushlogEntry>> {
        let mut request = self.client.get(url);
        match window {
            PushWindow::Latest => {}
            PushWindow::After(start) => {
                request = request.query(&[("startID", start)]);
            }
            PushWindow::Range { start, end } => {
                request = request.query(&[("startID", start), ("endID", end)]);
            }
        }
        let feed: PushFeed = get_json(PUSHLOG, request).await?;
        let entries = feed.into_entries(url)?;
        debug!(count = entries.len(), "pushes fetched");
        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
struct PushFeed {
    #[serde(default)]
    pushes: BTreeMap<String, RawPush>,
}

#[derive(Debug, Deserialize)]
struct RawPush {
    date: i64,
    #[serde(default)]
    changesets: Vec<ChangesetRef>,
}

/// `full=1` feeds return objects instead of bare hashes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChangesetRef {
    Node(String),
    Full { node: String },
}

impl PushFeed {
    fn into_entries(self, url: &str) -> Result<Vec<PushlogEntry>> {
        let mut entries = Vec::with_capacity(self.pushes.len());
        for (id, raw) in self.pushes {
            let push_id = id.parse::<u64>().map_err(|_| {
                ClientError::invalid_payload(url, format!("push id '{id}' is not an integer"))
            })?;
            if raw.changesets.is_empty() {
                warn!(push_id, "push without changesets, skipping");
                continue;
            }
            let changesets = raw
                .changesets
                .into_iter()
                .map(|c| match c {
                    ChangesetRef::Node(node) | ChangesetRef::Full { node } => node,
                })
                .collect();
            entries.push(PushlogEntry {
                push_id,
                date: raw.date,
                changesets,
            });
        }
        entries.sort_by_key(|e| e.push_id);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_is_ordered_numerically() {
        let feed: PushFeed = serde_json::from_value(serde_json::json!({
            "lastpushid": 1000,
            "pushes": {
                "1000": {"date": 30, "changesets": ["c"]},
                "999": {"date": 20, "changesets": ["a", "b"]},
            }
        }))
        .unwrap();
        let entries = feed.into_entries("test").unwrap();
        assert_eq!(entries[0].push_id, 999);
        assert_eq!(entries[0].tip(), Some("b"));
        assert_eq!(entries[1].push_id, 1000);
    }

    #[test]
    fn test_full_changesets_and_empty_pushes() {
        let feed: PushFeed = serde_json::from_value(serde_json::json!({
            "pushes": {
                "5": {"date": 1, "changesets": [{"node": "n1", "desc": "x"}, {"node": "n2"}]},
                "6": {"date": 2, "changesets": []},
            }
        }))
        .unwrap();
        let entries = feed.into_entries("test").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tip(), Some("n2"));
    }

    #[test]
    fn test_non_numeric_push_id_is_invalid() {
        let feed: PushFeed = serde_json::from_value(serde_json::json!({
            "pushes": {"abc": {"date": 1, "changesets": ["c"]}}
        }))
        .unwrap();
        assert!(matches!(
            feed.into_entries("test"),
            Err(ClientError::InvalidPayload { .. })
        ));
    }
}
