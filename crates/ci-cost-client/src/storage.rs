//! Object-storage listing.
//!
//! Artifacts are stored under `{taskId}/{runId}/{name}` keys. Listings are
//! paginated with a continuation token; [`ObjectStore::list_all`] follows the
//! tokens until the listing is exhausted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::http::{build_client, get_json};

const STORAGE: &str = "object-storage";

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectPage {
    #[serde(default)]
    pub key_count: u64,
    #[serde(default)]
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    #[serde(default)]
    pub contents: Vec<StoredObject>,
}

/// A bucket that can be listed by key prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one page of objects under `prefix`.
    async fn list_page(&self, prefix: &str, continuation_token: Option<&str>) -> Result<ObjectPage>;

    /// Fetch every object under `prefix`, following continuation tokens.
    async fn list_all(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, token.as_deref()).await?;
            if page.key_count == 0 && page.contents.is_empty() {
                break;
            }
            objects.extend(page.contents);
            if !page.is_truncated {
                break;
            }
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }
}

/// HTTP listing client for one bucket.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    page_size: u32,
}

impl HttpObjectStore {
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        timeout: Duration,
        page_size: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            page_size,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ObjectPage> {
        let url = format!("{}/{}", self.base_url, self.bucket);
        let mut request = self.client.get(&url).query(&[
            ("list-type", "2".to_string()),
            ("prefix", prefix.to_string()),
            ("max-keys", self.page_size.to_string()),
        ]);
        if let Some(token) = continuation_token {
            request = request.query(&[("continuation-token", token)]);
        }
        let page: ObjectPage = get_json(STORAGE, request).await?;
        debug!(
            prefix,
            objects = page.contents.len(),
            truncated = page.is_truncated,
            "listing page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves pre-built pages and records the tokens it was asked for.
    struct PagedStore {
        pages: Vec<ObjectPage>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ObjectStore for PagedStore {
        async fn list_page(&self, _prefix: &str, token: Option<&str>) -> Result<ObjectPage> {
            let mut tokens = self.tokens.lock().unwrap();
            let index = tokens.len();
            tokens.push(token.map(str::to_string));
            Ok(self.pages[index].clone())
        }
    }

    fn object(key: &str) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            size: 10,
            last_modified: "2019-02-20T10:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_list_all_follows_tokens() {
        let store = PagedStore {
            pages: vec![
                ObjectPage {
                    key_count: 1,
                    is_truncated: true,
                    next_continuation_token: Some("t1".into()),
                    contents: vec![object("T/0/a")],
                },
                ObjectPage {
                    key_count: 1,
                    is_truncated: false,
                    next_continuation_token: None,
                    contents: vec![object("T/0/b")],
                },
            ],
            tokens: Mutex::new(Vec::new()),
        };
        let objects = store.list_all("T/").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(*store.tokens.lock().unwrap(), vec![None, Some("t1".to_string())]);
    }

    #[tokio::test]
    async fn test_list_all_stops_on_empty_page() {
        let store = PagedStore {
            pages: vec![ObjectPage {
                key_count: 0,
                is_truncated: true,
                next_continuation_token: Some("never".into()),
                contents: vec![],
            }],
            tokens: Mutex::new(Vec::new()),
        };
        assert!(store.list_all("T/").await.unwrap().is_empty());
    }
}
