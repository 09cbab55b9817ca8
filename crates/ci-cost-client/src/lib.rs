//! # ci-cost-client
//!
//! Clients for the remote services a cost scan depends on, each behind a
//! trait so the scan pipeline can be exercised without a network:
//!
//! - [`TaskService`] / [`TaskclusterClient`] - index lookups, task definitions,
//!   task-group listings
//! - [`PushlogSource`] / [`PushlogClient`] - push history
//! - [`ObjectStore`] / [`HttpObjectStore`] - paginated artifact listings
//! - [`ConcurrencyLimiter`] - bounds the number of in-flight calls
//!
//! None of the clients retry. A transient failure is reported to the caller
//! and the affected graph is picked up again by the next scan.

pub mod error;
mod http;
pub mod limiter;
pub mod pushlog;
pub mod storage;
pub mod taskcluster;

pub use error::{ClientError, Result};
pub use http::build_client;
pub use limiter::{ConcurrencyLimiter, DEFAULT_PERMITS};
pub use pushlog::{PushWindow, PushlogClient, PushlogEntry, PushlogSource};
pub use storage::{HttpObjectStore, ObjectPage, ObjectStore, StoredObject};
pub use taskcluster::{TaskGroupPage, TaskService, TaskclusterClient, revision_index_key};
