//! Error type for the scan pipeline.

use ci_cost_client::ClientError;
use ci_cost_core::CoreError;
use ci_cost_model::CostError;
use thiserror::Error;

/// Scan errors, wrapping the layer that failed.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Cost(#[from] CostError),
}

impl ScanError {
    /// True when the run must stop; everything else is logged per graph.
    pub fn is_fatal(&self) -> bool {
        match self {
            ScanError::Core(e) => e.is_fatal(),
            ScanError::Cost(e) => e.is_fatal(),
            ScanError::Client(_) => false,
        }
    }

    /// True when a later scan may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::Client(e) if e.is_transient())
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            ScanError::Core(e) => e.guidance(),
            ScanError::Cost(CostError::Schema { .. }) | ScanError::Cost(CostError::Csv(_)) => Some(
                "Price tables need exactly: modified, year, month, provider, provisioner, \
                 worker_type, usage_hours, cost",
            ),
            ScanError::Cost(CostError::Migration(_)) => {
                Some("The dataset was written by a newer version; point dataset_path at a new file")
            }
            ScanError::Client(e) if e.is_transient() => {
                Some("The service is unavailable or rate limiting; re-run the scan later")
            }
            _ => None,
        }
    }
}

/// Result type for scan operations.
pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_failure_is_transient_not_fatal() {
        let err = ScanError::from(ClientError::Upstream {
            service: "queue",
            message: "HTTP 503".into(),
        });
        assert!(err.is_transient());
        assert!(!err.is_fatal());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_price_schema_is_fatal() {
        let err = ScanError::from(CostError::schema("costs.csv", "missing cost"));
        assert!(err.is_fatal());
        assert!(err.guidance().unwrap().contains("usage_hours"));
    }

    #[test]
    fn test_corrupt_cache_is_fatal() {
        let err = ScanError::from(CoreError::schema("push cache", "not an object"));
        assert!(err.is_fatal());
    }
}
