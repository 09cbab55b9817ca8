//! Error types for cost computation and the persisted dataset.

use ci_cost_core::CoreError;
use thiserror::Error;

/// Cost model and dataset errors.
#[derive(Error, Debug)]
pub enum CostError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Price table could not be read as CSV
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error (file reading)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input has an unexpected column set or value
    #[error("schema error in {source_name}: {message}")]
    Schema {
        source_name: String,
        message: String,
    },

    /// Stored row could not be decoded
    #[error("invalid stored row {graph_id}: {message}")]
    InvalidRow { graph_id: String, message: String },

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),

    /// Core error
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CostError {
    pub fn schema(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Schema problems abort the run before any remote call.
    pub fn is_fatal(&self) -> bool {
        match self {
            CostError::Schema { .. } | CostError::Csv(_) | CostError::Migration(_) => true,
            CostError::Core(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for cost operations.
pub type Result<T> = std::result::Result<T, CostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_is_fatal() {
        let err = CostError::schema("costs.csv", "missing column cost");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("costs.csv"));
    }

    #[test]
    fn test_io_error_is_not_fatal() {
        let err = CostError::from(std::io::Error::other("disk"));
        assert!(!err.is_fatal());
    }
}
