//! # ci-cost-config
//!
//! Scanner configuration, loaded from YAML.
//!
//! Everything a scan needs (service URLs, cache locations, price tables,
//! concurrency) lives in an explicit [`ScannerConfig`] handed to the
//! components that need it; nothing is read from the process environment.
//!
//! ```yaml
//! pushlog_url: "https://hg.mozilla.org/{project}/json-pushes?version=2"
//! costs_csv_file: worker_type_monthly_costs.csv
//! dataset_path: "data/{project}.sqlite"
//! pushlog_cache_file: "cache/pushlog-{project}.json"
//! graph_cache_dir: cache/graphs
//! artifact_store:
//!   base_url: "https://s3.us-west-2.amazonaws.com"
//!   bucket: taskcluster-public-artifacts
//! projects: [mozilla-central, releases/mozilla-beta]
//! ```

use std::path::{Path, PathBuf};

use ci_cost_core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest accepted `finished_after_hours`, one year.
const MAX_FINISHED_AFTER_HOURS: i64 = 24 * 365;

/// Object-storage location of task artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStoreConfig {
    /// Base URL of the listing service
    pub base_url: String,
    pub bucket: String,
}

/// Configuration for a scan over one or more projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Push-history URL template with a `{project}` placeholder
    pub pushlog_url: String,

    /// Root URL of the index and queue services
    pub taskcluster_root_url: String,

    /// First components of index keys, e.g. `gecko.v2`
    pub index_namespace: String,

    /// Platform component of index keys, e.g. `linux64-opt`
    pub index_platform: String,

    /// Worker unit cost table
    pub costs_csv_file: PathBuf,

    /// Optional second price table merged into the first
    pub other_costs_csv_file: Option<PathBuf>,

    /// SQLite dataset; may contain `{project}`
    pub dataset_path: String,

    /// Push cache JSON file; may contain `{project}`
    pub pushlog_cache_file: String,

    /// Directory for cached execution graphs
    pub graph_cache_dir: Option<PathBuf>,

    /// Where artifacts are listed from; artifacts are not costed when absent
    pub artifact_store: Option<ArtifactStoreConfig>,

    /// Maximum simultaneous remote calls
    pub concurrency: usize,

    /// Per-request timeout
    pub request_timeout_secs: u64,

    /// Page size requested from paginated services
    pub page_size: u32,

    pub projects: Vec<String>,
    pub product: String,
    pub starting_push: Option<u64>,
    pub backfill_count: Option<u64>,

    /// Pushes younger than this are assumed to still have CI running
    pub finished_after_hours: i64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            pushlog_url: "https://hg.mozilla.org/{project}/json-pushes?version=2".to_string(),
            taskcluster_root_url: "https://firefox-ci-tc.services.mozilla.com".to_string(),
            index_namespace: "gecko.v2".to_string(),
            index_platform: "linux64-opt".to_string(),
            costs_csv_file: PathBuf::from("worker_type_monthly_costs.csv"),
            other_costs_csv_file: None,
            dataset_path: "{project}-costs.sqlite".to_string(),
            pushlog_cache_file: "pushlog-{project}.json".to_string(),
            graph_cache_dir: None,
            artifact_store: None,
            concurrency: 10,
            request_timeout_secs: 60,
            page_size: 1000,
            projects: vec!["mozilla-central".to_string()],
            product: "firefox".to_string(),
            starting_push: None,
            backfill_count: None,
            finished_after_hours: 24,
        }
    }
}

impl ScannerConfig {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::ConfigNotFound {
                    path: path.to_path_buf(),
                    source: Some(e),
                }
            } else {
                CoreError::io("reading configuration", path, e)
            }
        })?;
        let config = Self::from_yaml(&text).map_err(|e| match e {
            CoreError::ConfigInvalid { message, .. } => CoreError::ConfigInvalid {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        debug!(path = %path.display(), projects = ?config.projects, "loaded configuration");
        Ok(config)
    }

    /// Parse and validate a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| CoreError::ConfigInvalid {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(CoreError::ConfigValidation {
                message: message.to_string(),
            })
        };
        if !self.pushlog_url.contains("{project}") {
            return fail("pushlog_url must contain a {project} placeholder");
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1");
        }
        if self.page_size == 0 {
            return fail("page_size must be at least 1");
        }
        if self.projects.is_empty() {
            return fail("at least one project must be configured");
        }
        if self.finished_after_hours < 0 {
            return fail("finished_after_hours must not be negative");
        }
        if self.finished_after_hours > MAX_FINISHED_AFTER_HOURS {
            return fail("finished_after_hours must be at most one year");
        }
        if let Some(store) = &self.artifact_store
            && (store.base_url.is_empty() || store.bucket.is_empty())
        {
            return fail("artifact_store needs both base_url and bucket");
        }
        Ok(())
    }

    /// Push-history URL for a project.
    pub fn pushlog_url_for(&self, project: &str) -> String {
        self.pushlog_url.replace("{project}", project)
    }

    /// Push cache file for a project (`releases/mozilla-beta` → `releases_mozilla-beta`).
    pub fn pushlog_cache_file_for(&self, project: &str) -> PathBuf {
        PathBuf::from(
            self.pushlog_cache_file
                .replace("{project}", &project.replace('/', "_")),
        )
    }

    /// Dataset file for a project, using the short project name.
    pub fn dataset_path_for(&self, project: &str) -> PathBuf {
        PathBuf::from(
            self.dataset_path
                .replace("{project}", ci_cost_core::short_project(project)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.finished_after_hours, 24);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ScannerConfig::from_yaml(
            "costs_csv_file: costs.csv\nprojects: [try]\nbackfill_count: 50\n",
        )
        .unwrap();
        assert_eq!(config.costs_csv_file, PathBuf::from("costs.csv"));
        assert_eq!(config.projects, vec!["try".to_string()]);
        assert_eq!(config.backfill_count, Some(50));
        assert_eq!(config.product, "firefox");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = ScannerConfig::from_yaml("concurrency: [").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = ScannerConfig::from_yaml("concurrency: 0\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigValidation { .. }));
    }

    #[test]
    fn test_validation_bounds_finished_after_hours() {
        let err =
            ScannerConfig::from_yaml("finished_after_hours: 9223372036854775807\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigValidation { .. }));
        assert!(ScannerConfig::from_yaml("finished_after_hours: -1\n").is_err());

        let year = ScannerConfig::from_yaml("finished_after_hours: 8760\n").unwrap();
        assert_eq!(year.finished_after_hours, 8760);
    }

    #[test]
    fn test_project_templates() {
        let config = ScannerConfig {
            dataset_path: "out/{project}.sqlite".into(),
            pushlog_cache_file: "cache/{project}.json".into(),
            ..Default::default()
        };
        assert_eq!(
            config.dataset_path_for("releases/mozilla-beta"),
            PathBuf::from("out/mozilla-beta.sqlite")
        );
        assert_eq!(
            config.pushlog_cache_file_for("releases/mozilla-beta"),
            PathBuf::from("cache/releases_mozilla-beta.json")
        );
        assert_eq!(
            config.pushlog_url_for("try"),
            "https://hg.mozilla.org/try/json-pushes?version=2"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScannerConfig::load("/nonexistent/scanner.yml").unwrap_err();
        assert!(matches!(err, CoreError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "product: thunderbird").unwrap();
        writeln!(file, "artifact_store:").unwrap();
        writeln!(file, "  base_url: http://localhost:9000").unwrap();
        writeln!(file, "  bucket: artifacts").unwrap();
        let config = ScannerConfig::load(file.path()).unwrap();
        assert_eq!(config.product, "thunderbird");
        assert_eq!(config.artifact_store.unwrap().bucket, "artifacts");
    }
}
