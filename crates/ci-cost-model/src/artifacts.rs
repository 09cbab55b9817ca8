//! Artifact storage cost.
//!
//! Artifacts are billed per GB-second: standard storage for the first
//! 45 days of their lifetime, infrequent-access storage afterwards.
//! Lifetimes run from creation to the expiry declared in the task definition.

use chrono::{DateTime, Duration, Utc};
use ci_cost_core::{ArtifactInfo, Task};
use serde::Serialize;
use tracing::debug;

const SECONDS_PER_BILLING_MONTH: f64 = 30.0 * 86_400.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Storage prices and the tier transition point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageRates {
    /// Price per GB-second in standard storage
    pub standard_per_gb_second: f64,
    /// Price per GB-second after the transition
    pub infrequent_per_gb_second: f64,
    pub transition: Duration,
}

impl Default for StorageRates {
    fn default() -> Self {
        Self {
            standard_per_gb_second: 0.02 / SECONDS_PER_BILLING_MONTH,
            infrequent_per_gb_second: 0.0125 / SECONDS_PER_BILLING_MONTH,
            transition: Duration::days(45),
        }
    }
}

/// Seconds spent in each storage tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierSplit {
    pub standard_seconds: f64,
    pub infrequent_seconds: f64,
}

impl StorageRates {
    /// A lifetime of exactly the transition period stays in standard storage.
    pub fn split(&self, lifetime: Duration) -> TierSplit {
        let lifetime = lifetime.num_milliseconds().max(0) as f64 / 1000.0;
        let transition = self.transition.num_seconds() as f64;
        if lifetime > transition {
            TierSplit {
                standard_seconds: transition,
                infrequent_seconds: lifetime - transition,
            }
        } else {
            TierSplit {
                standard_seconds: lifetime,
                infrequent_seconds: 0.0,
            }
        }
    }

    pub fn artifact_cost(&self, artifact: &ArtifactInfo) -> f64 {
        let gb = artifact.size as f64 / BYTES_PER_GB;
        let split = self.split(artifact.storage_duration());
        gb * split.standard_seconds * self.standard_per_gb_second
            + gb * split.infrequent_seconds * self.infrequent_per_gb_second
    }
}

/// Summed storage for a set of artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ArtifactCost {
    pub total_size: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactCostModel {
    rates: StorageRates,
}

impl ArtifactCostModel {
    pub fn new(rates: StorageRates) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &StorageRates {
        &self.rates
    }

    pub fn compute(&self, artifacts: &[ArtifactInfo]) -> ArtifactCost {
        let cost = artifacts.iter().fold(ArtifactCost::default(), |acc, artifact| ArtifactCost {
            total_size: acc.total_size + artifact.size,
            total_cost: acc.total_cost + self.rates.artifact_cost(artifact),
        });
        debug!(
            artifacts = artifacts.len(),
            size = cost.total_size,
            cost = cost.total_cost,
            "artifacts priced"
        );
        cost
    }
}

/// Expiry lookup for the storage keys of one task.
///
/// Every declared artifact name is expanded to `{taskId}/{runId}/{name}` for
/// each run of the task. A key takes the expiry of the longest declaration
/// that prefixes it, or the task's own expiry when nothing matches.
#[derive(Debug, Clone)]
pub struct ExpiryTable {
    prefixes: Vec<(String, DateTime<Utc>)>,
    default: DateTime<Utc>,
}

impl ExpiryTable {
    pub fn for_task(task: &Task) -> Self {
        let mut prefixes: Vec<(String, DateTime<Utc>)> = task
            .runs
            .iter()
            .flat_map(|run| {
                task.artifacts.iter().map(move |decl| {
                    (format!("{}/{}/{}", task.task_id, run.run_id, decl.name), decl.expires)
                })
            })
            .collect();
        // Longest first so the first match is the most specific.
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            prefixes,
            default: task.expires,
        }
    }

    pub fn expiry_for(&self, key: &str) -> DateTime<Utc> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, expires)| *expires)
            .unwrap_or(self.default)
    }

    /// Attach an expiry to a listed storage object.
    pub fn annotate(
        &self,
        key: impl Into<String>,
        size: u64,
        created: DateTime<Utc>,
    ) -> ArtifactInfo {
        let name = key.into();
        let expires = self.expiry_for(&name);
        ArtifactInfo {
            name,
            size,
            created,
            expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ci_cost_core::{ArtifactDeclaration, Run, RunState};

    const GB: u64 = 1024 * 1024 * 1024;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 2, 20, 0, 0, 0).unwrap()
    }

    fn artifact(size: u64, lifetime: Duration) -> ArtifactInfo {
        ArtifactInfo {
            name: "T/0/public/build/target.tar.gz".into(),
            size,
            created: created(),
            expires: created() + lifetime,
        }
    }

    #[test]
    fn test_exactly_transition_is_all_standard() {
        let rates = StorageRates::default();
        let split = rates.split(Duration::days(45));
        assert_eq!(split.infrequent_seconds, 0.0);

        let cost = rates.artifact_cost(&artifact(GB, Duration::days(45)));
        assert!((cost - 0.02 * 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_one_day_past_transition() {
        let rates = StorageRates::default();
        let split = rates.split(Duration::days(46));
        assert_eq!(split.standard_seconds, 45.0 * 86_400.0);
        assert_eq!(split.infrequent_seconds, 86_400.0);

        let cost = rates.artifact_cost(&artifact(GB, Duration::days(46)));
        let expected = 0.02 * 1.5 + 0.0125 / 30.0;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_negative_lifetime_costs_nothing() {
        let rates = StorageRates::default();
        assert_eq!(rates.artifact_cost(&artifact(GB, Duration::days(-3))), 0.0);
    }

    #[test]
    fn test_compute_sums_sizes() {
        let model = ArtifactCostModel::default();
        let month = artifact(GB, Duration::days(30));
        let cost = model.compute(&[month.clone(), month]);
        assert_eq!(cost.total_size, 2 * GB);
        assert!((cost.total_cost - 0.04).abs() < 1e-9);
        assert_eq!(model.compute(&[]), ArtifactCost::default());
    }

    fn task_with_declarations() -> Task {
        let run = |id| Run {
            run_id: id,
            state: RunState::Completed,
            scheduled: created(),
            started: Some(created()),
            resolved: Some(created() + Duration::hours(1)),
        };
        Task {
            task_id: "T".into(),
            worker_type: "b-linux".into(),
            kind: "build".into(),
            name: "build".into(),
            completed: true,
            runs: vec![run(0), run(1)],
            expires: created() + Duration::days(365),
            artifacts: vec![
                ArtifactDeclaration {
                    name: "public/build".into(),
                    expires: created() + Duration::days(30),
                },
                ArtifactDeclaration {
                    name: "public/build/logs".into(),
                    expires: created() + Duration::days(7),
                },
            ],
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = ExpiryTable::for_task(&task_with_declarations());
        assert_eq!(
            table.expiry_for("T/0/public/build/logs/live.log"),
            created() + Duration::days(7)
        );
        assert_eq!(table.expiry_for("T/1/public/build/target.zip"), created() + Duration::days(30));
    }

    #[test]
    fn test_unmatched_key_uses_task_expiry() {
        let table = ExpiryTable::for_task(&task_with_declarations());
        assert_eq!(table.expiry_for("T/0/private/secret.txt"), created() + Duration::days(365));
        // Run ids not in the task do not match any declaration.
        assert_eq!(table.expiry_for("T/5/public/build/x"), created() + Duration::days(365));
    }

    #[test]
    fn test_annotate_builds_artifact_info() {
        let table = ExpiryTable::for_task(&task_with_declarations());
        let info = table.annotate("T/0/public/build/a.zip", 10, created());
        assert_eq!(info.storage_duration(), Duration::days(30));
    }
}
