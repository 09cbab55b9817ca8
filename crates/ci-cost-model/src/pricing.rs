//! Worker unit cost table with nearest-date lookup.
//!
//! Monthly costs per worker type are read from a CSV table with exactly the
//! columns `modified, year, month, provider, provisioner, worker_type,
//! usage_hours, cost`. Each (worker type, year, month) keeps the record with
//! the latest `modified` time. A month is placed on its 15th day, and a
//! lookup picks the month whose 15th is closest to the requested date;
//! an exact midpoint resolves to the later month.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{CostError, Result};

/// Columns a price table must have, no more and no fewer.
pub const EXPECTED_COLUMNS: [&str; 8] = [
    "modified",
    "year",
    "month",
    "provider",
    "provisioner",
    "worker_type",
    "usage_hours",
    "cost",
];

/// Day of the month each monthly record is anchored to.
const ANCHOR_DAY: u32 = 15;

/// One monthly cost record for a worker type.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerUnitCostRecord {
    pub modified: NaiveDateTime,
    pub year: i32,
    pub month: u32,
    pub provider: String,
    pub provisioner: String,
    pub worker_type: String,
    pub usage_hours: f64,
    pub cost: f64,
}

impl WorkerUnitCostRecord {
    /// Cost per hour of use.
    pub fn unit_cost(&self) -> f64 {
        self.cost / self.usage_hours
    }

    /// The 15th of the record's month.
    pub fn anchor_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, ANCHOR_DAY)
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    modified: String,
    year: i32,
    month: u32,
    provider: String,
    provisioner: String,
    worker_type: String,
    usage_hours: f64,
    cost: f64,
}

impl RawRecord {
    fn into_record(self, source_name: &str) -> Result<WorkerUnitCostRecord> {
        let modified = parse_modified(&self.modified).ok_or_else(|| {
            CostError::schema(
                source_name,
                format!("unparseable modified time '{}'", self.modified),
            )
        })?;
        if !(1..=12).contains(&self.month) {
            return Err(CostError::schema(
                source_name,
                format!("month {} out of range for {}", self.month, self.worker_type),
            ));
        }
        Ok(WorkerUnitCostRecord {
            modified,
            year: self.year,
            month: self.month,
            provider: self.provider,
            provisioner: self.provisioner,
            worker_type: self.worker_type,
            usage_hours: self.usage_hours,
            cost: self.cost,
        })
    }
}

fn parse_modified(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PricePoint {
    unit_cost: f64,
    modified: NaiveDateTime,
}

/// Unit costs per worker type, indexed by month anchor date.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    by_worker: HashMap<String, BTreeMap<NaiveDate, PricePoint>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from records; later records win ties on `modified`.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = WorkerUnitCostRecord>,
    {
        let mut table = Self::new();
        for record in records {
            table.insert(record);
        }
        table
    }

    /// Add a record, keeping the most recently modified one per month.
    ///
    /// Returns false when the record was dropped.
    pub fn insert(&mut self, record: WorkerUnitCostRecord) -> bool {
        if record.usage_hours <= 0.0 {
            warn!(
                worker_type = %record.worker_type,
                year = record.year,
                month = record.month,
                "price record without usage hours, skipping"
            );
            return false;
        }
        let Some(anchor) = record.anchor_date() else {
            return false;
        };
        let point = PricePoint {
            unit_cost: record.unit_cost(),
            modified: record.modified,
        };
        let months = self.by_worker.entry(record.worker_type).or_default();
        match months.get(&anchor) {
            Some(existing) if existing.modified > point.modified => false,
            _ => {
                months.insert(anchor, point);
                true
            }
        }
    }

    /// Read a table from CSV, validating the column set.
    pub fn from_csv_reader<R: Read>(reader: R, source_name: &str) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let found: BTreeSet<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let expected: BTreeSet<String> = EXPECTED_COLUMNS.iter().map(|c| c.to_string()).collect();
        let difference: Vec<&String> = found.symmetric_difference(&expected).collect();
        if !difference.is_empty() {
            return Err(CostError::schema(
                source_name,
                format!("unexpected column set, differing columns: {difference:?}"),
            ));
        }

        let mut table = Self::new();
        let mut count = 0usize;
        for raw in csv_reader.deserialize::<RawRecord>() {
            let raw = raw.map_err(|e| CostError::schema(source_name, e.to_string()))?;
            table.insert(raw.into_record(source_name)?);
            count += 1;
        }
        debug!(
            source = source_name,
            records = count,
            worker_types = table.worker_type_count(),
            "price table read"
        );
        Ok(table)
    }

    /// Read a table from a CSV file.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| {
                CostError::schema(path.display().to_string(), format!("cannot open: {e}"))
            })?;
        Self::from_csv_reader(file, &path.display().to_string())
    }

    /// Read the primary table and merge in an optional second one.
    pub fn load_all(primary: &Path, other: Option<&Path>) -> Result<Self> {
        let mut table = Self::from_csv_path(primary)?;
        if let Some(other) = other {
            table.extend(Self::from_csv_path(other)?);
        }
        info!(worker_types = table.worker_type_count(), "worker costs loaded");
        Ok(table)
    }

    /// Merge another table in, keeping the most recently modified entries.
    pub fn extend(&mut self, other: PriceTable) {
        for (worker_type, months) in other.by_worker {
            let mine = self.by_worker.entry(worker_type).or_default();
            for (anchor, point) in months {
                match mine.get(&anchor) {
                    Some(existing) if existing.modified > point.modified => {}
                    _ => {
                        mine.insert(anchor, point);
                    }
                }
            }
        }
    }

    /// Unit cost for `worker_type` from the month nearest to `date`.
    ///
    /// Returns `None` when the worker type has no entries at all.
    pub fn unit_cost(&self, worker_type: &str, date: NaiveDate) -> Option<f64> {
        let months = self.by_worker.get(worker_type)?;
        let before = months.range(..=date).next_back();
        let after = months.range(date..).next();
        let chosen = match (before, after) {
            (Some(b), Some(a)) => {
                let back = (date - *b.0).num_days();
                let ahead = (*a.0 - date).num_days();
                if ahead <= back { a } else { b }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some(chosen.1.unit_cost)
    }

    pub fn contains_worker_type(&self, worker_type: &str) -> bool {
        self.by_worker.contains_key(worker_type)
    }

    pub fn worker_type_count(&self) -> usize {
        self.by_worker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_worker.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        worker: &str,
        year: i32,
        month: u32,
        hours: f64,
        cost: f64,
        modified: &str,
    ) -> WorkerUnitCostRecord {
        WorkerUnitCostRecord {
            modified: parse_modified(modified).unwrap(),
            year,
            month,
            provider: "aws".into(),
            provisioner: "gecko-3".into(),
            worker_type: worker.into(),
            usage_hours: hours,
            cost,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn jan_and_march() -> PriceTable {
        PriceTable::from_records([
            record("b-linux", 2019, 1, 100.0, 100.0, "2019-02-01"),
            record("b-linux", 2019, 3, 100.0, 300.0, "2019-04-01"),
        ])
    }

    #[test]
    fn test_nearest_date_picks_january() {
        assert_eq!(jan_and_march().unit_cost("b-linux", date(2019, 1, 20)), Some(1.0));
    }

    #[test]
    fn test_nearest_date_picks_closer_march() {
        // Feb 20 is 23 days from Mar 15 and 36 days from Jan 15.
        assert_eq!(jan_and_march().unit_cost("b-linux", date(2019, 2, 20)), Some(3.0));
    }

    #[test]
    fn test_nearest_date_outside_range() {
        let table = jan_and_march();
        assert_eq!(table.unit_cost("b-linux", date(2018, 6, 1)), Some(1.0));
        assert_eq!(table.unit_cost("b-linux", date(2020, 6, 1)), Some(3.0));
    }

    #[test]
    fn test_midpoint_prefers_later_month() {
        let table = PriceTable::from_records([
            record("b-linux", 2019, 2, 10.0, 10.0, "2019-03-01"),
            record("b-linux", 2019, 3, 10.0, 20.0, "2019-04-01"),
        ]);
        // Mar 1 is 14 days from both Feb 15 and Mar 15.
        assert_eq!(table.unit_cost("b-linux", date(2019, 3, 1)), Some(2.0));
    }

    #[test]
    fn test_unknown_worker_type() {
        assert_eq!(jan_and_march().unit_cost("t-win10", date(2019, 1, 20)), None);
    }

    #[test]
    fn test_duplicate_month_prefers_latest_modified() {
        let table = PriceTable::from_records([
            record("b-linux", 2019, 1, 10.0, 50.0, "2019-02-10 09:00:00"),
            record("b-linux", 2019, 1, 10.0, 20.0, "2019-02-01 09:00:00"),
        ]);
        assert_eq!(table.unit_cost("b-linux", date(2019, 1, 15)), Some(5.0));
    }

    #[test]
    fn test_zero_usage_hours_dropped() {
        let mut table = PriceTable::new();
        assert!(!table.insert(record("b-linux", 2019, 1, 0.0, 10.0, "2019-02-01")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_csv_with_expected_columns() {
        let csv = "modified,year,month,provider,provisioner,worker_type,usage_hours,cost\n\
                   2019-02-01 10:00:00.123456,2019,1,aws,gecko-3,b-linux,200,100\n\
                   2019-02-01 10:00:00,2019,1,aws,gecko-t,t-linux-large,50,5\n";
        let table = PriceTable::from_csv_reader(csv.as_bytes(), "inline").unwrap();
        assert_eq!(table.worker_type_count(), 2);
        assert_eq!(table.unit_cost("b-linux", date(2019, 1, 1)), Some(0.5));
    }

    #[test]
    fn test_csv_column_order_does_not_matter() {
        let csv = "worker_type,cost,usage_hours,year,month,modified,provider,provisioner\n\
                   b-linux,30,10,2019,1,2019-02-01,aws,gecko-3\n";
        let table = PriceTable::from_csv_reader(csv.as_bytes(), "inline").unwrap();
        assert_eq!(table.unit_cost("b-linux", date(2019, 1, 1)), Some(3.0));
    }

    #[test]
    fn test_csv_with_extra_column_is_schema_error() {
        let csv = "modified,year,month,provider,provisioner,worker_type,usage_hours,cost,region\n";
        let err = PriceTable::from_csv_reader(csv.as_bytes(), "inline").unwrap_err();
        assert!(matches!(err, CostError::Schema { .. }));
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_csv_with_missing_column_is_schema_error() {
        let csv = "modified,year,month,provider,provisioner,worker_type,usage_hours\n";
        let err = PriceTable::from_csv_reader(csv.as_bytes(), "inline").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_extend_keeps_newest() {
        let mut primary =
            PriceTable::from_records([record("b-linux", 2019, 1, 1.0, 1.0, "2019-02-01")]);
        let other = PriceTable::from_records([
            record("b-linux", 2019, 1, 1.0, 9.0, "2019-03-01"),
            record("scriptworker", 2019, 1, 1.0, 2.0, "2019-03-01"),
        ]);
        primary.extend(other);
        assert_eq!(primary.unit_cost("b-linux", date(2019, 1, 15)), Some(9.0));
        assert!(primary.contains_worker_type("scriptworker"));
    }
}
