//! Time-bucketed sums merged onto a shared, contiguous label sequence.
//!
//! A source reports sums per (group, bucket) for the buckets that actually
//! have data. The merge step lays those sums over the full bin sequence from
//! [`enumerate_bins`], so empty periods appear as explicit zeros and every
//! group's series lines up with the same labels.

use crate::bins::{enumerate_bins, Granularity, TimeRange};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::error;
use uuid::Uuid;

/// The entity a series belongs to, e.g. a pharmacy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: Uuid,
    pub name: String,
}

/// Sum of one bucket, optionally for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSum {
    pub group: Option<GroupRef>,
    pub bucket: String,
    pub amount: f64,
}

/// Anything that can sum an amount per (group, bucket) over a time range.
pub trait AmountSource {
    fn bucket_sums(&self, granularity: Granularity, range: &TimeRange) -> Result<Vec<BucketSum>>;
}

/// A timestamped amount held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedAmount {
    pub at: DateTime<Utc>,
    pub amount: f64,
    pub group: Option<GroupRef>,
}

impl AmountSource for [TimedAmount] {
    fn bucket_sums(&self, granularity: Granularity, range: &TimeRange) -> Result<Vec<BucketSum>> {
        let mut sums: BTreeMap<(Option<Uuid>, String), (Option<GroupRef>, f64)> = BTreeMap::new();
        for record in self.iter().filter(|r| range.contains(&r.at)) {
            let bucket = granularity.label(record.at.date_naive());
            let entry = sums
                .entry((record.group.as_ref().map(|g| g.id), bucket))
                .or_insert_with(|| (record.group.clone(), 0.0));
            entry.1 += record.amount;
        }
        Ok(sums
            .into_iter()
            .map(|((_, bucket), (group, amount))| BucketSum { group, bucket, amount })
            .collect())
    }
}

impl AmountSource for Vec<TimedAmount> {
    fn bucket_sums(&self, granularity: Granularity, range: &TimeRange) -> Result<Vec<BucketSum>> {
        self.as_slice().bucket_sums(granularity, range)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

impl Series {
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSeries {
    pub id: Uuid,
    pub name: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedSeries {
    pub labels: Vec<String>,
    pub rows: Vec<GroupSeries>,
}

impl GroupedSeries {
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupBy {
    #[default]
    None,
    Entity,
}

/// Either shape of an aggregation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Aggregation {
    Flat(Series),
    Grouped(GroupedSeries),
}

/// Aggregate `source` into a flat or per-entity series.
pub fn aggregate<S: AmountSource + ?Sized>(
    source: &S,
    granularity: Granularity,
    range: &TimeRange,
    group_by: GroupBy,
) -> Result<Aggregation> {
    match group_by {
        GroupBy::None => aggregate_flat(source, granularity, range).map(Aggregation::Flat),
        GroupBy::Entity => aggregate_grouped(source, granularity, range).map(Aggregation::Grouped),
    }
}

/// One series over all records, ignoring any grouping the source reports.
pub fn aggregate_flat<S: AmountSource + ?Sized>(
    source: &S,
    granularity: Granularity,
    range: &TimeRange,
) -> Result<Series> {
    let sums = source.bucket_sums(granularity, range)?;
    let labels = enumerate_bins(granularity, range);

    let mut by_bucket: HashMap<String, f64> = HashMap::new();
    for sum in sums {
        *by_bucket.entry(sum.bucket).or_insert(0.0) += sum.amount;
    }
    check_bin_coverage(&labels, by_bucket.len(), None)?;

    let data = labels
        .iter()
        .map(|label| by_bucket.get(label).copied().unwrap_or(0.0))
        .collect();
    Ok(Series { labels, data })
}

/// One row per group, all on the same label sequence. Rows keep the order
/// in which the source first reports each group; ungrouped sums are dropped.
pub fn aggregate_grouped<S: AmountSource + ?Sized>(
    source: &S,
    granularity: Granularity,
    range: &TimeRange,
) -> Result<GroupedSeries> {
    let sums = source.bucket_sums(granularity, range)?;
    let labels = enumerate_bins(granularity, range);

    let mut order: Vec<GroupRef> = Vec::new();
    let mut per_group: HashMap<Uuid, HashMap<String, f64>> = HashMap::new();
    for sum in sums {
        let Some(group) = sum.group else { continue };
        let buckets = per_group.entry(group.id).or_insert_with(|| {
            order.push(group.clone());
            HashMap::new()
        });
        *buckets.entry(sum.bucket).or_insert(0.0) += sum.amount;
    }

    let mut rows = Vec::with_capacity(order.len());
    for group in order {
        let buckets = per_group.remove(&group.id).unwrap_or_default();
        check_bin_coverage(&labels, buckets.len(), Some(&group))?;
        let data = labels
            .iter()
            .map(|label| buckets.get(label).copied().unwrap_or(0.0))
            .collect();
        rows.push(GroupSeries {
            id: group.id,
            name: group.name,
            data,
        });
    }

    Ok(GroupedSeries { labels, rows })
}

/// More buckets with data than enumerated bins means the source summed
/// records outside the requested range or labelled them differently.
fn check_bin_coverage(labels: &[String], buckets_with_data: usize, group: Option<&GroupRef>) -> Result<()> {
    if labels.len() >= buckets_with_data {
        return Ok(());
    }
    let scope = group.map(|g| format!(" for group {}", g.id)).unwrap_or_default();
    let message = format!(
        "bin errors: {} bins but {} buckets with data{}",
        labels.len(),
        buckets_with_data,
        scope
    );
    error!("[aggregate] {}", message);
    Err(LedgerError::ConsistencyAssertion(message))
}
