//! Read-side statistics over job records.
//!
//! Averages skip records whose size or duration is unknown; sums count an
//! unknown value as zero.

use crate::store::{current_timestamp_ms, JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Records listed in [`StatisticsReport::top_space_savers`].
pub const TOP_SAVERS: usize = 10;
/// Records listed in [`StatisticsReport::recent_completed`].
pub const RECENT_COMPLETED: usize = 20;

/// Codec bucket for records without a known target codec.
const UNKNOWN_CODEC: &str = "unknown";

/// A record together with its derived size figures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: JobRecord,
    pub compression_ratio: Option<f64>,
    pub space_saved: Option<u64>,
    pub space_saved_percentage: Option<f64>,
}

impl From<JobRecord> for RecordView {
    fn from(record: JobRecord) -> Self {
        Self {
            compression_ratio: record.compression_ratio(),
            space_saved: record.space_saved(),
            space_saved_percentage: record.space_saved_percentage(),
            record,
        }
    }
}

/// Aggregates for one profile or codec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupStats {
    pub completed: usize,
    pub total_original_size: u64,
    pub total_space_saved: u64,
    pub average_compression_ratio: Option<f64>,
}

#[derive(Default)]
struct GroupAccumulator {
    completed: usize,
    original: u64,
    saved: u64,
    ratio: Mean,
}

impl GroupAccumulator {
    fn add(&mut self, record: &JobRecord) {
        self.completed += 1;
        self.original += record.original_size.unwrap_or(0);
        self.saved += record.space_saved().unwrap_or(0);
        self.ratio.push(record.compression_ratio());
    }

    fn finish(self) -> GroupStats {
        GroupStats {
            completed: self.completed,
            total_original_size: self.original,
            total_space_saved: self.saved,
            average_compression_ratio: self.ratio.value(),
        }
    }
}

/// Arithmetic mean over the values that are present.
#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Snapshot of job statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsReport {
    pub generated_at: i64,
    pub total_completed: usize,
    pub total_original_size: u64,
    pub total_final_size: u64,
    pub total_space_saved: u64,
    /// Mean of per-record ratios.
    pub average_compression_ratio: Option<f64>,
    pub average_processing_secs: Option<f64>,
    pub top_space_savers: Vec<RecordView>,
    /// Most recently completed first.
    pub recent_completed: Vec<RecordView>,
    pub by_profile: BTreeMap<String, GroupStats>,
    pub by_codec: BTreeMap<String, GroupStats>,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub queue_depth: usize,
}

impl StatisticsReport {
    pub fn from_records(records: &[JobRecord], queue_depth: usize) -> Self {
        Self::with_limits(records, queue_depth, TOP_SAVERS, RECENT_COMPLETED)
    }

    pub fn with_limits(
        records: &[JobRecord],
        queue_depth: usize,
        top_n: usize,
        recent_n: usize,
    ) -> Self {
        let mut pending = 0;
        let mut running = 0;
        let mut failed = 0;
        let mut completed = Vec::new();

        for record in records {
            match record.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Running => running += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Completed => completed.push(record),
            }
        }

        let mut total_original_size = 0u64;
        let mut total_final_size = 0u64;
        let mut total_space_saved = 0u64;
        let mut ratio = Mean::default();
        let mut duration = Mean::default();
        let mut profiles: BTreeMap<String, GroupAccumulator> = BTreeMap::new();
        let mut codecs: BTreeMap<String, GroupAccumulator> = BTreeMap::new();

        for record in &completed {
            total_original_size += record.original_size.unwrap_or(0);
            total_final_size += record.final_size.unwrap_or(0);
            total_space_saved += record.space_saved().unwrap_or(0);
            ratio.push(record.compression_ratio());
            duration.push(record.processing_secs);

            profiles
                .entry(record.profile_name.clone())
                .or_default()
                .add(record);
            codecs
                .entry(
                    record
                        .video_codec
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_CODEC.to_string()),
                )
                .or_default()
                .add(record);
        }

        let mut savers: Vec<&JobRecord> = completed
            .iter()
            .copied()
            .filter(|r| r.space_saved().map(|s| s > 0).unwrap_or(false))
            .collect();
        savers.sort_by(|a, b| b.space_saved().cmp(&a.space_saved()).then(a.id.cmp(&b.id)));

        let mut recent = completed.clone();
        recent.sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then(b.id.cmp(&a.id))
        });

        Self {
            generated_at: current_timestamp_ms(),
            total_completed: completed.len(),
            total_original_size,
            total_final_size,
            total_space_saved,
            average_compression_ratio: ratio.value(),
            average_processing_secs: duration.value(),
            top_space_savers: savers
                .into_iter()
                .take(top_n)
                .map(|r| RecordView::from(r.clone()))
                .collect(),
            recent_completed: recent
                .into_iter()
                .take(recent_n)
                .map(|r| RecordView::from(r.clone()))
                .collect(),
            by_profile: profiles.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            by_codec: codecs.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            pending,
            running,
            failed,
            queue_depth,
        }
    }
}
