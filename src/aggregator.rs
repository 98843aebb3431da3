//! Chart series derived from raw build records.
//!
//! Inputs arrive newest-first (the order `/api/builds` returns); every series
//! produced here is chronological, oldest first. Nothing here invents data:
//! an empty window yields an empty series.

use crate::models::{BuildRecord, BuildStatus, ChartBucket, TrendPoint};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// One bucket per build for the `requested` most recent builds.
pub fn recent_activity(records: &[BuildRecord], requested: usize) -> Vec<ChartBucket> {
    let take = requested.min(records.len());
    records[..take]
        .iter()
        .rev()
        .map(|r| {
            let mut bucket = ChartBucket {
                label: format!("#{}", r.id),
                avg_duration: r.duration_seconds.unwrap_or(0) as f64,
                ..ChartBucket::default()
            };
            count_status(&mut bucket, &r.status);
            bucket
        })
        .collect()
}

#[derive(Default)]
struct DayAccumulator {
    bucket: ChartBucket,
    duration_sum: i64,
    duration_count: u32,
}

/// One bucket per UTC calendar day, keeping the most recent `requested_days`
/// days that have at least one build.
pub fn daily_trend(records: &[BuildRecord], requested_days: usize) -> Vec<ChartBucket> {
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
    for r in records {
        // Builds that never started have no day to land in.
        let Some(started) = r.started_at else {
            continue;
        };
        let acc = days.entry(started.date_naive()).or_default();
        count_status(&mut acc.bucket, &r.status);
        if let Some(d) = r.duration_seconds {
            acc.duration_sum += d;
            acc.duration_count += 1;
        }
    }

    let skip = days.len().saturating_sub(requested_days);
    days.into_iter()
        .skip(skip)
        .map(|(date, acc)| {
            let mut bucket = acc.bucket;
            bucket.label = date.format("%Y-%m-%d").to_string();
            bucket.avg_duration = if acc.duration_count == 0 {
                0.0
            } else {
                acc.duration_sum as f64 / acc.duration_count as f64
            };
            bucket
        })
        .collect()
}

/// Converts backend trend rows into buckets, sorted by date, most recent
/// `requested_days` kept.
pub fn from_trend_points(points: &[TrendPoint], requested_days: usize) -> Vec<ChartBucket> {
    let mut sorted: Vec<&TrendPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.date);
    let skip = sorted.len().saturating_sub(requested_days);
    sorted
        .into_iter()
        .skip(skip)
        .map(|p| ChartBucket {
            label: p.date.format("%Y-%m-%d").to_string(),
            success: p.success_count,
            failed: p.failure_count,
            running: 0,
            avg_duration: p.avg_duration.unwrap_or(0.0),
        })
        .collect()
}

fn count_status(bucket: &mut ChartBucket, status: &BuildStatus) {
    match status {
        BuildStatus::Success => bucket.success += 1,
        BuildStatus::Failed => bucket.failed += 1,
        BuildStatus::Running => bucket.running += 1,
        _ => {}
    }
}
