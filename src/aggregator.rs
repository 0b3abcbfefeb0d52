//! Bounded in-memory store for per-sample session metrics.
//!
//! Two tiers:
//!
//! | Tier | Bound | Contents |
//! |---|---|---|
//! | full resolution | `max_full_resolution_points` | raw [`DataPoint`]s, FIFO |
//! | downsampled | `max_downsampled_points` | [`DownsampledBucket`]s, oldest first |
//!
//! Points evicted from the full-resolution window are staged in a pending
//! bucket.  Once `downsample_bucket_size` points have gathered there they are
//! folded into one [`DownsampledBucket`].  When the downsampled tier is full
//! its two oldest buckets are merged, so older history gets coarser instead of
//! disappearing.
//!
//! Every point ever added is accounted for in exactly one place:
//!
//! ```text
//! Σ bucket.point_count + pending + window + discarded == total_points_processed
//! ```
//!
//! `discarded` only grows when `auto_downsample` is off.

use std::collections::VecDeque;
use std::mem::size_of;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

// ── Data ──────────────────────────────────────────────────────────────────────

/// One derived-metric sample, as produced by upstream signal processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Host wall clock, ms since Unix epoch.
    pub timestamp_ms: u64,
    /// Target-band (theta) power in µV².
    pub theta_power: f64,
    /// Theta power relative to the calibration baseline.
    pub z_score: f64,
    /// 0–100.
    pub signal_quality: f64,
    pub is_artifact: bool,
}

/// Average, minimum and maximum of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricStats {
    /// Statistics of `values`; all zero when there are none.
    fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            n += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if n == 0 {
            return Self::default();
        }
        Self {
            avg: sum / n as f64,
            min,
            max,
        }
    }

    /// Combine two summaries weighted by their point counts.
    fn merge(a: &Self, a_count: u64, b: &Self, b_count: u64) -> Self {
        let total = a_count.saturating_add(b_count);
        if total == 0 {
            return Self::default();
        }
        let total = total as f64;
        Self {
            avg: (a.avg * a_count as f64 + b.avg * b_count as f64) / total,
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }
}

/// A fold of consecutive full-resolution points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampledBucket {
    pub start_ms: u64,
    pub end_ms: u64,
    pub point_count: u64,
    pub theta_power: MetricStats,
    pub z_score: MetricStats,
    pub signal_quality: MetricStats,
    pub artifact_count: u64,
    /// `artifact_count / point_count × 100`.
    pub artifact_percentage: f64,
}

impl DownsampledBucket {
    fn from_points(points: &[DataPoint]) -> Option<Self> {
        let first = points.first()?;
        let last = points.last()?;
        let artifact_count = points.iter().filter(|p| p.is_artifact).count() as u64;
        let point_count = points.len() as u64;
        Some(Self {
            start_ms: first.timestamp_ms,
            end_ms: last.timestamp_ms,
            point_count,
            theta_power: MetricStats::of(points.iter().map(|p| p.theta_power)),
            z_score: MetricStats::of(points.iter().map(|p| p.z_score)),
            signal_quality: MetricStats::of(points.iter().map(|p| p.signal_quality)),
            artifact_count,
            artifact_percentage: artifact_count as f64 / point_count as f64 * 100.0,
        })
    }

    /// Merge `self` (older) with `newer` into one bucket spanning both.
    fn merge(&self, newer: &Self) -> Self {
        let (a, b) = (self.point_count, newer.point_count);
        let point_count = a.saturating_add(b);
        let artifact_count = self.artifact_count.saturating_add(newer.artifact_count);
        Self {
            start_ms: self.start_ms,
            end_ms: newer.end_ms,
            point_count,
            theta_power: MetricStats::merge(&self.theta_power, a, &newer.theta_power, b),
            z_score: MetricStats::merge(&self.z_score, a, &newer.z_score, b),
            signal_quality: MetricStats::merge(&self.signal_quality, a, &newer.signal_quality, b),
            artifact_count,
            artifact_percentage: if point_count == 0 {
                0.0
            } else {
                artifact_count as f64 / point_count as f64 * 100.0
            },
        }
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

/// Memory bounds for [`BoundedAggregator`].
///
/// The defaults keep one hour of 1 Hz metrics at full resolution and about
/// ten more hours downsampled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub max_full_resolution_points: usize,
    pub max_downsampled_points: usize,
    /// Points folded into one bucket.
    pub downsample_bucket_size: usize,
    /// When `false`, evicted points are dropped instead of downsampled.
    pub auto_downsample: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_full_resolution_points: 3600,
            max_downsampled_points: 1000,
            downsample_bucket_size: 10,
            auto_downsample: true,
        }
    }
}

impl AggregatorConfig {
    /// Zero sizes would make the bounds meaningless; raise them to 1.
    fn clamped(mut self) -> Self {
        self.max_full_resolution_points = self.max_full_resolution_points.max(1);
        self.max_downsampled_points = self.max_downsampled_points.max(1);
        self.downsample_bucket_size = self.downsample_bucket_size.max(1);
        self
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Statistics over the retained full-resolution window.  Every numeric field
/// is zero for an empty window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub point_count: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub duration_ms: u64,
    pub theta_power: MetricStats,
    pub z_score: MetricStats,
    pub signal_quality: MetricStats,
    pub artifact_count: usize,
    pub artifact_percentage: f64,
    /// Every point ever added, including evicted ones.
    pub total_points_processed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub full_resolution_points: usize,
    pub pending_points: usize,
    pub downsampled_buckets: usize,
    pub total_points_processed: u64,
    pub discarded_points: u64,
    /// Approximate heap bytes held by the three tiers.
    pub estimated_bytes: usize,
}

/// Everything needed to rebuild an aggregator in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    pub config: AggregatorConfig,
    pub full_resolution: Vec<DataPoint>,
    pub pending: Vec<DataPoint>,
    pub downsampled: Vec<DownsampledBucket>,
    pub total_points_processed: u64,
    pub discarded_points: u64,
}

// ── BoundedAggregator ─────────────────────────────────────────────────────────

pub struct BoundedAggregator {
    config: AggregatorConfig,
    window: VecDeque<DataPoint>,
    pending: Vec<DataPoint>,
    buckets: VecDeque<DownsampledBucket>,
    total_points_processed: u64,
    discarded_points: u64,
}

impl Default for BoundedAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl BoundedAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let config = config.clamped();
        Self {
            window: VecDeque::with_capacity(config.max_full_resolution_points.min(4096)),
            pending: Vec::with_capacity(config.downsample_bucket_size),
            buckets: VecDeque::new(),
            total_points_processed: 0,
            discarded_points: 0,
            config,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    pub fn add_data_point(&mut self, point: DataPoint) {
        self.window.push_back(point);
        self.total_points_processed += 1;
        while self.window.len() > self.config.max_full_resolution_points {
            let Some(evicted) = self.window.pop_front() else {
                break;
            };
            if self.config.auto_downsample {
                self.pending.push(evicted);
                if self.pending.len() >= self.config.downsample_bucket_size {
                    self.fold_pending();
                }
            } else {
                self.discarded_points += 1;
            }
        }
    }

    pub fn add_data_points(&mut self, points: impl IntoIterator<Item = DataPoint>) {
        for p in points {
            self.add_data_point(p);
        }
    }

    fn fold_pending(&mut self) {
        let Some(bucket) = DownsampledBucket::from_points(&self.pending) else {
            return;
        };
        self.pending.clear();
        debug!(
            "aggregator: folded {} points [{}..{}]",
            bucket.point_count, bucket.start_ms, bucket.end_ms
        );
        self.buckets.push_back(bucket);
        while self.buckets.len() > self.config.max_downsampled_points {
            match (self.buckets.pop_front(), self.buckets.pop_front()) {
                (Some(oldest), Some(next)) => self.buckets.push_front(oldest.merge(&next)),
                (Some(only), None) => {
                    self.buckets.push_front(only);
                    break;
                }
                _ => break,
            }
        }
    }

    /// Fold a partially filled pending bucket now.  Call at session end so
    /// the tail is not left unsummarised.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.fold_pending();
        }
    }

    /// Drop all data and counters.  The config is kept.
    pub fn clear(&mut self) {
        self.window.clear();
        self.pending.clear();
        self.buckets.clear();
        self.total_points_processed = 0;
        self.discarded_points = 0;
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// The last `n` full-resolution points, oldest first.
    pub fn get_recent_data(&self, n: usize) -> Vec<DataPoint> {
        let skip = self.window.len().saturating_sub(n);
        self.window.iter().skip(skip).copied().collect()
    }

    /// Full-resolution points with `start_ms <= timestamp <= end_ms`.  The
    /// downsampled tier is never searched.
    pub fn get_data_for_time_range(&self, start_ms: u64, end_ms: u64) -> Vec<DataPoint> {
        self.window
            .iter()
            .filter(|p| (start_ms..=end_ms).contains(&p.timestamp_ms))
            .copied()
            .collect()
    }

    pub fn get_full_resolution_data(&self) -> Vec<DataPoint> {
        self.window.iter().copied().collect()
    }

    pub fn get_downsampled_data(&self) -> Vec<DownsampledBucket> {
        self.buckets.iter().cloned().collect()
    }

    pub fn get_session_summary(&self) -> SessionSummary {
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return SessionSummary {
                total_points_processed: self.total_points_processed,
                ..SessionSummary::default()
            };
        };
        let artifact_count = self.window.iter().filter(|p| p.is_artifact).count();
        SessionSummary {
            point_count: self.window.len(),
            start_ms: first.timestamp_ms,
            end_ms: last.timestamp_ms,
            duration_ms: last.timestamp_ms.saturating_sub(first.timestamp_ms),
            theta_power: MetricStats::of(self.window.iter().map(|p| p.theta_power)),
            z_score: MetricStats::of(self.window.iter().map(|p| p.z_score)),
            signal_quality: MetricStats::of(self.window.iter().map(|p| p.signal_quality)),
            artifact_count,
            artifact_percentage: artifact_count as f64 / self.window.len() as f64 * 100.0,
            total_points_processed: self.total_points_processed,
        }
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        MemoryStats {
            full_resolution_points: self.window.len(),
            pending_points: self.pending.len(),
            downsampled_buckets: self.buckets.len(),
            total_points_processed: self.total_points_processed,
            discarded_points: self.discarded_points,
            estimated_bytes: (self.window.len() + self.pending.len()) * size_of::<DataPoint>()
                + self.buckets.len() * size_of::<DownsampledBucket>(),
        }
    }

    // ── Checkpoint ────────────────────────────────────────────────────────────

    pub fn export_data(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            config: self.config.clone(),
            full_resolution: self.get_full_resolution_data(),
            pending: self.pending.clone(),
            downsampled: self.get_downsampled_data(),
            total_points_processed: self.total_points_processed,
            discarded_points: self.discarded_points,
        }
    }

    /// Replace the whole state (config included) with `snapshot`.
    ///
    /// The snapshot is checked against its own bounds and the point-count
    /// identity first; on error the aggregator is left untouched.
    pub fn import_data(&mut self, snapshot: AggregatorSnapshot) -> Result<(), SnapshotError> {
        let config = snapshot.config.clone().clamped();
        if snapshot.full_resolution.len() > config.max_full_resolution_points {
            return Err(SnapshotError::Inconsistent(format!(
                "{} full-resolution points exceed the bound of {}",
                snapshot.full_resolution.len(),
                config.max_full_resolution_points
            )));
        }
        if snapshot.pending.len() >= config.downsample_bucket_size {
            return Err(SnapshotError::Inconsistent(format!(
                "{} pending points should already have been folded (bucket size {})",
                snapshot.pending.len(),
                config.downsample_bucket_size
            )));
        }
        if snapshot.downsampled.len() > config.max_downsampled_points {
            return Err(SnapshotError::Inconsistent(format!(
                "{} buckets exceed the bound of {}",
                snapshot.downsampled.len(),
                config.max_downsampled_points
            )));
        }
        check_time_order(&snapshot)?;
        let accounted = snapshot
            .downsampled
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(b.point_count))
            .and_then(|n| n.checked_add(snapshot.pending.len() as u64))
            .and_then(|n| n.checked_add(snapshot.full_resolution.len() as u64))
            .and_then(|n| n.checked_add(snapshot.discarded_points))
            .ok_or_else(|| {
                SnapshotError::Inconsistent("point counts overflow u64".to_owned())
            })?;
        if accounted != snapshot.total_points_processed {
            return Err(SnapshotError::Inconsistent(format!(
                "{accounted} points accounted for, total says {}",
                snapshot.total_points_processed
            )));
        }

        self.config = config;
        self.window = snapshot.full_resolution.into();
        self.pending = snapshot.pending;
        self.buckets = snapshot.downsampled.into();
        self.total_points_processed = snapshot.total_points_processed;
        self.discarded_points = snapshot.discarded_points;
        info!(
            "aggregator: restored checkpoint with {} points processed",
            self.total_points_processed
        );
        Ok(())
    }

    pub fn export_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(&self.export_data())?)
    }

    pub fn import_json(&mut self, json: &str) -> Result<(), SnapshotError> {
        let snapshot: AggregatorSnapshot = serde_json::from_str(json)?;
        self.import_data(snapshot)
    }
}

/// Buckets must be non-empty and span forward in time, and the three tiers
/// must follow each other without going back in time.
fn check_time_order(snapshot: &AggregatorSnapshot) -> Result<(), SnapshotError> {
    for (i, b) in snapshot.downsampled.iter().enumerate() {
        if b.point_count == 0 {
            return Err(SnapshotError::Inconsistent(format!("bucket {i} is empty")));
        }
        if b.artifact_count > b.point_count {
            return Err(SnapshotError::Inconsistent(format!(
                "bucket {i} has {} artifacts in {} points",
                b.artifact_count, b.point_count
            )));
        }
        if b.start_ms > b.end_ms {
            return Err(SnapshotError::Inconsistent(format!(
                "bucket {i} ends at {} before it starts at {}",
                b.end_ms, b.start_ms
            )));
        }
    }
    let mut last = 0u64;
    let bucket_edges = snapshot
        .downsampled
        .iter()
        .flat_map(|b| [b.start_ms, b.end_ms]);
    let point_times = snapshot
        .pending
        .iter()
        .chain(&snapshot.full_resolution)
        .map(|p| p.timestamp_ms);
    for t in bucket_edges.chain(point_times) {
        if t < last {
            return Err(SnapshotError::Inconsistent(format!(
                "timestamp {t} follows {last}"
            )));
        }
        last = t;
    }
    Ok(())
}
