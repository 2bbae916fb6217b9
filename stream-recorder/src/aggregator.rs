//! Minute aggregation of capture segments
//!
//! Each cycle scans `segments/`, groups files by minute, and merges every
//! closed minute into `merged/<YYYYMMDD_HHMM>.<ext>`. A merged file is
//! written to a temp path and renamed into place, so its presence always
//! means the minute is fully represented and its segments may go.

use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::merge::SegmentMerger;
use crate::probe::{ProbeError, ProbeReport, SegmentProbe};
use crate::process::ProcessError;
use crate::segments::{self, BucketKey, SegmentError, SegmentFile, TimeBucket};
use crate::task::{self, Join};

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub file_format: String,
    pub merge_interval: Duration,
    /// Minimum age before a segment or minute is considered complete
    pub merge_delay: Duration,
    /// Segments smaller than this are rejected without probing
    pub min_segment_bytes: u64,
    pub join_timeout: Duration,
}

impl AggregatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            file_format: config.recording.file_format.clone(),
            merge_interval: Duration::from_secs(config.aggregator.merge_interval),
            merge_delay: Duration::from_secs(config.aggregator.merge_delay),
            min_segment_bytes: config.aggregator.min_segment_bytes,
            join_timeout: Duration::from_secs(config.aggregator.join_timeout),
        }
    }
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a segment was left out of a merge
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("file no longer exists")]
    Missing,
    #[error("cannot read file: {0}")]
    Unreadable(String),
    #[error("too small ({size} bytes, minimum {min})")]
    TooSmall { size: u64, min: u64 },
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("probe timed out")]
    ProbeTimedOut,
    #[error("no streams")]
    NoStreams,
    #[error("no video stream")]
    NoVideoStream,
    #[error("no duration")]
    MissingDuration,
    #[error("non-positive duration {0}")]
    NonPositiveDuration(String),
    #[error("unparsable duration {0:?}")]
    UnparsableDuration(String),
}

/// Decide whether probed metadata describes a usable segment
pub fn check_report(report: &ProbeReport) -> Result<(), Rejection> {
    if report.stream_types.is_empty() {
        return Err(Rejection::NoStreams);
    }
    if !report.has_video() {
        return Err(Rejection::NoVideoStream);
    }

    let raw = report.duration.as_deref().ok_or(Rejection::MissingDuration)?;
    let duration: f64 = raw
        .trim()
        .parse()
        .map_err(|_| Rejection::UnparsableDuration(raw.to_string()))?;
    if !duration.is_finite() {
        return Err(Rejection::UnparsableDuration(raw.to_string()));
    }
    if duration <= 0.0 {
        return Err(Rejection::NonPositiveDuration(raw.to_string()));
    }
    Ok(())
}

/// What happened to one minute bucket in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    /// Survivors merged and deleted
    Merged { merged: usize, rejected: usize },
    /// A merged file already existed; leftover segments deleted
    Recovered { deleted: usize },
    /// Minute may still receive segments
    Open,
    /// Every segment failed validation
    Abandoned { rejected: usize },
    /// Merge failed, all segments kept
    Failed,
}

/// Per-cycle totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub buckets_merged: usize,
    pub buckets_recovered: usize,
    pub buckets_open: usize,
    pub buckets_abandoned: usize,
    pub buckets_failed: usize,
    pub segments_deleted: usize,
    pub segments_rejected: usize,
}

impl AggregationReport {
    fn record(&mut self, outcome: &BucketOutcome) {
        match outcome {
            BucketOutcome::Merged { rejected, .. } => {
                self.buckets_merged += 1;
                self.segments_rejected += rejected;
            }
            BucketOutcome::Recovered { .. } => self.buckets_recovered += 1,
            BucketOutcome::Open => self.buckets_open += 1,
            BucketOutcome::Abandoned { rejected } => {
                self.buckets_abandoned += 1;
                self.segments_rejected += rejected;
            }
            BucketOutcome::Failed => self.buckets_failed += 1,
        }
    }

    /// True if the cycle touched nothing
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Merges one stream's segments into per-minute files
pub struct SegmentAggregator {
    worker: Arc<Worker>,
    join_timeout: Duration,
    merge_interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SegmentAggregator {
    /// Create an aggregator; makes sure `merged_dir` exists
    pub fn new(
        name: impl Into<String>,
        segments_dir: impl Into<PathBuf>,
        merged_dir: impl Into<PathBuf>,
        options: AggregatorOptions,
        probe: Arc<dyn SegmentProbe>,
        merger: Arc<dyn SegmentMerger>,
    ) -> Result<Self, AggregatorError> {
        let merged_dir = merged_dir.into();
        std::fs::create_dir_all(&merged_dir).map_err(|source| AggregatorError::CreateDir {
            path: merged_dir.clone(),
            source,
        })?;

        Ok(Self {
            join_timeout: options.join_timeout,
            merge_interval: options.merge_interval,
            worker: Arc::new(Worker {
                name: name.into(),
                segments_dir: segments_dir.into(),
                merged_dir,
                options,
                probe,
                merger,
            }),
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.worker.name
    }

    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!(stream = %self.worker.name, "aggregator already running");
            return;
        }

        self.cancel = CancellationToken::new();
        let worker = Arc::clone(&self.worker);
        let cancel = self.cancel.clone();
        let interval = self.merge_interval;

        self.task = Some(tokio::spawn(async move {
            tracing::info!(stream = %worker.name, ?interval, "aggregator loop started");
            loop {
                if let Err(e) = worker.run_cycle_at(Local::now()).await {
                    tracing::error!(stream = %worker.name, error = %e, "aggregation cycle failed");
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!(stream = %worker.name, "aggregator loop exited");
        }));
        tracing::info!(stream = %self.worker.name, "aggregator started");
    }

    /// Cancel the loop and wait for the current cycle to finish, up to the
    /// join timeout. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        match task::join_bounded(&mut self.task, self.join_timeout).await {
            Join::Idle => {}
            Join::Finished => tracing::info!(stream = %self.worker.name, "aggregator stopped"),
            Join::Failed(e) => {
                tracing::error!(stream = %self.worker.name, error = %e, "aggregator task failed")
            }
            Join::TimedOut => tracing::warn!(
                stream = %self.worker.name,
                timeout = ?self.join_timeout,
                "aggregator did not stop in time, cycle still running"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        task::is_running(&self.task)
    }

    /// Run one aggregation cycle against the current time
    pub async fn run_cycle(&self) -> Result<AggregationReport, AggregatorError> {
        self.worker.run_cycle_at(Local::now()).await
    }

    /// Run one aggregation cycle as if the wall clock read `now`
    pub async fn run_cycle_at(&self, now: DateTime<Local>) -> Result<AggregationReport, AggregatorError> {
        self.worker.run_cycle_at(now).await
    }
}

impl Drop for SegmentAggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    name: String,
    segments_dir: PathBuf,
    merged_dir: PathBuf,
    options: AggregatorOptions,
    probe: Arc<dyn SegmentProbe>,
    merger: Arc<dyn SegmentMerger>,
}

impl Worker {
    async fn run_cycle_at(&self, now: DateTime<Local>) -> Result<AggregationReport, AggregatorError> {
        let mut report = AggregationReport::default();

        if !self.segments_dir.is_dir() {
            tracing::debug!(stream = %self.name, dir = %self.segments_dir.display(), "no segments directory yet");
            return Ok(report);
        }

        let merge_delay = chrono::Duration::from_std(self.options.merge_delay)
            .map_err(|_| AggregatorError::InvalidDelay(self.options.merge_delay))?;
        let naive_cutoff = now.naive_local() - merge_delay;
        let mtime_cutoff: SystemTime = (now - merge_delay).into();

        let (settled, writing): (Vec<SegmentFile>, Vec<SegmentFile>) =
            segments::scan_segments(&self.segments_dir, &self.options.file_format)?
                .into_iter()
                .partition(|s| s.modified < mtime_cutoff);

        if settled.is_empty() {
            return Ok(report);
        }

        // A segment started late in its minute can still be growing after the
        // minute closes. Its minute waits for it, or the merge would miss it
        // and the recovery path would delete it unmerged.
        let held: HashSet<BucketKey> = writing.iter().map(SegmentFile::bucket).collect();

        for bucket in segments::group_by_minute(settled) {
            let outcome = if !bucket.key.is_closed(naive_cutoff) {
                BucketOutcome::Open
            } else if held.contains(&bucket.key) {
                tracing::debug!(stream = %self.name, bucket = %bucket.key, "minute closed but a segment is still being written");
                BucketOutcome::Open
            } else {
                self.process_bucket(&bucket, &mut report).await
            };
            report.record(&outcome);
        }

        if !report.is_idle() {
            tracing::info!(
                stream = %self.name,
                merged = report.buckets_merged,
                recovered = report.buckets_recovered,
                abandoned = report.buckets_abandoned,
                failed = report.buckets_failed,
                deleted = report.segments_deleted,
                rejected = report.segments_rejected,
                "aggregation cycle complete"
            );
        }
        Ok(report)
    }

    async fn process_bucket(&self, bucket: &TimeBucket, report: &mut AggregationReport) -> BucketOutcome {
        let final_path = self
            .merged_dir
            .join(bucket.key.merged_file_name(&self.options.file_format));

        if final_path.exists() {
            tracing::info!(
                stream = %self.name,
                bucket = %bucket.key,
                segments = bucket.segments.len(),
                "minute already merged, removing leftover segments"
            );
            let deleted = self.delete_segments(bucket.segments.iter().map(|s| s.path.as_path())).await;
            report.segments_deleted += deleted;
            return BucketOutcome::Recovered { deleted };
        }

        let mut survivors = Vec::with_capacity(bucket.segments.len());
        for segment in &bucket.segments {
            match self.validate(segment).await {
                Ok(()) => survivors.push(segment.path.clone()),
                Err(rejection) => tracing::warn!(
                    stream = %self.name,
                    file = %segment.file_name(),
                    reason = %rejection,
                    "skipping invalid segment"
                ),
            }
        }
        let rejected = bucket.segments.len() - survivors.len();

        if survivors.is_empty() {
            tracing::warn!(
                stream = %self.name,
                bucket = %bucket.key,
                rejected,
                "no valid segments in minute, will retry"
            );
            return BucketOutcome::Abandoned { rejected };
        }

        if rejected > 0 {
            tracing::info!(
                stream = %self.name,
                bucket = %bucket.key,
                valid = survivors.len(),
                rejected,
                "merging valid segments only"
            );
        }

        match self.merge(&bucket.key, &survivors, &final_path).await {
            Ok(()) => {
                tracing::info!(
                    stream = %self.name,
                    bucket = %bucket.key,
                    segments = survivors.len(),
                    output = %final_path.display(),
                    "merged minute"
                );
                let deleted = self.delete_segments(survivors.iter().map(PathBuf::as_path)).await;
                report.segments_deleted += deleted;
                BucketOutcome::Merged {
                    merged: survivors.len(),
                    rejected,
                }
            }
            Err(e) => {
                tracing::error!(
                    stream = %self.name,
                    bucket = %bucket.key,
                    error = %e,
                    "merge failed, keeping segments"
                );
                if let AggregatorError::Merge(crate::merge::MergeError::Failed { list, .. }) = &e {
                    tracing::debug!(stream = %self.name, bucket = %bucket.key, list = %list, "concat list");
                }
                BucketOutcome::Failed
            }
        }
    }

    async fn validate(&self, segment: &SegmentFile) -> Result<(), Rejection> {
        let metadata = match tokio::fs::metadata(&segment.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Rejection::Missing),
            Err(e) => return Err(Rejection::Unreadable(e.to_string())),
        };

        if metadata.len() < self.options.min_segment_bytes {
            return Err(Rejection::TooSmall {
                size: metadata.len(),
                min: self.options.min_segment_bytes,
            });
        }

        let report = match self.probe.probe(&segment.path).await {
            Ok(report) => report,
            Err(ProbeError::Process(ProcessError::TimedOut(_))) => return Err(Rejection::ProbeTimedOut),
            Err(e) => return Err(Rejection::ProbeFailed(e.to_string())),
        };

        check_report(&report)
    }

    /// Merge into `<final>.tmp`, then rename into place
    async fn merge(&self, key: &BucketKey, inputs: &[PathBuf], final_path: &Path) -> Result<(), AggregatorError> {
        let tmp_path = self.merged_dir.join(format!(
            "{}.tmp",
            key.merged_file_name(&self.options.file_format)
        ));
        remove_if_exists(&tmp_path).await;

        if let Err(e) = self.merger.merge(inputs, &tmp_path).await {
            remove_if_exists(&tmp_path).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, final_path).await {
            remove_if_exists(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_segments<'a>(&self, paths: impl Iterator<Item = &'a Path>) -> usize {
        let mut deleted = 0;
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    stream = %self.name,
                    file = %path.display(),
                    error = %e,
                    "failed to delete segment"
                ),
            }
        }
        deleted
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(file = %path.display(), "removed temp output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to remove temp output"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Segments(#[from] SegmentError),
    #[error("merge delay out of range: {0:?}")]
    InvalidDelay(Duration),
    #[error(transparent)]
    Merge(#[from] crate::merge::MergeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
