//! On-disk layout and naming
//!
//! The filesystem is the only channel between the recorder, the aggregator
//! and the cleaner:
//!
//! ```text
//! <output_dir>/segments/<YYYYMMDD_HHMMSS>.<ext>   # written by ffmpeg
//! <output_dir>/merged/<YYYYMMDD_HHMM>.<ext>       # one per closed minute
//! ```
//!
//! Everything here is a pure function of directory contents, so each
//! component can restart without losing shared state.

use chrono::{Duration, NaiveDateTime, Timelike};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const SEGMENTS_DIR: &str = "segments";
pub const MERGED_DIR: &str = "merged";

/// strftime pattern for capture segment names
pub const SEGMENT_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
/// strftime pattern for merged file names
pub const BUCKET_KEY_FORMAT: &str = "%Y%m%d_%H%M";

pub fn segments_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(SEGMENTS_DIR)
}

pub fn merged_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(MERGED_DIR)
}

/// Output pattern handed to ffmpeg's segment muxer with `-strftime 1`
pub fn capture_pattern(segments_dir: &Path, file_format: &str) -> PathBuf {
    segments_dir.join(format!("{}.{}", SEGMENT_STAMP_FORMAT, file_format))
}

/// Parse "20251108_162705.mp4" to its wall-clock timestamp
pub fn parse_segment_timestamp(file_name: &str) -> Option<NaiveDateTime> {
    let (stem, _ext) = file_name.rsplit_once('.')?;
    // chrono accepts shorter numeric fields, the on-disk name is fixed width
    if stem.len() != 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(stem, SEGMENT_STAMP_FORMAT).ok()
}

/// Minute a segment belongs to, displayed as `YYYYMMDD_HHMM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(NaiveDateTime);

impl BucketKey {
    /// Truncate a timestamp to its minute
    pub fn from_timestamp(timestamp: NaiveDateTime) -> Self {
        let minute = timestamp
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(timestamp);
        Self(minute)
    }

    /// Parse a key from a merged file stem like "20251108_1627"
    pub fn parse(stem: &str) -> Option<Self> {
        if stem.len() != 13 {
            return None;
        }
        // Minute-only strings are not a full datetime for chrono, pin seconds
        NaiveDateTime::parse_from_str(&format!("{}00", stem), SEGMENT_STAMP_FORMAT)
            .ok()
            .map(Self)
    }

    /// Parse a key from a merged file name like "20251108_1627.mp4"
    pub fn from_merged_name(file_name: &str) -> Option<Self> {
        let (stem, _ext) = file_name.rsplit_once('.')?;
        Self::parse(stem)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.0
    }

    /// Last second a segment of this minute can be stamped with (HH:MM:59)
    pub fn last_second(&self) -> NaiveDateTime {
        self.0 + Duration::seconds(59)
    }

    /// A minute is closed once its last second lies before `cutoff`.
    /// Since `cutoff` only moves forward, a closed bucket stays closed.
    pub fn is_closed(&self, cutoff: NaiveDateTime) -> bool {
        self.last_second() < cutoff
    }

    pub fn merged_file_name(&self, file_format: &str) -> String {
        format!("{}.{}", self, file_format)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(BUCKET_KEY_FORMAT))
    }
}

/// A capture segment found on disk
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl SegmentFile {
    pub fn bucket(&self) -> BucketKey {
        BucketKey::from_timestamp(self.timestamp)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A merged minute file found on disk
#[derive(Debug, Clone)]
pub struct MergedFile {
    pub path: PathBuf,
    pub key: BucketKey,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Segments of one minute, in filename (== chronological) order
#[derive(Debug, Clone)]
pub struct TimeBucket {
    pub key: BucketKey,
    pub segments: Vec<SegmentFile>,
}

/// List all segments with the given extension in `dir`.
///
/// Files with the right extension but a name that is not a timestamp are
/// logged and skipped; anything else (temp files, other formats) is skipped
/// silently.
pub fn scan_segments(dir: &Path, file_format: &str) -> Result<Vec<SegmentFile>, SegmentError> {
    let mut segments = Vec::new();

    for (path, file_name, metadata) in list_files(dir, file_format)? {
        let Some(timestamp) = parse_segment_timestamp(&file_name) else {
            tracing::warn!(file = %path.display(), "cannot parse time from segment name, ignoring");
            continue;
        };
        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "cannot read modification time");
                continue;
            }
        };
        segments.push(SegmentFile {
            path,
            timestamp,
            size_bytes: metadata.len(),
            modified,
        });
    }

    segments.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(segments)
}

/// List all merged minute files with the given extension in `dir`
pub fn scan_merged(dir: &Path, file_format: &str) -> Result<Vec<MergedFile>, SegmentError> {
    let mut merged = Vec::new();

    for (path, file_name, metadata) in list_files(dir, file_format)? {
        let Some(key) = BucketKey::from_merged_name(&file_name) else {
            tracing::warn!(file = %path.display(), "cannot parse minute from merged name, ignoring");
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        merged.push(MergedFile {
            path,
            key,
            size_bytes: metadata.len(),
            modified,
        });
    }

    merged.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(merged)
}

/// Group segments into minute buckets. Buckets come out in chronological
/// order and each bucket's segments are sorted by file name.
pub fn group_by_minute(segments: Vec<SegmentFile>) -> Vec<TimeBucket> {
    let mut groups: BTreeMap<BucketKey, Vec<SegmentFile>> = BTreeMap::new();
    for segment in segments {
        groups.entry(segment.bucket()).or_default().push(segment);
    }

    groups
        .into_iter()
        .map(|(key, mut segments)| {
            segments.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
            TimeBucket { key, segments }
        })
        .collect()
}

/// Most recent modification time among segment files in `dir`.
/// Returns `None` if the directory is missing or holds no segments.
pub fn newest_segment_mtime(dir: &Path, file_format: &str) -> Option<SystemTime> {
    let files = list_files(dir, file_format).ok()?;
    files
        .iter()
        .filter_map(|(_, _, metadata)| metadata.modified().ok())
        .max()
}

fn list_files(
    dir: &Path,
    file_format: &str,
) -> Result<Vec<(PathBuf, String, std::fs::Metadata)>, SegmentError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SegmentError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let matches_format = path
            .extension()
            .map(|ext| ext == file_format)
            .unwrap_or(false);
        if !matches_format {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        files.push((path, file_name, metadata));
    }
    Ok(files)
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("Failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
