//! Continuous RTSP recording library
//!
//! Records camera streams to disk with ffmpeg and keeps the archive tidy.
//!
//! # Features
//! - One supervised ffmpeg capture per stream, stream-copied into short
//!   wall-clock named segments (`segments/20251108_162705.mp4`)
//! - Relaunch on crash, on stalled output, and before the camera's RTSP
//!   session limit
//! - Per-minute merge of validated segments without re-encoding
//!   (`merged/20251108_1627.mp4`), published by atomic rename
//! - Retention cleanup of old merged files and superseded segments
//!
//! Components never talk to each other directly. The directory layout in
//! [`segments`] is the only contract between them.
//!
//! # Example
//! ```ignore
//! use stream_recorder::{Config, Manager};
//!
//! let config = Config::load("config.toml".as_ref())?;
//! let mut manager = Manager::new(&config)?;
//! manager.start();
//!
//! tokio::signal::ctrl_c().await?;
//! manager.stop().await;
//! ```

pub mod aggregator;
pub mod cleanup;
pub mod config;
pub mod manager;
pub mod merge;
pub mod probe;
pub mod process;
pub mod recorder;
pub mod segments;
mod task;

pub use aggregator::{
    AggregationReport, AggregatorError, AggregatorOptions, BucketOutcome, Rejection,
    SegmentAggregator,
};
pub use cleanup::{format_bytes, CleanerOptions, CleanupReport, DiskError, DiskUsage, RetentionCleaner};
pub use config::{Config, ConfigError, StreamConfig};
pub use manager::Manager;
pub use merge::{FfmpegConcat, MergeError, SegmentMerger};
pub use probe::{Ffprobe, ProbeError, ProbeReport, SegmentProbe};
pub use recorder::{RecorderError, RecordingSupervisor, SupervisorOptions, SupervisorState};

/// Version reported by `<program> -version`, or `None` if the tool cannot
/// be run. `ffprobe version 6.1.1-3ubuntu5 Copyright ...` yields
/// `6.1.1-3ubuntu5`.
pub fn tool_version(program: &str) -> Option<String> {
    let output = std::process::Command::new(program)
        .arg("-version")
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }
    version_from_banner(&String::from_utf8_lossy(&output.stdout))
}

/// Token after `version` on the banner's first line, else the whole line
fn version_from_banner(banner: &str) -> Option<String> {
    let line = banner.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    let mut words = line.split_whitespace();
    let version = words
        .position(|w| w == "version")
        .and_then(|_| words.next())
        .unwrap_or(line);
    Some(version.to_string())
}
