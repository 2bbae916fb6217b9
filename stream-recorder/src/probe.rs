//! Segment inspection via ffprobe
//!
//! Only used to decide whether a segment is safe to merge; nothing read here
//! ends up in the output.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::process::{self, ProcessError};

/// What a probe reports about one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// `codec_type` of every stream, e.g. ["video", "audio"]
    pub stream_types: Vec<String>,
    /// Container duration exactly as reported (ffprobe uses strings, or "N/A")
    pub duration: Option<String>,
}

impl ProbeReport {
    pub fn has_video(&self) -> bool {
        self.stream_types.iter().any(|t| t == "video")
    }
}

/// Inspects segment files before they are merged
#[async_trait]
pub trait SegmentProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError>;
}

/// `SegmentProbe` backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct Ffprobe {
    program: String,
    timeout: Duration,
}

impl Ffprobe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SegmentProbe for Ffprobe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError> {
        let mut command = Command::new(&self.program);
        command
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration:stream=codec_type",
                "-of",
                "json",
            ])
            .arg(path);

        let output = process::run_with_timeout(&mut command, &self.program, self.timeout).await?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status.to_string(),
                stderr: process::stderr_excerpt(&output.stderr, 200),
            });
        }

        parse_probe_output(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<serde_json::Value>,
}

/// Parse `ffprobe -of json` output
pub fn parse_probe_output(stdout: &[u8]) -> Result<ProbeReport, ProbeError> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;

    let stream_types = parsed
        .streams
        .into_iter()
        .map(|s| s.codec_type.unwrap_or_default())
        .collect();

    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| match d {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Ok(ProbeReport {
        stream_types,
        duration,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("ffprobe exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("invalid ffprobe output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_segment() {
        let json = br#"{
            "programs": [],
            "streams": [
                { "codec_type": "video" },
                { "codec_type": "audio" }
            ],
            "format": { "duration": "4.011000" }
        }"#;
        let report = parse_probe_output(json).unwrap();

        assert_eq!(report.stream_types, vec!["video", "audio"]);
        assert!(report.has_video());
        assert_eq!(report.duration.as_deref(), Some("4.011000"));
    }

    #[test]
    fn test_parse_audio_only() {
        let json = br#"{ "streams": [ { "codec_type": "audio" } ], "format": { "duration": "1.0" } }"#;
        let report = parse_probe_output(json).unwrap();
        assert!(!report.has_video());
    }

    #[test]
    fn test_parse_missing_sections() {
        let report = parse_probe_output(b"{}").unwrap();
        assert!(report.stream_types.is_empty());
        assert!(report.duration.is_none());
    }

    #[test]
    fn test_parse_numeric_and_na_duration() {
        let json = br#"{ "streams": [], "format": { "duration": 2.5 } }"#;
        assert_eq!(parse_probe_output(json).unwrap().duration.as_deref(), Some("2.5"));

        let json = br#"{ "streams": [], "format": { "duration": "N/A" } }"#;
        assert_eq!(parse_probe_output(json).unwrap().duration.as_deref(), Some("N/A"));
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            parse_probe_output(b"moov atom not found"),
            Err(ProbeError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_ffprobe() {
        let probe = Ffprobe::new("/nonexistent/ffprobe", Duration::from_secs(1));
        let result = probe.probe(Path::new("/tmp/20251108_162700.mp4")).await;
        assert!(matches!(
            result,
            Err(ProbeError::Process(ProcessError::NotFound(_)))
        ));
    }
}
