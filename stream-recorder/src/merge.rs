//! Lossless concatenation via ffmpeg's concat demuxer

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::process::{self, ProcessError};

/// Joins an ordered list of same-format segments into one file
#[async_trait]
pub trait SegmentMerger: Send + Sync {
    /// Concatenate `inputs`, in the given order, into `output` without
    /// re-encoding. On error `output` may hold partial data; the caller
    /// removes it.
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// `SegmentMerger` backed by `ffmpeg -f concat -c copy`
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    program: String,
    file_format: String,
    timeout: Duration,
    settle_delay: Duration,
}

impl FfmpegConcat {
    pub fn new(
        program: impl Into<String>,
        file_format: impl Into<String>,
        timeout: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            file_format: file_format.into(),
            timeout,
            settle_delay,
        }
    }
}

#[async_trait]
impl SegmentMerger for FfmpegConcat {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }

        let list_content = concat_list(inputs);

        // Removed when `list` drops
        let mut list = tempfile::Builder::new()
            .prefix("concat-")
            .suffix(".txt")
            .tempfile()?;
        list.write_all(list_content.as_bytes())?;
        list.flush()?;
        list.as_file().sync_all()?;

        tracing::debug!(list = %list.path().display(), content = %list_content, "wrote concat list");

        // Give the filesystem a moment before ffmpeg opens the list
        tokio::time::sleep(self.settle_delay).await;

        let mut command = Command::new(&self.program);
        command
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-protocol_whitelist",
                "file,concat",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
            ])
            .arg(list.path())
            .args(["-c", "copy", "-f", self.file_format.as_str(), "-y"])
            .arg(output);

        let result = process::run_with_timeout(&mut command, &self.program, self.timeout).await?;

        if !result.status.success() {
            return Err(MergeError::Failed {
                status: result.status.to_string(),
                stderr: process::stderr_excerpt(&result.stderr, 2000),
                list: list_content,
            });
        }

        Ok(())
    }
}

/// Build concat demuxer input, one `file '<abs path>'` line per segment
pub fn concat_list(inputs: &[PathBuf]) -> String {
    let mut content = String::new();
    for input in inputs {
        let absolute = std::fs::canonicalize(input).unwrap_or_else(|_| input.clone());
        // Inside single quotes a quote is written as '\''
        let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
        content.push_str(&format!("file '{}'\n", escaped));
    }
    content
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no segments to merge")]
    NoInputs,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed {
        status: String,
        stderr: String,
        list: String,
    },
}
