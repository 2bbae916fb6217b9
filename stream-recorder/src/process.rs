//! External process helpers shared by capture, probe and merge

use std::collections::VecDeque;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

/// How a process ended after `terminate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited before we signalled it
    AlreadyExited(ExitStatus),
    /// It exited within the grace period after SIGTERM
    Graceful(ExitStatus),
    /// It ignored SIGTERM and was killed
    Killed,
}

/// Stop a child process: SIGTERM first, SIGKILL if it is still alive after
/// `grace`. The child is always reaped before this returns `Ok`.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<Termination, ProcessError> {
    if let Some(status) = child.try_wait()? {
        return Ok(Termination::AlreadyExited(status));
    }

    request_shutdown(child)?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(Termination::Graceful(status)),
        Ok(Err(e)) => Err(ProcessError::Io(e)),
        Err(_) => {
            // kill() sends SIGKILL and waits
            child.kill().await?;
            Ok(Termination::Killed)
        }
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // No pid means the child was already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal(e.to_string())),
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) -> Result<(), ProcessError> {
    child.start_kill()?;
    Ok(())
}

/// Keeps the last `limit` bytes a child writes to stderr.
///
/// Draining the pipe continuously also keeps a chatty ffmpeg from blocking
/// on a full pipe buffer.
pub struct StderrTail {
    handle: JoinHandle<Vec<u8>>,
}

impl StderrTail {
    pub fn capture(mut stderr: ChildStderr, limit: usize) -> Self {
        let handle = tokio::spawn(async move {
            let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit);
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        tail.extend(&buf[..n]);
                        let excess = tail.len().saturating_sub(limit);
                        tail.drain(..excess);
                    }
                }
            }
            tail.into_iter().collect()
        });
        Self { handle }
    }

    /// Wait up to `wait` for the pipe to close and return what was captured
    pub async fn finish(mut self, wait: Duration) -> String {
        match tokio::time::timeout(wait, &mut self.handle).await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Ok(Err(_)) => String::new(),
            Err(_) => {
                self.handle.abort();
                String::new()
            }
        }
    }
}

/// Run a command to completion with captured output, killing it if it does
/// not finish within `timeout`
pub async fn run_with_timeout(
    command: &mut Command,
    program: &str,
    timeout: Duration,
) -> Result<Output, ProcessError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(spawn_error(program, e)),
        // Dropping the output future drops the child, which kills it
        Err(_) => Err(ProcessError::TimedOut(timeout)),
    }
}

/// Map a spawn failure, singling out a missing executable
pub fn spawn_error(program: &str, e: std::io::Error) -> ProcessError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProcessError::NotFound(program.to_string())
    } else {
        ProcessError::Io(e)
    }
}

/// Last `max_chars` characters of a tool's stderr, for log lines
pub fn stderr_excerpt(stderr: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{0} not found - is it installed?")]
    NotFound(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to signal process: {0}")]
    Signal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
