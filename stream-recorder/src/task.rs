//! Bounded shutdown of the background loops

use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

/// Outcome of waiting on a background loop
#[derive(Debug)]
pub(crate) enum Join {
    /// Nothing was running
    Idle,
    Finished,
    Failed(JoinError),
    /// Still running after the timeout; the handle was kept
    TimedOut,
}

/// Wait up to `timeout` for the loop in `slot` to exit.
///
/// The slot is only cleared once the loop has finished. A loop that outlives
/// the timeout stays visible to `is_running`, so a restart cannot run beside it.
pub(crate) async fn join_bounded(slot: &mut Option<JoinHandle<()>>, timeout: Duration) -> Join {
    let Some(task) = slot.as_mut() else {
        return Join::Idle;
    };

    let outcome = match tokio::time::timeout(timeout, task).await {
        Err(_) => return Join::TimedOut,
        Ok(Ok(())) => Join::Finished,
        Ok(Err(e)) => Join::Failed(e),
    };
    *slot = None;
    outcome
}

pub(crate) fn is_running(slot: &Option<JoinHandle<()>>) -> bool {
    slot.as_ref().is_some_and(|t| !t.is_finished())
}
