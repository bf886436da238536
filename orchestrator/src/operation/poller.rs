//! Remote task polling
//!
//! Drives one remote task to a terminal state, mapping its `[0, 1]` progress
//! into a window of the owning operation's percentage.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::OperationContext;
use crate::constants::polling::{MAX_CONSECUTIVE_POLL_FAILURES, TASK_POLL_INTERVAL, TASK_TIMEOUT};
use crate::errors::OperationError;
use crate::session::{RemoteSession, TaskRef, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Upper bound on a single task, measured from the first poll
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: TASK_POLL_INTERVAL,
            timeout: TASK_TIMEOUT,
        }
    }
}

/// `floor(start + (finish - start) * remote)`, with `remote` clamped to `[0, 1]`
pub fn map_progress(start: u8, finish: u8, remote: f64) -> u8 {
    let remote = if remote.is_nan() { 0.0 } else { remote.clamp(0.0, 1.0) };
    let span = f64::from(finish) - f64::from(start);
    let mapped = (f64::from(start) + span * remote).floor();
    mapped.clamp(0.0, 100.0) as u8
}

pub(crate) async fn poll_to_completion(
    ctx: &OperationContext<'_>,
    task: &TaskRef,
    start: u8,
    finish: u8,
    suppress_failures: bool,
) -> Result<Option<String>, OperationError> {
    poll_task(ctx, task, start, finish, suppress_failures, true).await
}

/// Poll until the task is terminal. With `honor_cancel` unset the loop keeps
/// going after the operation was cancelled, for restore steps.
pub(crate) async fn poll_task(
    ctx: &OperationContext<'_>,
    task: &TaskRef,
    start: u8,
    finish: u8,
    suppress_failures: bool,
    honor_cancel: bool,
) -> Result<Option<String>, OperationError> {
    let session = ctx.connection()?.session().clone();
    let settings = ctx.settings();
    let started = Instant::now();
    let mut consecutive_failures = 0u32;

    loop {
        if honor_cancel && ctx.is_cancel_requested() {
            info!("Cancelling remote task {} after cancellation request", task);
            if let Err(e) = session.cancel_task(task).await {
                warn!("Failed to cancel remote task {}: {}", task, e);
            }
            destroy(&session, task).await;
            return Err(OperationError::Cancelled);
        }

        match session.task_record(task).await {
            Ok(record) => {
                consecutive_failures = 0;
                ctx.set_percent(map_progress(start, finish, record.progress));

                match record.status {
                    TaskStatus::Success => {
                        destroy(&session, task).await;
                        ctx.set_percent(finish);
                        if let Some(result) = &record.result {
                            ctx.set_result(result.clone());
                        }
                        return Ok(record.result);
                    }
                    TaskStatus::Failure => {
                        destroy(&session, task).await;
                        let message = record
                            .error_info
                            .first()
                            .cloned()
                            .unwrap_or_else(|| "Remote task failed".to_string());
                        if suppress_failures {
                            info!("Ignoring failure of task {}: {}", task, message);
                            return Ok(None);
                        }
                        return Err(OperationError::RemoteTaskFailure {
                            message,
                            details: record.error_info,
                        });
                    }
                    TaskStatus::Cancelled => {
                        destroy(&session, task).await;
                        return Err(OperationError::Cancelled);
                    }
                    TaskStatus::Pending | TaskStatus::Cancelling => {}
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    "Failed to query task {} ({}/{}): {}",
                    task, consecutive_failures, MAX_CONSECUTIVE_POLL_FAILURES, e
                );
                if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    return Err(e.into());
                }
            }
        }

        if started.elapsed() >= settings.timeout {
            warn!(
                "Task {} still running after {}s, giving up",
                task,
                settings.timeout.as_secs()
            );
            return Err(OperationError::Timeout {
                task: task.to_string(),
                waited: settings.timeout,
            });
        }

        if honor_cancel {
            ctx.wait(settings.interval).await;
        } else {
            tokio::time::sleep(settings.interval).await;
        }
    }
}

async fn destroy(session: &Arc<dyn RemoteSession>, task: &TaskRef) {
    match session.destroy_task(task).await {
        Ok(()) => debug!("Destroyed task {}", task),
        Err(e) => warn!("Failed to destroy task {}: {}", task, e),
    }
}
