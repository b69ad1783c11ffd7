//! Deadline-race execution of a single task run.
//!
//! A run races the body against its timeout and the run-scoped cancellation
//! token. Async bodies are dropped when they lose the race; blocking bodies
//! keep their unit until the closure returns, so cancellation there is
//! cooperative only (the body must poll its context).

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task::body::{TaskBody, TaskContext};

/// How a single run ended
pub(crate) enum ExecutionOutcome {
    /// Body returned a value before the deadline
    Completed(serde_json::Value),
    /// Body returned an error or panicked
    Failed(String),
    /// The deadline fired first
    TimedOut,
    /// The run token fired first (cancel, pause or shutdown)
    Interrupted,
}

pub(crate) async fn run_body(
    body: &TaskBody,
    ctx: TaskContext,
    limit: Duration,
    run_token: CancellationToken,
) -> ExecutionOutcome {
    match body {
        TaskBody::Async(factory) => {
            let future = AssertUnwindSafe(factory(ctx)).catch_unwind();
            tokio::select! {
                _ = run_token.cancelled() => ExecutionOutcome::Interrupted,
                raced = tokio::time::timeout(limit, future) => match raced {
                    Ok(Ok(Ok(value))) => ExecutionOutcome::Completed(value),
                    Ok(Ok(Err(error))) => ExecutionOutcome::Failed(format!("{error:#}")),
                    Ok(Err(_panic)) => ExecutionOutcome::Failed("task body panicked".to_string()),
                    Err(_) => ExecutionOutcome::TimedOut,
                },
            }
        }
        TaskBody::Blocking(f) => {
            let f = f.clone();
            let mut unit = tokio::task::spawn_blocking(move || f(ctx));
            tokio::select! {
                _ = run_token.cancelled() => {
                    // The blocking thread keeps running until the closure
                    // observes the token; the slot is reclaimed regardless.
                    debug!("abandoning interrupted blocking unit");
                    ExecutionOutcome::Interrupted
                }
                _ = tokio::time::sleep(limit) => {
                    debug!("abandoning timed-out blocking unit");
                    ExecutionOutcome::TimedOut
                }
                joined = &mut unit => match joined {
                    Ok(Ok(value)) => ExecutionOutcome::Completed(value),
                    Ok(Err(error)) => ExecutionOutcome::Failed(format!("{error:#}")),
                    Err(join_error) => {
                        ExecutionOutcome::Failed(format!("task body panicked: {join_error}"))
                    }
                },
            }
        }
    }
}
