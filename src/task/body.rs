//! Work-body contract handed to the executor.
//!
//! A body is either a blocking closure run on a dedicated unit
//! (`tokio::task::spawn_blocking`) or an async factory awaited on the
//! runtime. Both receive a [`TaskContext`] for cooperative cancellation and
//! progress reporting, and both are re-invokable so retry and resume can run
//! them again.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::task::types::{Task, TaskId, lock_task};

/// What a work body produces: an opaque payload or an error. Errors are
/// captured at the dispatch boundary, never propagated to the loops.
pub type BodyResult = anyhow::Result<serde_json::Value>;

/// Observer invoked on every progress update: (task id, fraction, message)
pub type ProgressObserver = Arc<dyn Fn(TaskId, f64, &str) + Send + Sync>;

/// The callable a task wraps
#[derive(Clone)]
pub enum TaskBody {
    /// Runs on a dedicated blocking unit until return or deadline
    Blocking(Arc<dyn Fn(TaskContext) -> BodyResult + Send + Sync>),
    /// Awaited under the deadline; dropped on timeout or cancellation
    Async(Arc<dyn Fn(TaskContext) -> BoxFuture<'static, BodyResult> + Send + Sync>),
}

impl TaskBody {
    /// Wrap a blocking closure
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskContext) -> BodyResult + Send + Sync + 'static,
    {
        TaskBody::Blocking(Arc::new(f))
    }

    /// Wrap an async closure
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BodyResult> + Send + 'static,
    {
        TaskBody::Async(Arc::new(move |ctx| -> BoxFuture<'static, BodyResult> {
            Box::pin(f(ctx))
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, TaskBody::Async(_))
    }
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskBody::Blocking(_) => f.write_str("TaskBody::Blocking"),
            TaskBody::Async(_) => f.write_str("TaskBody::Async"),
        }
    }
}

/// Execution context handed to a work body for one run
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    cancel: CancellationToken,
    progress: ProgressHandle,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, cancel: CancellationToken, progress: ProgressHandle) -> Self {
        Self {
            task_id,
            cancel,
            progress,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Poll-style cancellation check for blocking bodies
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await-style cancellation signal for async bodies
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Report progress in [0, 1] with a short message. Thread-safe, never
    /// fails.
    pub fn update_progress(&self, progress: f64, message: &str) {
        self.progress.update(progress, message);
    }
}

/// Thread-safe progress reporter bound to one task record
#[derive(Clone)]
pub(crate) struct ProgressHandle {
    task: Arc<Mutex<Task>>,
}

impl ProgressHandle {
    pub(crate) fn new(task: Arc<Mutex<Task>>) -> Self {
        Self { task }
    }

    pub(crate) fn update(&self, progress: f64, message: &str) {
        // The observer runs outside the task lock so it may safely call back
        // into coordinator accessors.
        let (observer, id, clamped) = {
            let mut task = lock_task(&self.task);
            task.apply_progress(progress, message)
        };
        if let Some(observer) = observer {
            observer(id, clamped, message);
        }
    }
}
