use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::task::body::{ProgressObserver, TaskBody};

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Grouping tag describing what kind of work a task wraps
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    VoiceCommand,
    OfficeAutomation,
    WebSearch,
    SystemOperation,
    FileOperation,
    Scheduled,
    Background,
    UserInteraction,
}

/// Task priority levels with numeric values for ordering
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl TaskPriority {
    /// Get numeric value for comparisons and export
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// How a task is routed at submission time.
///
/// `Scheduled` tasks go to the deferred set and enter the queue once their
/// activation time passes; every other mode goes straight to the queue. The
/// dispatch path (awaited future vs dedicated blocking unit) is selected by
/// the [`TaskBody`] variant, not by this tag.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
    Background,
    Scheduled,
}

/// Task execution status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Terminal states have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::TimedOut
        )
    }
}

/// Errors recorded against a task's terminal state
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The work body returned an error or panicked
    #[error("execution failed: {message}")]
    ExecutionFailed { message: String },

    /// The deadline race was lost
    #[error("timed out after {limit:?}")]
    TimedOut { limit: Duration },

    /// Cancellation was requested while the task was live
    #[error("cancelled")]
    Cancelled,

    /// A dependency stayed unsatisfied past its wait deadline
    #[error("dependency {dependency} unsatisfied after {limit:?}")]
    DependencyTimeout { dependency: TaskId, limit: Duration },
}

/// Outcome of a finished task run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<TaskError>,
    pub execution_time: Duration,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(data: serde_json::Value, execution_time: Duration) -> Self {
        Self {
            success: true,
            data,
            error: None,
            execution_time,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(error: TaskError, execution_time: Duration) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error),
            execution_time,
            finished_at: Utc::now(),
        }
    }
}

/// Classification of a dependency edge; satisfaction is always "referenced
/// task completed", optionally narrowed by a predicate
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Completion,
    Data,
    Condition,
}

/// A dependency on another task
#[derive(Clone)]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub kind: DependencyKind,
    pub predicate: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    pub timeout: Option<Duration>,
}

impl TaskDependency {
    /// Dependency satisfied once the referenced task completes
    pub fn on_completion(task_id: TaskId) -> Self {
        Self {
            task_id,
            kind: DependencyKind::Completion,
            predicate: None,
            timeout: None,
        }
    }

    /// Require an additional condition to hold at readiness-check time
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.kind = DependencyKind::Condition;
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Bound how long the dependent may wait in the queue for this edge
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_satisfied(&self, completed: &HashSet<TaskId>) -> bool {
        if !completed.contains(&self.task_id) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(),
            None => true,
        }
    }
}

impl From<TaskId> for TaskDependency {
    fn from(task_id: TaskId) -> Self {
        Self::on_completion(task_id)
    }
}

impl fmt::Debug for TaskDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDependency")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Individual task representation: identity, routing metadata and mutable
/// execution state. Owned by the coordinator registry; callers observe it
/// through [`TaskSnapshot`].
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub execution_mode: ExecutionMode,
    pub timeout: Duration,
    pub max_retries: u32,
    pub dependencies: Vec<TaskDependency>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,

    // Execution state
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub progress: f64,
    pub progress_message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,

    pub(crate) body: TaskBody,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) on_progress: Option<ProgressObserver>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, default_timeout: Duration, default_retries: u32) -> Self {
        let id = Uuid::new_v4();
        let name = if spec.name.is_empty() {
            format!("task-{}", &id.to_string()[..8])
        } else {
            spec.name
        };
        let now = Utc::now();
        Self {
            id,
            name,
            task_type: spec.task_type,
            priority: spec.priority,
            execution_mode: spec.execution_mode,
            timeout: spec.timeout.unwrap_or(default_timeout),
            max_retries: spec.max_retries.unwrap_or(default_retries),
            dependencies: spec.dependencies,
            metadata: spec.metadata,
            scheduled_at: spec.scheduled_at,
            status: TaskStatus::Pending,
            result: None,
            progress: 0.0,
            progress_message: String::new(),
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_updated: now,
            body: spec.body,
            cancel_token: CancellationToken::new(),
            on_progress: spec.on_progress,
        }
    }

    /// Move to the next status, stamping `last_updated`. Terminal states are
    /// sticky: a transition out of one is ignored.
    pub(crate) fn transition(&mut self, next: TaskStatus) {
        if self.status.is_terminal() {
            tracing::debug!(
                "ignoring transition {:?} -> {:?} for task {}",
                self.status,
                next,
                self.id
            );
            return;
        }
        self.status = next;
        self.last_updated = Utc::now();
    }

    /// Update task progress. Clamps to [0, 1] and notifies the observer;
    /// never fails.
    pub fn update_progress(&mut self, progress: f64, message: impl Into<String>) {
        let (observer, id, clamped) = self.apply_progress(progress, message);
        if let Some(observer) = observer {
            observer(id, clamped, &self.progress_message);
        }
    }

    /// Record progress fields and return what is needed to notify the
    /// observer after any surrounding lock is released.
    pub(crate) fn apply_progress(
        &mut self,
        progress: f64,
        message: impl Into<String>,
    ) -> (Option<ProgressObserver>, TaskId, f64) {
        self.progress = progress.clamp(0.0, 1.0);
        self.progress_message = message.into();
        self.last_updated = Utc::now();
        (self.on_progress.clone(), self.id, self.progress)
    }

    /// Request cooperative cancellation. Idempotent; a terminal task keeps
    /// its status, a live one becomes `Cancelled` immediately. Side effects
    /// of a body that has already begun are not guaranteed suppressed.
    pub fn cancel(&mut self) {
        self.cancel_token.cancel();
        if !self.status.is_terminal() {
            self.status = TaskStatus::Cancelled;
            self.completed_at = Some(Utc::now());
            self.result = Some(TaskResult::failure(TaskError::Cancelled, Duration::ZERO));
            self.last_updated = Utc::now();
        }
    }

    /// True iff every dependency is satisfied against the completed-id set.
    /// Pure, no side effects.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| dep.is_satisfied(completed))
    }

    /// Wall-clock execution time, available once started and completed
    pub fn execution_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => (completed - started).to_std().ok(),
            _ => None,
        }
    }

    /// Immutable, serializable view of the task for observers and export
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            task_type: self.task_type,
            priority: self.priority,
            execution_mode: self.execution_mode,
            status: self.status,
            progress: self.progress,
            progress_message: self.progress_message.clone(),
            dependencies: self.dependencies.iter().map(|d| d.task_id).collect(),
            metadata: self.metadata.clone(),
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            execution_time: self.execution_time(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            result: self.result.clone(),
        }
    }
}

/// Point-in-time view of a task, safe to hand outside the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub execution_mode: ExecutionMode,
    pub status: TaskStatus,
    pub progress: f64,
    pub progress_message: String,
    pub dependencies: Vec<TaskId>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<TaskResult>,
}

/// Specification for creating a new task. Pure construction; nothing is
/// registered or scheduled until handed to the coordinator.
pub struct TaskSpec {
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub execution_mode: ExecutionMode,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub dependencies: Vec<TaskDependency>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub(crate) body: TaskBody,
    pub(crate) on_progress: Option<ProgressObserver>,
}

impl TaskSpec {
    /// Create a new spec with defaults (user-interaction type, normal
    /// priority, synchronous routing)
    pub fn new(name: impl Into<String>, body: TaskBody) -> Self {
        Self {
            name: name.into(),
            task_type: TaskType::UserInteraction,
            priority: TaskPriority::Normal,
            execution_mode: ExecutionMode::Synchronous,
            timeout: None,
            max_retries: None,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            scheduled_at: None,
            body,
            on_progress: None,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<TaskDependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Defer activation until the given instant; implies scheduled routing
    pub fn scheduled_for(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(when);
        self.execution_mode = ExecutionMode::Scheduled;
        self
    }

    pub fn with_progress_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(TaskId, f64, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(observer));
        self
    }
}

/// Lock a shared task record, recovering the guard if a panicking observer
/// poisoned it
pub(crate) fn lock_task(task: &Mutex<Task>) -> MutexGuard<'_, Task> {
    match task.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
