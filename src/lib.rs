//! # Taskcoord
//!
//! A priority- and dependency-aware task coordination engine: accepts units
//! of work, enforces bounded concurrency, resolves inter-task dependencies,
//! executes blocking and non-blocking bodies under per-task deadlines, and
//! manages the full task lifecycle including deferred activation and
//! retention-bounded cleanup of finished tasks.
//!
//! ## Architecture Overview
//!
//! - **[`task::TaskCoordinator`]**: façade owning the queue, the running and
//!   scheduled sets and the registry; runs the coordinator, scheduler and
//!   cleanup loops
//! - **[`task::TaskSpec`] / [`task::TaskBody`]**: builder for schedulable
//!   units wrapping a blocking closure or an async factory
//! - **[`task::TaskContext`]**: handed to every body for cooperative
//!   cancellation and progress reporting
//! - **[`config::CoordinatorConfig`]**: pool capacity, queue bound, tick
//!   intervals and retention, loadable from TOML
//!
//! ## Lifecycle
//!
//! ```text
//! Pending -> Queued -> Running -> {Completed | Failed | TimedOut | Cancelled}
//!                        |
//!                        v
//!                     Paused -> Queued (resume)
//! ```
//!
//! Dispatch order is priority-then-FIFO among ready tasks; completion order
//! is not guaranteed once tasks run concurrently. Cancellation is always
//! cooperative: a body that has begun executing is signalled, not killed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskcoord::{CoordinatorConfig, TaskBody, TaskCoordinator, TaskPriority, TaskSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
//!     coordinator.start().await;
//!
//!     let body = TaskBody::async_fn(|_ctx| async move { Ok(serde_json::json!("done")) });
//!     let spec = TaskSpec::new("greet", body).with_priority(TaskPriority::High);
//!     let task_id = coordinator.create_task(spec).await;
//!     assert!(coordinator.submit(task_id).await);
//!
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```

/// Coordinator configuration with TOML loading.
pub mod config;

/// Task entity, queue, executor, loops and statistics.
pub mod task;

pub use config::CoordinatorConfig;
pub use task::{
    BodyResult, CoordinatorEvent, CoordinatorEventHandler, CoordinatorStats, DependencyKind,
    ExecutionMode, LoggingEventHandler, Task, TaskBody, TaskContext, TaskCoordinator,
    TaskDependency, TaskError, TaskId, TaskPriority, TaskResult, TaskSnapshot, TaskSpec,
    TaskStatus, TaskSummary, TaskType,
};
