pub mod body;
pub mod coordinator;
pub mod execution;
pub mod queue;
pub mod stats;
pub mod types;


pub use body::{BodyResult, ProgressObserver, TaskBody, TaskContext};
pub use coordinator::{
    CoordinatorEvent, CoordinatorEventHandler, LoggingEventHandler, TaskCoordinator,
};
pub use stats::{CoordinatorStats, TaskSummary};
pub use types::{
    DependencyKind, ExecutionMode, Task, TaskDependency, TaskError, TaskId, TaskPriority,
    TaskResult, TaskSnapshot, TaskSpec, TaskStatus, TaskType,
};
