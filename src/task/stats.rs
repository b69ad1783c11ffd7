use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::task::types::{TaskPriority, TaskStatus, TaskType};

/// Monotone counters owned by the coordinator state
#[derive(Debug, Clone, Default)]
pub(crate) struct StatCounters {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub total_execution_time: Duration,
}

impl StatCounters {
    pub fn average_execution_time(&self) -> Duration {
        if self.tasks_completed == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.tasks_completed as u32
        }
    }
}

/// Coordinator statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub queue_size: usize,
    pub running_count: usize,
    pub scheduled_count: usize,
    pub total_tasks: usize,
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
    pub is_running: bool,
}

impl CoordinatorStats {
    /// Fraction of finished runs that completed successfully
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / finished as f64
        }
    }
}

/// Counts of all registered tasks, grouped three ways
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_type: HashMap<TaskType, usize>,
    pub by_priority: HashMap<TaskPriority, usize>,
}

impl TaskSummary {
    pub(crate) fn record(&mut self, status: TaskStatus, task_type: TaskType, priority: TaskPriority) {
        self.total += 1;
        *self.by_status.entry(status).or_default() += 1;
        *self.by_type.entry(task_type).or_default() += 1;
        *self.by_priority.entry(priority).or_default() += 1;
    }
}
