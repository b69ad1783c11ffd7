//! Bounded, dependency-aware priority queue.
//!
//! Entries are kept sorted by descending priority with FIFO order among
//! equals (stable insertion, not a heap; queue sizes are bounded so the
//! linear scans stay cheap).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::task::types::{Task, TaskId, TaskPriority, TaskStatus, lock_task};

pub(crate) struct QueueEntry {
    pub task: Arc<Mutex<Task>>,
    pub id: TaskId,
    pub priority: TaskPriority,
    pub enqueued: Instant,
}

pub(crate) struct TaskQueue {
    max_size: usize,
    entries: Vec<QueueEntry>,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Vec::new(),
        }
    }

    /// Insert a task in priority position, marking it `Queued`. Fails at
    /// capacity with the queue untouched.
    pub fn enqueue(&mut self, task: Arc<Mutex<Task>>) -> bool {
        if self.entries.len() >= self.max_size {
            let id = lock_task(&task).id;
            warn!(
                "task queue is full ({}), rejecting task {}",
                self.max_size, id
            );
            return false;
        }

        let (id, priority) = {
            let mut t = lock_task(&task);
            t.transition(TaskStatus::Queued);
            (t.id, t.priority)
        };

        let entry = QueueEntry {
            task,
            id,
            priority,
            enqueued: Instant::now(),
        };

        // First strictly-lower-priority entry; equal priorities stay FIFO.
        match self.entries.iter().position(|e| entry.priority > e.priority) {
            Some(index) => self.entries.insert(index, entry),
            None => self.entries.push(entry),
        }

        debug!("task {} queued (priority {:?})", id, priority);
        true
    }

    /// Remove and return the first entry whose dependencies are satisfied
    pub fn take_ready(&mut self, completed: &HashSet<TaskId>) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| lock_task(&entry.task).is_ready(completed))?;
        Some(self.entries.remove(index))
    }

    /// Remove entries whose dependency wait deadline has passed, returning
    /// each with the offending dependency id and its limit
    pub fn expire_dependencies(
        &mut self,
        completed: &HashSet<TaskId>,
    ) -> Vec<(QueueEntry, TaskId, Duration)> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let overdue = {
                let entry = &self.entries[index];
                let waited = entry.enqueued.elapsed();
                let task = lock_task(&entry.task);
                task.dependencies.iter().find_map(|dep| match dep.timeout {
                    Some(limit) if waited > limit && !dep.is_satisfied(completed) => {
                        Some((dep.task_id, limit))
                    }
                    _ => None,
                })
            };
            match overdue {
                Some((dependency, limit)) => {
                    expired.push((self.entries.remove(index), dependency, limit));
                }
                None => index += 1,
            }
        }
        expired
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        match self.entries.iter().position(|e| e.id == task_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    #[allow(dead_code)]
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Arc<Mutex<Task>>> {
        self.entries
            .iter()
            .filter(|entry| lock_task(&entry.task).status == status)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    #[allow(dead_code)]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
