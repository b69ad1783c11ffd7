//! Central task coordination: submission, dispatch, deferred activation and
//! retention cleanup.
//!
//! One coordinator-owned state value holds the queue, the running and
//! scheduled sets and the completed-id set; every mutation happens under its
//! lock (or through the registry's own sharded map). Work bodies run on
//! their own tokio tasks and report back through `finalize_run`, so the
//! loops never block on a body.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::task::body::{ProgressHandle, TaskContext};
use crate::task::execution::{ExecutionOutcome, run_body};
use crate::task::queue::{QueueEntry, TaskQueue};
use crate::task::stats::{CoordinatorStats, StatCounters, TaskSummary};
use crate::task::types::{
    ExecutionMode, Task, TaskError, TaskId, TaskResult, TaskSnapshot, TaskSpec, TaskStatus,
    TaskType, lock_task,
};

/// Events emitted on task lifecycle transitions
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    TaskCreated { task_id: TaskId },
    TaskQueued { task_id: TaskId },
    TaskScheduled { task_id: TaskId },
    TaskStarted { task_id: TaskId },
    TaskRetried { task_id: TaskId, attempt: u32 },
    TaskCompleted { task_id: TaskId, result: TaskResult },
    TaskFailed { task_id: TaskId, error: TaskError },
    TaskTimedOut { task_id: TaskId },
    TaskCancelled { task_id: TaskId },
    TaskPaused { task_id: TaskId },
    TaskResumed { task_id: TaskId },
}

/// Handler for coordinator events. Errors are logged and swallowed; a bad
/// handler never disturbs scheduling.
pub trait CoordinatorEventHandler {
    fn handle_event(&self, event: &CoordinatorEvent) -> Result<()>;
}

/// Event handler that logs every event
pub struct LoggingEventHandler;

impl CoordinatorEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::TaskCreated { task_id } => info!("task created: {}", task_id),
            CoordinatorEvent::TaskQueued { task_id } => info!("task queued: {}", task_id),
            CoordinatorEvent::TaskScheduled { task_id } => info!("task scheduled: {}", task_id),
            CoordinatorEvent::TaskStarted { task_id } => info!("task started: {}", task_id),
            CoordinatorEvent::TaskRetried { task_id, attempt } => {
                warn!("task retried: {} (attempt {})", task_id, attempt)
            }
            CoordinatorEvent::TaskCompleted { task_id, .. } => {
                info!("task completed: {}", task_id)
            }
            CoordinatorEvent::TaskFailed { task_id, error } => {
                warn!("task failed: {} - {}", task_id, error)
            }
            CoordinatorEvent::TaskTimedOut { task_id } => warn!("task timed out: {}", task_id),
            CoordinatorEvent::TaskCancelled { task_id } => info!("task cancelled: {}", task_id),
            CoordinatorEvent::TaskPaused { task_id } => info!("task paused: {}", task_id),
            CoordinatorEvent::TaskResumed { task_id } => info!("task resumed: {}", task_id),
        }
        Ok(())
    }
}

/// A dispatched task occupying one pool slot
struct RunningTask {
    task: Arc<Mutex<Task>>,
    run_token: CancellationToken,
    worker: JoinHandle<()>,
}

/// Coordinator-owned shared collections; every mutation happens under one
/// lock
struct CoordinatorState {
    queue: TaskQueue,
    running: HashMap<TaskId, RunningTask>,
    scheduled: HashMap<TaskId, Arc<Mutex<Task>>>,
    completed_ids: HashSet<TaskId>,
    stats: StatCounters,
}

struct Lifecycle {
    running: bool,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

pub(crate) struct CoordinatorInner {
    config: CoordinatorConfig,
    registry: DashMap<TaskId, Arc<Mutex<Task>>>,
    state: RwLock<CoordinatorState>,
    handlers: StdRwLock<Vec<Arc<dyn CoordinatorEventHandler + Send + Sync>>>,
    live: AtomicBool,
}

/// Main task coordination and management system
pub struct TaskCoordinator {
    inner: Arc<CoordinatorInner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl TaskCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let queue = TaskQueue::new(config.max_queue_size);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                registry: DashMap::new(),
                state: RwLock::new(CoordinatorState {
                    queue,
                    running: HashMap::new(),
                    scheduled: HashMap::new(),
                    completed_ids: HashSet::new(),
                    stats: StatCounters::default(),
                }),
                handlers: StdRwLock::new(Vec::new()),
                live: AtomicBool::new(false),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                running: false,
                shutdown: CancellationToken::new(),
                loops: Vec::new(),
            }),
        }
    }

    /// Start the coordinator, scheduler and cleanup loops
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            warn!("task coordinator is already running");
            return;
        }

        let shutdown = CancellationToken::new();
        lifecycle.shutdown = shutdown.clone();
        lifecycle.loops = vec![
            tokio::spawn(CoordinatorInner::coordinator_loop(
                self.inner.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(CoordinatorInner::scheduler_loop(
                self.inner.clone(),
                shutdown.clone(),
            )),
        ];
        if self.inner.config.cleanup_enabled {
            lifecycle.loops.push(tokio::spawn(CoordinatorInner::cleanup_loop(
                self.inner.clone(),
                shutdown,
            )));
        }

        lifecycle.running = true;
        self.inner.live.store(true, Ordering::SeqCst);
        info!("task coordinator started");
    }

    /// Stop the coordinator: cancels all running tasks and joins every loop
    /// before returning
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return;
        }
        info!("stopping task coordinator");
        self.inner.live.store(false, Ordering::SeqCst);

        let mut events = Vec::new();
        let workers: Vec<(TaskId, JoinHandle<()>)> = {
            let mut st = self.inner.state.write().await;
            let state = &mut *st;
            let mut workers = Vec::new();
            for (id, running) in state.running.drain() {
                let transitioned = {
                    let mut task = lock_task(&running.task);
                    let already_terminal = task.status.is_terminal();
                    task.cancel();
                    !already_terminal
                };
                if transitioned {
                    state.stats.tasks_cancelled += 1;
                    events.push(CoordinatorEvent::TaskCancelled { task_id: id });
                }
                running.run_token.cancel();
                workers.push((id, running.worker));
            }
            workers
        };

        lifecycle.shutdown.cancel();
        for handle in lifecycle.loops.drain(..) {
            if let Err(join_error) = handle.await {
                error!("loop join error: {join_error}");
            }
        }
        for (id, worker) in workers {
            if let Err(join_error) = worker.await {
                error!("worker join error for task {id}: {join_error}");
            }
        }

        lifecycle.running = false;
        self.inner.emit(&events);
        info!("task coordinator stopped");
    }

    /// Create and register a new task from its spec. No scheduling happens
    /// until [`submit`](Self::submit).
    pub async fn create_task(&self, spec: TaskSpec) -> TaskId {
        let task = Task::from_spec(
            spec,
            self.inner.config.default_timeout(),
            self.inner.config.default_max_retries,
        );
        let task_id = task.id;
        let name = task.name.clone();
        self.inner
            .registry
            .insert(task_id, Arc::new(Mutex::new(task)));
        {
            let mut st = self.inner.state.write().await;
            st.stats.tasks_created += 1;
        }
        info!("task created: {} ({})", name, task_id);
        self.inner
            .emit(&[CoordinatorEvent::TaskCreated { task_id }]);
        task_id
    }

    /// Submit a registered task for execution. Returns false when the
    /// coordinator is not running, the id is unknown, the task was already
    /// submitted, or the queue is full.
    pub async fn submit(&self, task_id: TaskId) -> bool {
        if !self.inner.live.load(Ordering::SeqCst) {
            error!("task coordinator is not running");
            return false;
        }
        let Some(task) = self.inner.task_ref(task_id) else {
            warn!("submit for unknown task {}", task_id);
            return false;
        };

        let mut event = None;
        let accepted = {
            let mut st = self.inner.state.write().await;
            let state = &mut *st;
            let pending = {
                let task = lock_task(&task);
                if task.status == TaskStatus::Pending {
                    Some((task.execution_mode, task.name.clone()))
                } else {
                    warn!(
                        "task {} already submitted (status {:?})",
                        task_id, task.status
                    );
                    None
                }
            };
            match pending {
                None => false,
                Some((ExecutionMode::Scheduled, name)) => {
                    state.scheduled.insert(task_id, task.clone());
                    info!("task scheduled: {} ({})", name, task_id);
                    event = Some(CoordinatorEvent::TaskScheduled { task_id });
                    true
                }
                Some((_, name)) => {
                    let accepted = state.queue.enqueue(task.clone());
                    if accepted {
                        info!("task queued: {} ({})", name, task_id);
                        event = Some(CoordinatorEvent::TaskQueued { task_id });
                    }
                    accepted
                }
            }
        };
        if let Some(event) = event {
            self.inner.emit(&[event]);
        }
        accepted
    }

    /// Cancel a task wherever it currently lives. Returns true if the id is
    /// known; an already-terminal task is left untouched.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let Some(task) = self.inner.task_ref(task_id) else {
            return false;
        };
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.write().await;
            let state = &mut *st;
            state.queue.remove(task_id);
            state.scheduled.remove(&task_id);
            if let Some(running) = state.running.remove(&task_id) {
                running.run_token.cancel();
            }
            let mut task = lock_task(&task);
            let already_terminal = task.status.is_terminal();
            task.cancel();
            if !already_terminal {
                state.stats.tasks_cancelled += 1;
                info!("task cancelled: {} ({})", task.name, task_id);
                events.push(CoordinatorEvent::TaskCancelled { task_id });
            }
        }
        self.inner.emit(&events);
        true
    }

    /// Pause a running task. The in-flight run is signalled to stop; the
    /// body re-runs from the start on resume.
    pub async fn pause(&self, task_id: TaskId) -> bool {
        let Some(task) = self.inner.task_ref(task_id) else {
            return false;
        };
        let paused = {
            let mut st = self.inner.state.write().await;
            match st.running.remove(&task_id) {
                Some(running) => {
                    {
                        let mut task = lock_task(&task);
                        task.transition(TaskStatus::Paused);
                    }
                    running.run_token.cancel();
                    true
                }
                None => false,
            }
        };
        if paused {
            info!("task paused: {}", task_id);
            self.inner.emit(&[CoordinatorEvent::TaskPaused { task_id }]);
        }
        paused
    }

    /// Re-queue a paused task
    pub async fn resume(&self, task_id: TaskId) -> bool {
        let Some(task) = self.inner.task_ref(task_id) else {
            return false;
        };
        let resumed = {
            let mut st = self.inner.state.write().await;
            let is_paused = lock_task(&task).status == TaskStatus::Paused;
            is_paused && st.queue.enqueue(task.clone())
        };
        if resumed {
            info!("task resumed: {}", task_id);
            self.inner.emit(&[CoordinatorEvent::TaskResumed { task_id }]);
        }
        resumed
    }

    /// Get a snapshot of a task by id
    pub fn get_task(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.inner
            .registry
            .get(&task_id)
            .map(|entry| lock_task(entry.value()).snapshot())
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<TaskSnapshot> {
        self.inner
            .registry
            .iter()
            .filter_map(|entry| {
                let task = lock_task(entry.value());
                (task.status == status).then(|| task.snapshot())
            })
            .collect()
    }

    pub fn tasks_by_type(&self, task_type: TaskType) -> Vec<TaskSnapshot> {
        self.inner
            .registry
            .iter()
            .filter_map(|entry| {
                let task = lock_task(entry.value());
                (task.task_type == task_type).then(|| task.snapshot())
            })
            .collect()
    }

    /// Export snapshots of all registered tasks, optionally skipping
    /// terminal ones
    pub fn export_tasks(&self, include_terminal: bool) -> Vec<TaskSnapshot> {
        self.inner
            .registry
            .iter()
            .filter_map(|entry| {
                let task = lock_task(entry.value());
                (include_terminal || !task.status.is_terminal()).then(|| task.snapshot())
            })
            .collect()
    }

    /// Counts of all registered tasks by status, type and priority
    pub fn task_summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for entry in self.inner.registry.iter() {
            let task = lock_task(entry.value());
            summary.record(task.status, task.task_type, task.priority);
        }
        summary
    }

    /// Coordinator statistics snapshot
    pub async fn statistics(&self) -> CoordinatorStats {
        let st = self.inner.state.read().await;
        CoordinatorStats {
            queue_size: st.queue.len(),
            running_count: st.running.len(),
            scheduled_count: st.scheduled.len(),
            total_tasks: self.inner.registry.len(),
            tasks_created: st.stats.tasks_created,
            tasks_completed: st.stats.tasks_completed,
            tasks_failed: st.stats.tasks_failed,
            tasks_cancelled: st.stats.tasks_cancelled,
            total_execution_time: st.stats.total_execution_time,
            average_execution_time: st.stats.average_execution_time(),
            is_running: self.inner.live.load(Ordering::SeqCst),
        }
    }

    /// Drop every terminal task from the registry immediately, returning
    /// how many were removed
    pub async fn clear_terminal_tasks(&self) -> usize {
        let mut st = self.inner.state.write().await;
        let terminal: Vec<TaskId> = self
            .inner
            .registry
            .iter()
            .filter(|entry| lock_task(entry.value()).status.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        for id in &terminal {
            self.inner.registry.remove(id);
            st.completed_ids.remove(id);
        }
        info!("cleared {} finished tasks", terminal.len());
        terminal.len()
    }

    /// Register an event handler. Handlers run inline on lifecycle
    /// transitions; keep them fast.
    pub fn add_event_handler(&self, handler: Arc<dyn CoordinatorEventHandler + Send + Sync>) {
        let mut handlers = match self.inner.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push(handler);
    }

    pub fn is_running(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl CoordinatorInner {
    fn task_ref(&self, task_id: TaskId) -> Option<Arc<Mutex<Task>>> {
        self.registry.get(&task_id).map(|entry| entry.value().clone())
    }

    fn emit(&self, events: &[CoordinatorEvent]) {
        if events.is_empty() {
            return;
        }
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for event in events {
            for handler in handlers.iter() {
                if let Err(error) = handler.handle_event(event) {
                    error!("event handler error: {error:#}");
                }
            }
        }
    }

    async fn coordinator_loop(inner: Arc<Self>, shutdown: CancellationToken) {
        info!("coordinator loop started");
        let tick = inner.config.coordinator_tick();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if let Err(error) = inner.dispatch_tick().await {
                        error!("coordinator tick error: {error:#}");
                    }
                }
            }
        }
        info!("coordinator loop stopped");
    }

    async fn scheduler_loop(inner: Arc<Self>, shutdown: CancellationToken) {
        info!("scheduler loop started");
        let tick = inner.config.scheduler_tick();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if let Err(error) = inner.scheduler_tick().await {
                        error!("scheduler tick error: {error:#}");
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    async fn cleanup_loop(inner: Arc<Self>, shutdown: CancellationToken) {
        info!("cleanup loop started");
        let tick = inner.config.cleanup_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if let Err(error) = inner.cleanup_tick().await {
                        error!("cleanup tick error: {error:#}");
                    }
                }
            }
        }
        info!("cleanup loop stopped");
    }

    /// One coordinator tick: fail overdue dependency waits, then dispatch
    /// the highest-priority ready task if a pool slot is free
    async fn dispatch_tick(self: &Arc<Self>) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut st = self.state.write().await;
            let state = &mut *st;

            for (entry, dependency, limit) in
                state.queue.expire_dependencies(&state.completed_ids)
            {
                let error = TaskError::DependencyTimeout { dependency, limit };
                let mut task = lock_task(&entry.task);
                warn!(
                    "task {} gave up waiting on dependency {} after {:?}",
                    task.id, dependency, limit
                );
                task.transition(TaskStatus::Failed);
                task.completed_at = Some(Utc::now());
                task.result = Some(TaskResult::failure(error.clone(), Duration::ZERO));
                state.stats.tasks_failed += 1;
                events.push(CoordinatorEvent::TaskFailed {
                    task_id: task.id,
                    error,
                });
            }

            if state.running.len() < self.config.max_concurrent_tasks
                && !state.queue.is_empty()
                && let Some(entry) = state.queue.take_ready(&state.completed_ids)
            {
                let QueueEntry { task, id, .. } = entry;
                let (body, limit, run_token, name) = {
                    let mut t = lock_task(&task);
                    t.transition(TaskStatus::Running);
                    t.started_at = Some(Utc::now());
                    (
                        t.body.clone(),
                        t.timeout,
                        t.cancel_token.child_token(),
                        t.name.clone(),
                    )
                };
                let ctx =
                    TaskContext::new(id, run_token.clone(), ProgressHandle::new(task.clone()));
                let inner = Arc::clone(self);
                let worker_task = task.clone();
                let worker_token = run_token.clone();
                let worker = tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = run_body(&body, ctx, limit, worker_token).await;
                    inner.finalize_run(worker_task, outcome, started.elapsed()).await;
                });
                state.running.insert(
                    id,
                    RunningTask {
                        task,
                        run_token,
                        worker,
                    },
                );
                debug!("task dispatched: {} ({})", name, id);
                events.push(CoordinatorEvent::TaskStarted { task_id: id });
            }
        }
        self.emit(&events);
        Ok(())
    }

    /// Apply a finished run to the task record and coordinator sets
    async fn finalize_run(
        self: Arc<Self>,
        task: Arc<Mutex<Task>>,
        outcome: ExecutionOutcome,
        elapsed: Duration,
    ) {
        let mut events = Vec::new();
        let mut requeue = false;
        {
            let mut st = self.state.write().await;
            let state = &mut *st;
            {
                let mut t = lock_task(&task);
                state.running.remove(&t.id);
                if t.status == TaskStatus::Running {
                    match outcome {
                        ExecutionOutcome::Completed(value) => {
                            t.transition(TaskStatus::Completed);
                            t.completed_at = Some(Utc::now());
                            t.progress = 1.0;
                            let result = TaskResult::success(value, elapsed);
                            t.result = Some(result.clone());
                            state.completed_ids.insert(t.id);
                            state.stats.tasks_completed += 1;
                            state.stats.total_execution_time += elapsed;
                            info!(
                                "task completed: {} ({:.2}s)",
                                t.name,
                                elapsed.as_secs_f64()
                            );
                            events.push(CoordinatorEvent::TaskCompleted {
                                task_id: t.id,
                                result,
                            });
                        }
                        ExecutionOutcome::Failed(message) => {
                            if t.retry_count < t.max_retries {
                                t.retry_count += 1;
                                warn!(
                                    "task {} failed, retrying ({}/{}): {}",
                                    t.id, t.retry_count, t.max_retries, message
                                );
                                events.push(CoordinatorEvent::TaskRetried {
                                    task_id: t.id,
                                    attempt: t.retry_count,
                                });
                                requeue = true;
                            } else {
                                let error = TaskError::ExecutionFailed { message };
                                error!("task {} failed: {}", t.id, error);
                                t.transition(TaskStatus::Failed);
                                t.completed_at = Some(Utc::now());
                                t.result = Some(TaskResult::failure(error.clone(), elapsed));
                                state.stats.tasks_failed += 1;
                                events.push(CoordinatorEvent::TaskFailed {
                                    task_id: t.id,
                                    error,
                                });
                            }
                        }
                        ExecutionOutcome::TimedOut => {
                            let error = TaskError::TimedOut { limit: t.timeout };
                            error!("task {} timed out after {:?}", t.id, t.timeout);
                            t.transition(TaskStatus::TimedOut);
                            t.completed_at = Some(Utc::now());
                            t.result = Some(TaskResult::failure(error, elapsed));
                            state.stats.tasks_failed += 1;
                            events.push(CoordinatorEvent::TaskTimedOut { task_id: t.id });
                        }
                        ExecutionOutcome::Interrupted => {
                            debug!("task {} run interrupted while running", t.id);
                            t.transition(TaskStatus::Cancelled);
                            t.completed_at = Some(Utc::now());
                            state.stats.tasks_cancelled += 1;
                            events.push(CoordinatorEvent::TaskCancelled { task_id: t.id });
                        }
                    }
                } else {
                    debug!(
                        "task {} finished a run in state {:?}; result discarded",
                        t.id, t.status
                    );
                }
            }
            if requeue && !state.queue.enqueue(task.clone()) {
                let mut t = lock_task(&task);
                let error = TaskError::ExecutionFailed {
                    message: "retry re-enqueue rejected: queue full".to_string(),
                };
                warn!("task {} retry dropped: queue full", t.id);
                t.transition(TaskStatus::Failed);
                t.completed_at = Some(Utc::now());
                t.result = Some(TaskResult::failure(error.clone(), elapsed));
                state.stats.tasks_failed += 1;
                events.push(CoordinatorEvent::TaskFailed {
                    task_id: t.id,
                    error,
                });
            }
        }
        self.emit(&events);
    }

    /// One scheduler tick: move due deferred tasks into the queue
    async fn scheduler_tick(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut st = self.state.write().await;
            let state = &mut *st;
            let now = Utc::now();
            let due: Vec<TaskId> = state
                .scheduled
                .iter()
                .filter(|(_, task)| {
                    let task = lock_task(task);
                    matches!(task.scheduled_at, Some(at) if at <= now)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in due {
                if state.queue.is_full() {
                    warn!("queue full; deferring activation of scheduled task {}", id);
                    break;
                }
                if let Some(task) = state.scheduled.remove(&id) {
                    if state.queue.enqueue(task.clone()) {
                        info!("scheduled task activated: {}", id);
                        events.push(CoordinatorEvent::TaskQueued { task_id: id });
                    } else {
                        state.scheduled.insert(id, task);
                    }
                }
            }
        }
        self.emit(&events);
        Ok(())
    }

    /// One cleanup tick: evict the oldest terminal tasks beyond the
    /// retention bound, atomically with their completed-id entries. A
    /// terminal task still referenced as a dependency of a non-terminal
    /// task is never evicted.
    async fn cleanup_tick(&self) -> Result<()> {
        let mut st = self.state.write().await;

        let mut terminal: Vec<(TaskId, DateTime<Utc>)> = Vec::new();
        let mut referenced: HashSet<TaskId> = HashSet::new();
        for entry in self.registry.iter() {
            let task = lock_task(entry.value());
            if task.status.is_terminal() {
                terminal.push((task.id, task.completed_at.unwrap_or(task.created_at)));
            } else {
                referenced.extend(task.dependencies.iter().map(|dep| dep.task_id));
            }
        }

        if terminal.len() <= self.config.max_completed_history {
            return Ok(());
        }

        terminal.sort_by_key(|(_, finished)| *finished);
        let excess = terminal.len() - self.config.max_completed_history;
        let mut evicted = 0usize;
        for (id, _) in terminal {
            if evicted == excess {
                break;
            }
            if referenced.contains(&id) {
                continue;
            }
            self.registry.remove(&id);
            st.completed_ids.remove(&id);
            evicted += 1;
        }

        if evicted > 0 {
            info!("cleaned up {} finished tasks", evicted);
        }
        Ok(())
    }
}
