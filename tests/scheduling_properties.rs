//! Scheduling-order, concurrency-bound and lifecycle properties of the
//! coordinator, exercised end to end with real bodies.

use serde_json::json;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskcoord::{
    CoordinatorConfig, TaskBody, TaskCoordinator, TaskDependency, TaskError, TaskId, TaskPriority,
    TaskSpec, TaskStatus,
};

fn fast_config() -> CoordinatorConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    CoordinatorConfig {
        coordinator_tick_ms: 5,
        scheduler_tick_ms: 20,
        cleanup_enabled: false,
        ..Default::default()
    }
}

fn sleep_body(ms: u64) -> TaskBody {
    TaskBody::async_fn(move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!("slept"))
    })
}

fn instant_body() -> TaskBody {
    TaskBody::async_fn(|_ctx| async move { Ok(json!("instant")) })
}

/// Body that records its label when it starts running
fn recording_body(
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    ms: u64,
) -> TaskBody {
    TaskBody::async_fn(move |_ctx| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(label);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(label))
        }
    })
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn status_of(coordinator: &TaskCoordinator, id: TaskId) -> Option<TaskStatus> {
    coordinator.get_task(id).map(|task| task.status)
}

#[tokio::test]
#[serial]
async fn dependent_never_dispatches_before_dependency_completes() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let slow = coordinator
        .create_task(TaskSpec::new("slow dependency", sleep_body(100)))
        .await;
    let dependent = coordinator
        .create_task(TaskSpec::new("dependent", instant_body()).with_dependency(slow))
        .await;

    // Dependent submitted first to stress the readiness scan
    assert!(coordinator.submit(dependent).await);
    assert!(coordinator.submit(slow).await);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, dependent) == Some(TaskStatus::Completed)
        })
        .await
    );

    let slow_snapshot = coordinator.get_task(slow).unwrap();
    let dependent_snapshot = coordinator.get_task(dependent).unwrap();
    assert_eq!(slow_snapshot.status, TaskStatus::Completed);
    assert!(
        dependent_snapshot.started_at.unwrap() >= slow_snapshot.completed_at.unwrap(),
        "dependent started before its dependency completed"
    );

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn higher_priority_dispatches_first_despite_submission_order() {
    let config = CoordinatorConfig {
        max_concurrent_tasks: 1,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    let starts = Arc::new(Mutex::new(Vec::new()));

    // Occupy the single pool slot so both contenders are queued together
    let blocker = coordinator
        .create_task(TaskSpec::new(
            "blocker",
            recording_body("blocker", starts.clone(), 150),
        ))
        .await;
    assert!(coordinator.submit(blocker).await);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, blocker) == Some(TaskStatus::Running)
        })
        .await
    );

    let low = coordinator
        .create_task(
            TaskSpec::new("low", recording_body("low", starts.clone(), 200))
                .with_priority(TaskPriority::Low),
        )
        .await;
    let critical = coordinator
        .create_task(
            TaskSpec::new("critical", recording_body("critical", starts.clone(), 50))
                .with_priority(TaskPriority::Critical),
        )
        .await;
    assert!(coordinator.submit(low).await);
    assert!(coordinator.submit(critical).await);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, low) == Some(TaskStatus::Completed)
        })
        .await
    );

    assert_eq!(*starts.lock().unwrap(), vec!["blocker", "critical", "low"]);
    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn equal_priority_dispatches_fifo() {
    let config = CoordinatorConfig {
        max_concurrent_tasks: 1,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    let starts = Arc::new(Mutex::new(Vec::new()));
    let blocker = coordinator
        .create_task(TaskSpec::new(
            "blocker",
            recording_body("blocker", starts.clone(), 100),
        ))
        .await;
    assert!(coordinator.submit(blocker).await);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, blocker) == Some(TaskStatus::Running)
        })
        .await
    );

    let first = coordinator
        .create_task(TaskSpec::new("first", recording_body("first", starts.clone(), 20)))
        .await;
    let second = coordinator
        .create_task(TaskSpec::new(
            "second",
            recording_body("second", starts.clone(), 20),
        ))
        .await;
    assert!(coordinator.submit(first).await);
    assert!(coordinator.submit(second).await);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, second) == Some(TaskStatus::Completed)
        })
        .await
    );

    assert_eq!(*starts.lock().unwrap(), vec!["blocker", "first", "second"]);
    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn pool_capacity_is_never_exceeded() {
    let config = CoordinatorConfig {
        max_concurrent_tasks: 2,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    for index in 0..5 {
        let active = active.clone();
        let peak = peak.clone();
        let body = TaskBody::async_fn(move |_ctx| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });
        let id = coordinator
            .create_task(TaskSpec::new(format!("worker {index}"), body))
            .await;
        ids.push(id);
        assert!(coordinator.submit(id).await);
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            ids.iter()
                .all(|id| status_of(&coordinator, *id) == Some(TaskStatus::Completed))
        })
        .await
    );

    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent bodies with capacity 2",
        peak.load(Ordering::SeqCst)
    );
    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn timeout_yields_timed_out_and_never_satisfies_dependents() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let doomed = coordinator
        .create_task(
            TaskSpec::new("doomed", sleep_body(500)).with_timeout(Duration::from_millis(100)),
        )
        .await;
    let dependent = coordinator
        .create_task(TaskSpec::new("dependent", instant_body()).with_dependency(doomed))
        .await;
    assert!(coordinator.submit(doomed).await);
    assert!(coordinator.submit(dependent).await);

    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, doomed).is_some_and(|status| status.is_terminal())
        })
        .await
    );

    let snapshot = coordinator.get_task(doomed).unwrap();
    assert_eq!(snapshot.status, TaskStatus::TimedOut);
    assert!(matches!(
        snapshot.result.as_ref().and_then(|r| r.error.as_ref()),
        Some(TaskError::TimedOut { .. })
    ));
    let held = snapshot.execution_time.unwrap();
    assert!(
        held < Duration::from_millis(400),
        "timeout enforced too late: {held:?}"
    );

    // The dependent must keep waiting: a timed-out id never satisfies it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status_of(&coordinator, dependent), Some(TaskStatus::Queued));

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn cancel_queued_task_removes_it_immediately() {
    let config = CoordinatorConfig {
        max_concurrent_tasks: 1,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    let blocker = coordinator
        .create_task(TaskSpec::new("blocker", sleep_body(200)))
        .await;
    assert!(coordinator.submit(blocker).await);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, blocker) == Some(TaskStatus::Running)
        })
        .await
    );

    let queued = coordinator
        .create_task(TaskSpec::new("queued", instant_body()))
        .await;
    assert!(coordinator.submit(queued).await);
    assert_eq!(status_of(&coordinator, queued), Some(TaskStatus::Queued));

    assert!(coordinator.cancel(queued).await);
    assert_eq!(status_of(&coordinator, queued), Some(TaskStatus::Cancelled));
    assert_eq!(coordinator.statistics().await.queue_size, 0);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn cancel_on_completed_task_is_noop() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let id = coordinator
        .create_task(TaskSpec::new("quick", instant_body()))
        .await;
    assert!(coordinator.submit(id).await);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, id) == Some(TaskStatus::Completed)
        })
        .await
    );

    assert!(coordinator.cancel(id).await);
    assert_eq!(status_of(&coordinator, id), Some(TaskStatus::Completed));
    assert_eq!(coordinator.statistics().await.tasks_cancelled, 0);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn cleanup_retains_most_recent_terminal_tasks() {
    let config = CoordinatorConfig {
        max_completed_history: 3,
        cleanup_enabled: true,
        cleanup_interval_ms: 50,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    let mut ids = Vec::new();
    for index in 0..5 {
        let id = coordinator
            .create_task(TaskSpec::new(format!("batch {index}"), instant_body()))
            .await;
        assert!(coordinator.submit(id).await);
        assert!(
            wait_until(Duration::from_secs(2), || {
                status_of(&coordinator, id) == Some(TaskStatus::Completed)
            })
            .await
        );
        ids.push(id);
    }

    // Oldest two evicted, most recent three retained
    assert!(
        wait_until(Duration::from_secs(2), || {
            coordinator.get_task(ids[0]).is_none() && coordinator.get_task(ids[1]).is_none()
        })
        .await
    );
    for id in &ids[2..] {
        assert!(coordinator.get_task(*id).is_some());
    }
    assert_eq!(coordinator.statistics().await.total_tasks, 3);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn submit_beyond_queue_capacity_is_rejected() {
    let config = CoordinatorConfig {
        max_queue_size: 2,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    // Tasks blocked on an unknown dependency stay queued
    let blocker = uuid::Uuid::new_v4();
    let mut ids = Vec::new();
    for index in 0..3 {
        let id = coordinator
            .create_task(
                TaskSpec::new(format!("stuck {index}"), instant_body()).with_dependency(blocker),
            )
            .await;
        ids.push(id);
    }

    assert!(coordinator.submit(ids[0]).await);
    assert!(coordinator.submit(ids[1]).await);
    assert!(!coordinator.submit(ids[2]).await);

    let stats = coordinator.statistics().await;
    assert_eq!(stats.queue_size, 2);
    assert_eq!(status_of(&coordinator, ids[2]), Some(TaskStatus::Pending));

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn retry_budget_reruns_failing_body() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let body = TaskBody::async_fn(move |_ctx| {
        let counter = counter.clone();
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                anyhow::bail!("transient failure on attempt {attempt}")
            }
            Ok(json!(attempt))
        }
    });

    let id = coordinator
        .create_task(TaskSpec::new("flaky", body).with_max_retries(2))
        .await;
    assert!(coordinator.submit(id).await);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, id) == Some(TaskStatus::Completed)
        })
        .await
    );
    let snapshot = coordinator.get_task(id).unwrap();
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn exhausted_retry_budget_fails_task() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let body = TaskBody::async_fn(|_ctx| async move {
        anyhow::bail!("always failing")
    });
    let id = coordinator
        .create_task(TaskSpec::new("hopeless", body).with_max_retries(1))
        .await;
    assert!(coordinator.submit(id).await);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, id) == Some(TaskStatus::Failed)
        })
        .await
    );
    let snapshot = coordinator.get_task(id).unwrap();
    assert_eq!(snapshot.retry_count, 1);
    assert!(matches!(
        snapshot.result.as_ref().and_then(|r| r.error.as_ref()),
        Some(TaskError::ExecutionFailed { .. })
    ));

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn dependency_wait_deadline_fails_the_waiter() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let never_completes = uuid::Uuid::new_v4();
    let id = coordinator
        .create_task(TaskSpec::new("impatient", instant_body()).with_dependency(
            TaskDependency::on_completion(never_completes).with_timeout(Duration::from_millis(50)),
        ))
        .await;
    assert!(coordinator.submit(id).await);

    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, id) == Some(TaskStatus::Failed)
        })
        .await
    );
    let snapshot = coordinator.get_task(id).unwrap();
    assert!(matches!(
        snapshot.result.as_ref().and_then(|r| r.error.as_ref()),
        Some(TaskError::DependencyTimeout { .. })
    ));

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn scheduled_task_activates_at_its_time() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let activation = chrono::Utc::now() + chrono::Duration::milliseconds(150);
    let id = coordinator
        .create_task(TaskSpec::new("deferred", instant_body()).scheduled_for(activation))
        .await;
    assert!(coordinator.submit(id).await);

    assert_eq!(status_of(&coordinator, id), Some(TaskStatus::Pending));
    assert_eq!(coordinator.statistics().await.scheduled_count, 1);

    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, id) == Some(TaskStatus::Completed)
        })
        .await
    );
    let snapshot = coordinator.get_task(id).unwrap();
    assert!(snapshot.started_at.unwrap() >= activation);
    assert_eq!(coordinator.statistics().await.scheduled_count, 0);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn scheduler_retains_activated_task_when_queue_is_full() {
    let config = CoordinatorConfig {
        max_queue_size: 1,
        ..fast_config()
    };
    let coordinator = TaskCoordinator::new(config);
    coordinator.start().await;

    // Fill the single queue slot with a task that can never become ready
    let stuck = coordinator
        .create_task(
            TaskSpec::new("stuck", instant_body()).with_dependency(uuid::Uuid::new_v4()),
        )
        .await;
    assert!(coordinator.submit(stuck).await);

    let deferred = coordinator
        .create_task(
            TaskSpec::new("deferred", instant_body())
                .scheduled_for(chrono::Utc::now() + chrono::Duration::milliseconds(30)),
        )
        .await;
    assert!(coordinator.submit(deferred).await);

    // Past its activation time the task must stay in the deferred set, not
    // be dropped
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(status_of(&coordinator, deferred), Some(TaskStatus::Pending));
    assert_eq!(coordinator.statistics().await.scheduled_count, 1);

    // Once the queue drains the activation goes through
    assert!(coordinator.cancel(stuck).await);
    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, deferred) == Some(TaskStatus::Completed)
        })
        .await
    );

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn pause_and_resume_rerun_the_body() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let body = TaskBody::async_fn(move |_ctx| {
        let counter = counter.clone();
        async move {
            let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if run == 1 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(json!(run))
        }
    });
    let id = coordinator
        .create_task(TaskSpec::new("pausable", body))
        .await;
    assert!(coordinator.submit(id).await);

    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, id) == Some(TaskStatus::Running)
        })
        .await
    );
    assert!(coordinator.pause(id).await);
    assert_eq!(status_of(&coordinator, id), Some(TaskStatus::Paused));

    // Resume re-queues; the second run completes without the long sleep
    assert!(coordinator.resume(id).await);
    assert!(
        wait_until(Duration::from_secs(3), || {
            status_of(&coordinator, id) == Some(TaskStatus::Completed)
        })
        .await
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    coordinator.stop().await;
}

#[tokio::test]
#[serial]
async fn blocking_body_runs_and_reports_progress() {
    let coordinator = TaskCoordinator::new(fast_config());
    coordinator.start().await;

    let body = TaskBody::blocking(|ctx| {
        for step in 1..=4 {
            if ctx.is_cancelled() {
                anyhow::bail!("interrupted");
            }
            std::thread::sleep(Duration::from_millis(10));
            ctx.update_progress(step as f64 / 4.0, "working");
        }
        Ok(json!("done"))
    });
    let id = coordinator
        .create_task(TaskSpec::new("blocking", body))
        .await;
    assert!(coordinator.submit(id).await);

    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of(&coordinator, id) == Some(TaskStatus::Completed)
        })
        .await
    );
    let snapshot = coordinator.get_task(id).unwrap();
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(
        snapshot.result.as_ref().map(|r| r.data.clone()),
        Some(json!("done"))
    );

    coordinator.stop().await;
}
