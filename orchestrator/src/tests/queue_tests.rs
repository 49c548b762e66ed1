//! Tests for the task queue and its lifecycle invariants

use super::test_store;
use crate::queue::TaskQueue;
use shared::task::{error_kind, TaskParams, TaskStatus};
use tempfile::TempDir;

fn params(prompt: &str) -> TaskParams {
    TaskParams {
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_submit_and_fifo_order() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let first = queue.submit(None, params("1")).await.unwrap();
    let second = queue.submit(None, params("2")).await.unwrap();

    assert_eq!(queue.queued_count(), 2);
    assert_eq!(queue.next().unwrap().task_id, first);
    assert_eq!(queue.next().unwrap().task_id, second);
    assert!(queue.next().is_none());
}

#[tokio::test]
async fn test_duplicate_submission_derives_a_new_id() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut queue = TaskQueue::new(store.clone());

    let first = queue
        .submit(Some("abc".to_string()), params("x"))
        .await
        .unwrap();
    assert_eq!(first, "abc");

    let second = queue
        .submit(Some("abc".to_string()), params("y"))
        .await
        .unwrap();
    assert_ne!(second, "abc");
    assert!(second.starts_with("abc_"));

    // Exactly two durable rows, never a partial one.
    let mut store = store.lock().await;
    assert!(store.get_task("abc").await.unwrap().is_some());
    assert!(store.get_task(&second).await.unwrap().is_some());
}

#[tokio::test]
async fn test_task_id_is_in_exactly_one_container() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let task_id = queue.submit(None, params("x")).await.unwrap();
    assert_eq!(queue.stats().queued_tasks, 1);
    assert_eq!(queue.stats().active_tasks, 0);

    let popped = queue.next().unwrap();
    assert_eq!(popped.task_id, task_id);
    assert_eq!(queue.stats().queued_tasks, 0);
    assert_eq!(queue.stats().active_tasks, 1);

    queue.assign(&task_id, "worker_0");
    queue.mark_running(&task_id, 100.0);
    queue.complete(&task_id, "out.png".to_string(), Some(42), 103.5);

    assert_eq!(queue.stats().active_tasks, 0);
    assert_eq!(queue.stats().completed_tasks, 1);
    assert_eq!(queue.stats().total_processed, 1);
}

#[tokio::test]
async fn test_complete_computes_processing_time_from_timestamps() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let task_id = queue.submit(None, params("x")).await.unwrap();
    queue.next().unwrap();
    queue.assign(&task_id, "worker_0");
    queue.mark_running(&task_id, 1000.0);

    let record = queue
        .complete(&task_id, "out.png".to_string(), Some(7), 1004.25)
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.processing_time_secs, Some(4.25));
    assert_eq!(record.output_path.as_deref(), Some("out.png"));
    assert_eq!(record.seed_used, Some(7));
}

#[tokio::test]
async fn test_terminal_records_are_immutable() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let task_id = queue.submit(None, params("x")).await.unwrap();
    queue.next().unwrap();
    queue.assign(&task_id, "worker_0");
    queue.mark_running(&task_id, 1.0);
    queue.complete(&task_id, "out.png".to_string(), None, 2.0);

    // A late failure event must not rewrite the terminal record.
    assert!(queue.fail(&task_id, "late".to_string(), error_kind::WORKER_ERROR).is_none());
    assert_eq!(
        queue.get(&task_id).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_only_succeeds_while_queued() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let dispatched = queue.submit(None, params("d")).await.unwrap();
    let queued = queue.submit(None, params("q")).await.unwrap();

    // Move the head task into dispatch; the second stays pending.
    let popped = queue.next().unwrap();
    assert_eq!(popped.task_id, dispatched);
    queue.assign(&dispatched, "worker_0");

    assert!(!queue.cancel(&dispatched));
    assert_eq!(
        queue.get(&dispatched).unwrap().status,
        TaskStatus::Assigned
    );

    assert!(queue.cancel(&queued));
    let record = queue.get(&queued).unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.completed_at.is_some());

    // A cancelled task can never be dispatched again.
    assert!(queue.next().is_none());

    // Unknown ids are not cancellable either.
    assert!(!queue.cancel("ghost"));
}

#[tokio::test]
async fn test_requeue_front_preserves_head_position() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let first = queue.submit(None, params("1")).await.unwrap();
    let _second = queue.submit(None, params("2")).await.unwrap();

    let popped = queue.next().unwrap();
    queue.assign(&popped.task_id, "worker_0");
    // Dispatch put failed: marks reverted, task back at the head.
    queue.requeue_front(&popped.task_id);

    let record = queue.get(&first).unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert!(record.worker_id.is_none());
    assert_eq!(queue.next().unwrap().task_id, first);
}

#[tokio::test]
async fn test_tasks_owned_by_worker() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let task_id = queue.submit(None, params("x")).await.unwrap();
    queue.next().unwrap();
    queue.assign(&task_id, "worker_3");

    assert_eq!(queue.tasks_owned_by("worker_3"), vec![task_id.clone()]);
    assert!(queue.tasks_owned_by("worker_0").is_empty());

    queue.fail(&task_id, "worker died".to_string(), error_kind::WORKER_DIED);
    assert!(queue.tasks_owned_by("worker_3").is_empty());
}

#[tokio::test]
async fn test_cleanup_drops_old_completed_records() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = TaskQueue::new(test_store(&temp_dir).await);

    let task_id = queue.submit(None, params("x")).await.unwrap();
    queue.next().unwrap();
    queue.assign(&task_id, "worker_0");
    queue.mark_running(&task_id, 1.0);
    // A completion far in the past, older than any retention bound.
    queue.complete(&task_id, "out.png".to_string(), None, 2.0);

    queue.cleanup(3600);
    assert_eq!(queue.stats().completed_tasks, 0);
    // The lifetime counter is not affected by record expiry.
    assert_eq!(queue.stats().total_processed, 1);
}
