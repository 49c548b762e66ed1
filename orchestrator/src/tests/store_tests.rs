//! Tests for the durable store

use super::test_store;
use crate::store::{CreateTaskOutcome, Store};
use shared::task::{TaskParams, TaskStatus};
use shared::worker::WorkerState;
use tempfile::TempDir;

fn params(prompt: &str) -> TaskParams {
    TaskParams {
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = Store::new(temp_dir.path(), 5).unwrap();
    store.initialize().await.unwrap();
    // Second run must not fail on existing tables or re-run migrations.
    store.initialize().await.unwrap();
}

#[tokio::test]
async fn test_create_task_reports_duplicates() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    let outcome = store.create_task("abc", &params("x")).await.unwrap();
    assert_eq!(outcome, CreateTaskOutcome::Created);

    let outcome = store.create_task("abc", &params("y")).await.unwrap();
    assert_eq!(outcome, CreateTaskOutcome::Duplicate);

    // The first row is untouched by the rejected insert.
    let row = store.get_task("abc").await.unwrap().unwrap();
    assert_eq!(row.prompt, "x");
    assert_eq!(row.status, "queued");
}

#[tokio::test]
async fn test_transitions_set_their_side_fields() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.create_task("t1", &params("a cat")).await.unwrap();

    store
        .update_task_status("t1", TaskStatus::Assigned, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
    let row = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(row.status, "assigned");
    assert_eq!(row.worker_id.as_deref(), Some("worker_0"));
    assert!(row.start_time.is_none());

    store
        .update_task_status("t1", TaskStatus::Running, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
    let row = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(row.status, "running");
    let start_time = row.start_time.unwrap();

    // A second running write must not move start_time.
    store
        .update_task_status("t1", TaskStatus::Running, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
    let row = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(row.start_time.unwrap(), start_time);

    store
        .update_task_status(
            "t1",
            TaskStatus::Completed,
            Some("worker_0"),
            Some("outputs/worker_0_t1_832x1216_s42.png"),
            None,
            None,
            Some(3.5),
        )
        .await
        .unwrap();
    let row = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(
        row.output_path.as_deref(),
        Some("outputs/worker_0_t1_832x1216_s42.png")
    );
    assert_eq!(row.processing_time_seconds, Some(3.5));
    let completion = row.completion_time.unwrap();
    assert!(row.start_time.unwrap() <= completion);
}

#[tokio::test]
async fn test_failed_transition_records_error_and_kind() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.create_task("t1", &params("x")).await.unwrap();
    store
        .update_task_status(
            "t1",
            TaskStatus::Failed,
            None,
            None,
            Some("worker worker_0 died while owning the task"),
            Some("worker_died"),
            None,
        )
        .await
        .unwrap();

    let row = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.error_message.unwrap().contains("died"));
    assert_eq!(row.error_kind.as_deref(), Some("worker_died"));
    assert!(row.completion_time.is_some());
}

#[tokio::test]
async fn test_update_of_missing_row_is_a_warning_not_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store
        .update_task_status("ghost", TaskStatus::Running, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pending_tasks_are_ordered_by_submit_time() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.create_task("first", &params("1")).await.unwrap();
    store.create_task("second", &params("2")).await.unwrap();
    store.create_task("third", &params("3")).await.unwrap();
    store
        .update_task_status("second", TaskStatus::Assigned, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
    // Terminal rows never show up as pending.
    store
        .update_task_status("third", TaskStatus::Cancelled, None, None, None, None, None)
        .await
        .unwrap();

    let pending = store.get_pending_tasks(10).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
}

#[tokio::test]
async fn test_recovery_resolves_interrupted_tasks() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.create_task("queued", &params("q")).await.unwrap();
    store.create_task("assigned", &params("a")).await.unwrap();
    store.create_task("running", &params("r")).await.unwrap();
    store
        .update_task_status("assigned", TaskStatus::Assigned, Some("worker_0"), None, None, None, None)
        .await
        .unwrap();
    store
        .update_task_status("running", TaskStatus::Running, Some("worker_1"), None, None, None, None)
        .await
        .unwrap();

    let recovered = store.recover_interrupted_tasks().await.unwrap();
    assert_eq!(recovered, 2);

    for task_id in ["assigned", "running"] {
        let row = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_kind.as_deref(), Some("orchestrator_shutdown"));
    }

    // Queued rows survive untouched.
    let row = store.get_task("queued").await.unwrap().unwrap();
    assert_eq!(row.status, "queued");
}

#[tokio::test]
async fn test_cleanup_keeps_failed_rows() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.create_task("old_done", &params("1")).await.unwrap();
    store.create_task("old_failed", &params("2")).await.unwrap();
    store
        .update_task_status("old_done", TaskStatus::Completed, None, Some("p.png"), None, None, None)
        .await
        .unwrap();
    store
        .update_task_status("old_failed", TaskStatus::Failed, None, None, Some("boom"), None, None)
        .await
        .unwrap();

    // Backdate both completions past the retention window.
    let conn = store.get_connection().unwrap();
    conn.execute("UPDATE tasks SET completion_time = completion_time - 864000", [])
        .unwrap();

    store.cleanup_old_records(7).await.unwrap();

    assert!(store.get_task("old_done").await.unwrap().is_none());
    assert!(store.get_task("old_failed").await.unwrap().is_some());
}

#[tokio::test]
async fn test_worker_rows_upsert() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store.register_worker("worker_0", 0).await.unwrap();
    store
        .update_worker_status("worker_0", 0, WorkerState::Idle, Some("model_a"), 5500, None)
        .await
        .unwrap();

    let workers = store.get_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, "idle");
    assert_eq!(workers[0].current_model.as_deref(), Some("model_a"));
    assert_eq!(workers[0].vram_usage_mb, 5500);

    // Re-registration resets the row to starting.
    store.register_worker("worker_0", 0).await.unwrap();
    let workers = store.get_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, "starting");
}

#[tokio::test]
async fn test_model_catalog_and_usage_counter() {
    let temp_dir = TempDir::new().unwrap();
    let store = test_store(&temp_dir).await;
    let mut store = store.lock().await;

    store
        .upsert_model("model_a", "models/model_a.safetensors", Some(6500))
        .await
        .unwrap();

    let info = store.get_model("model_a").await.unwrap().unwrap();
    assert_eq!(info.path, "models/model_a.safetensors");
    assert_eq!(info.size_mb, Some(6500));
    assert_eq!(info.usage_count, 0);
    assert!(info.last_used.is_none());

    store.touch_model_usage("model_a").await.unwrap();
    store.touch_model_usage("model_a").await.unwrap();
    let info = store.get_model("model_a").await.unwrap().unwrap();
    assert_eq!(info.usage_count, 2);
    assert!(info.last_used.is_some());

    assert!(store.get_model("missing").await.unwrap().is_none());
}
