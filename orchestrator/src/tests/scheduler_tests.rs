//! Scheduler protocol tests
//!
//! These drive the real bus end to end: the test plays the worker's part by
//! holding worker_0's inbound queue and injecting messages on the shared
//! outbound queues, then asserts the state transitions a tick applies.

use super::test_store;
use crate::bus::MessageBus;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::store::Store;
use shared::config::{CommunicationConfig, ProcessingConfig, StoreConfig, WorkerPoolConfig};
use shared::message::{
    Action, ActionResult, Message, MessagePayload, StatusKind, StatusUpdate,
};
use shared::task::{TaskParams, TaskStatus};
use shared::worker::{WorkerCapabilities, WorkerState};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

struct Harness {
    store: Arc<Mutex<Store>>,
    queue: Arc<Mutex<TaskQueue>>,
    registry: Arc<Mutex<WorkerRegistry>>,
    bus: Arc<Mutex<MessageBus>>,
    scheduler: Scheduler,
    /// worker_0's inbound queue, held by the test in place of a pump.
    worker_rx: mpsc::Receiver<Message>,
    results_tx: mpsc::Sender<Message>,
    statuses_tx: mpsc::Sender<Message>,
}

async fn harness(temp_dir: &TempDir) -> Harness {
    let store = test_store(temp_dir).await;
    let bus = Arc::new(Mutex::new(MessageBus::new()));
    let queue = Arc::new(Mutex::new(TaskQueue::new(store.clone())));
    let registry = Arc::new(Mutex::new(WorkerRegistry::new(
        store.clone(),
        bus.clone(),
        WorkerPoolConfig {
            auto_start_workers: false,
            ..Default::default()
        },
        CommunicationConfig::default(),
        PathBuf::from("node.json"),
    )));

    let (worker_rx, results_tx, statuses_tx) = {
        let mut bus = bus.lock().await;
        let rx = bus.register_worker("worker_0");
        let (results_tx, statuses_tx) = bus.outbound_senders();
        (rx, results_tx, statuses_tx)
    };
    registry
        .lock()
        .await
        .register("worker_0", 0, WorkerCapabilities::default())
        .await;

    // A catalog row with a relative path exercises path resolution.
    store
        .lock()
        .await
        .upsert_model(
            "cyberrealistic_pony_v110",
            "weights/cyberrealistic_pony_v110.safetensors",
            Some(6500),
        )
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        queue.clone(),
        registry.clone(),
        bus.clone(),
        ProcessingConfig::default(),
        StoreConfig::default(),
        temp_dir.path().join("models"),
    );

    Harness {
        store,
        queue,
        registry,
        bus,
        scheduler,
        worker_rx,
        results_tx,
        statuses_tx,
    }
}

fn message(worker_id: &str, timestamp: f64, payload: MessagePayload) -> Message {
    Message {
        message_id: format!("msg_test_{}", timestamp as u64),
        worker_id: worker_id.to_string(),
        timestamp,
        payload,
    }
}

fn status(worker_id: &str, timestamp: f64, kind: StatusKind, task_id: &str) -> Message {
    message(
        worker_id,
        timestamp,
        MessagePayload::Status {
            update: StatusUpdate {
                status: kind,
                task_id: Some(task_id.to_string()),
                error: None,
            },
        },
    )
}

async fn submit(harness: &Harness, prompt: &str) -> String {
    harness
        .queue
        .lock()
        .await
        .submit(
            None,
            TaskParams {
                prompt: prompt.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_dispatch_marks_task_and_worker_before_send() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    let task_id = submit(&h, "a cat").await;
    h.scheduler.tick().await.unwrap();

    // The worker received exactly one run_task instruction.
    let received = h.worker_rx.try_recv().unwrap();
    let MessagePayload::Instruction {
        action: Action::RunTask { task },
    } = received.payload
    else {
        panic!("expected a run_task instruction");
    };
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.params.prompt, "a cat");

    // Model info was attached and its relative path resolved.
    let model = task.model.expect("model info missing from assignment");
    assert_eq!(model.name, "cyberrealistic_pony_v110");
    assert!(PathBuf::from(&model.path).is_absolute() || model.path.starts_with(temp_dir.path().to_str().unwrap()));

    // In-memory marks.
    assert_eq!(
        h.queue.lock().await.get(&task_id).unwrap().status,
        TaskStatus::Assigned
    );
    let registry = h.registry.lock().await;
    let entry = registry.get("worker_0").unwrap();
    assert_eq!(entry.state, WorkerState::Busy);
    assert_eq!(entry.current_task.as_deref(), Some(task_id.as_str()));
    drop(registry);

    // Durable mark.
    let row = h.store.lock().await.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "assigned");
    assert_eq!(row.worker_id.as_deref(), Some("worker_0"));
}

#[tokio::test]
async fn test_status_flow_through_completion() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    let task_id = submit(&h, "a cat").await;
    h.scheduler.tick().await.unwrap();
    h.worker_rx.try_recv().unwrap();

    // accepted, then processing_started at t=1000.
    h.statuses_tx
        .send(status("worker_0", 999.5, StatusKind::Accepted, &task_id))
        .await
        .unwrap();
    h.statuses_tx
        .send(status("worker_0", 1000.0, StatusKind::ProcessingStarted, &task_id))
        .await
        .unwrap();
    h.scheduler.tick().await.unwrap();

    assert_eq!(
        h.queue.lock().await.get(&task_id).unwrap().status,
        TaskStatus::Running
    );
    let row = h.store.lock().await.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "running");
    assert!(row.start_time.is_some());
    // Worker stays busy while computing.
    assert_eq!(
        h.registry.lock().await.get("worker_0").unwrap().state,
        WorkerState::Busy
    );

    // The worker finishes: result, completed, ready.
    h.results_tx
        .send(message(
            "worker_0",
            1004.5,
            MessagePayload::Result {
                result: ActionResult {
                    task_id: Some(task_id.clone()),
                    success: true,
                    output_path: Some("outputs/worker_0_x_832x1216_s42.png".to_string()),
                    seed: Some(42),
                    duration_secs: Some(4.4),
                    ..Default::default()
                },
            },
        ))
        .await
        .unwrap();
    h.statuses_tx
        .send(status("worker_0", 1004.5, StatusKind::Completed, &task_id))
        .await
        .unwrap();
    h.statuses_tx
        .send(status("worker_0", 1004.6, StatusKind::Ready, &task_id))
        .await
        .unwrap();
    h.scheduler.tick().await.unwrap();

    let queue = h.queue.lock().await;
    let record = queue.get(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.processing_time_secs, Some(4.5));
    assert_eq!(
        record.output_path.as_deref(),
        Some("outputs/worker_0_x_832x1216_s42.png")
    );
    assert_eq!(record.seed_used, Some(42));
    drop(queue);

    // Ready returned the worker to rotation.
    let registry = h.registry.lock().await;
    let entry = registry.get("worker_0").unwrap();
    assert_eq!(entry.state, WorkerState::Idle);
    assert!(entry.current_task.is_none());
    drop(registry);

    // Durable terminal row with artifact path and both timestamps.
    let mut store = h.store.lock().await;
    let row = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert!(row.output_path.is_some());
    assert!(row.start_time.unwrap() <= row.completion_time.unwrap());

    // Successful load bumped the model usage counter.
    let model = store.get_model("cyberrealistic_pony_v110").await.unwrap().unwrap();
    assert_eq!(model.usage_count, 1);
}

#[tokio::test]
async fn test_dispatch_fairness_across_two_workers() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    // Second worker.
    let mut worker1_rx = h.bus.lock().await.register_worker("worker_1");
    h.registry
        .lock()
        .await
        .register("worker_1", 1, WorkerCapabilities::default())
        .await;

    let t1 = submit(&h, "one").await;
    let t2 = submit(&h, "two").await;
    let t3 = submit(&h, "three").await;

    // One dispatch per tick; the first two land one on each worker.
    // worker_1 registered last, so it is the most recently active and gets
    // the first task.
    h.scheduler.tick().await.unwrap();
    h.scheduler.tick().await.unwrap();
    assert!(worker1_rx.try_recv().is_ok());
    assert!(h.worker_rx.try_recv().is_ok());

    // No idle worker: the third task waits.
    h.scheduler.tick().await.unwrap();
    assert_eq!(
        h.queue.lock().await.get(&t3).unwrap().status,
        TaskStatus::Queued
    );

    // worker_1 drains its task and announces ready.
    h.results_tx
        .send(message(
            "worker_1",
            2000.0,
            MessagePayload::Result {
                result: ActionResult {
                    task_id: Some(t1.clone()),
                    success: true,
                    output_path: Some("outputs/one.png".to_string()),
                    seed: Some(1),
                    ..Default::default()
                },
            },
        ))
        .await
        .unwrap();
    h.statuses_tx
        .send(status("worker_1", 2000.1, StatusKind::Ready, &t1))
        .await
        .unwrap();
    h.scheduler.tick().await.unwrap();

    // The freed worker picked up the waiting task.
    let third = worker1_rx.try_recv().unwrap();
    let MessagePayload::Instruction {
        action: Action::RunTask { task },
    } = third.payload
    else {
        panic!("expected a run_task instruction");
    };
    assert_eq!(task.task_id, t3);
    assert_eq!(
        h.queue.lock().await.get(&t2).unwrap().status,
        TaskStatus::Assigned
    );
}

#[tokio::test]
async fn test_worker_error_fails_task_and_flags_worker() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    let task_id = submit(&h, "a cat").await;
    h.scheduler.tick().await.unwrap();
    h.worker_rx.try_recv().unwrap();

    h.statuses_tx
        .send(message(
            "worker_0",
            3000.0,
            MessagePayload::Status {
                update: StatusUpdate {
                    status: StatusKind::Error,
                    task_id: Some(task_id.clone()),
                    error: Some("Model path not found: /missing".to_string()),
                },
            },
        ))
        .await
        .unwrap();
    h.scheduler.tick().await.unwrap();

    let queue = h.queue.lock().await;
    let record = queue.get(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error_message.as_deref().unwrap().contains("not found"));
    assert_eq!(record.error_kind.as_deref(), Some("worker_error"));
    drop(queue);

    assert_eq!(
        h.registry.lock().await.get("worker_0").unwrap().state,
        WorkerState::Error
    );

    let row = h.store.lock().await.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.error_kind.as_deref(), Some("worker_error"));
}

#[tokio::test]
async fn test_failed_put_reverts_dispatch_marks() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    // The worker's inbound queue disappears (its pump died).
    h.bus.lock().await.unregister_worker("worker_0");

    let task_id = submit(&h, "a cat").await;
    h.scheduler.tick().await.unwrap();

    // Both marks were reverted and the task sits at the head again.
    let queue = h.queue.lock().await;
    let record = queue.get(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert!(record.worker_id.is_none());
    assert_eq!(queue.queued_count(), 1);
    drop(queue);

    assert_eq!(
        h.registry.lock().await.get("worker_0").unwrap().state,
        WorkerState::Idle
    );
}

#[tokio::test]
async fn test_recovery_restores_queued_and_fails_interrupted() {
    let temp_dir = TempDir::new().unwrap();
    let mut h = harness(&temp_dir).await;

    {
        let mut store = h.store.lock().await;
        let p = TaskParams {
            prompt: "x".to_string(),
            ..Default::default()
        };
        store.create_task("was_queued", &p).await.unwrap();
        store.create_task("was_running", &p).await.unwrap();
        store
            .update_task_status(
                "was_running",
                TaskStatus::Running,
                Some("worker_0"),
                None,
                None,
                None,
                None,
            )
            .await
            .unwrap();
    }

    h.scheduler.recover_from_store().await.unwrap();

    let mut store = h.store.lock().await;
    let row = store.get_task("was_running").await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.error_kind.as_deref(), Some("orchestrator_shutdown"));
    drop(store);

    // The queued row came back onto the in-memory queue and is dispatchable.
    assert_eq!(h.queue.lock().await.queued_count(), 1);
    h.scheduler.tick().await.unwrap();
    let received = h.worker_rx.try_recv().unwrap();
    let MessagePayload::Instruction {
        action: Action::RunTask { task },
    } = received.payload
    else {
        panic!("expected a run_task instruction");
    };
    assert_eq!(task.task_id, "was_queued");
}
