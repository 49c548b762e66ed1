//! Tests for the message bus

use crate::bus::{BusError, MessageBus};
use shared::message::{Action, Message, MessagePayload};
use tokio::time::Duration;

fn instruction(worker_id: &str, action: Action) -> Message {
    Message::new(worker_id, MessagePayload::Instruction { action })
}

#[tokio::test]
async fn test_put_to_unknown_worker_fails() {
    let bus = MessageBus::new();
    let result = bus
        .send_instruction(
            "worker_0",
            instruction("worker_0", Action::CleanVram),
            Duration::from_millis(10),
        )
        .await;
    assert!(matches!(result, Err(BusError::UnknownWorker(_))));
}

#[tokio::test]
async fn test_per_worker_fifo_ordering() {
    let mut bus = MessageBus::new();
    let mut rx = bus.register_worker("worker_0");

    for action in [Action::ClearRam, Action::ClearVram, Action::CleanVram] {
        bus.send_instruction(
            "worker_0",
            instruction("worker_0", action),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    let received: Vec<Message> = vec![
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ];
    let names: Vec<&str> = received
        .iter()
        .map(|m| match &m.payload {
            MessagePayload::Instruction { action } => action.name(),
            _ => "unexpected",
        })
        .collect();
    assert_eq!(names, vec!["clear_ram", "clear_vram", "clean_vram"]);
}

#[tokio::test]
async fn test_instructions_are_routed_per_worker() {
    let mut bus = MessageBus::new();
    let mut rx0 = bus.register_worker("worker_0");
    let mut rx1 = bus.register_worker("worker_1");

    bus.send_instruction(
        "worker_1",
        instruction("worker_1", Action::CleanVram),
        Duration::from_millis(10),
    )
    .await
    .unwrap();

    let received = rx1.recv().await.unwrap();
    assert_eq!(received.worker_id, "worker_1");
    // Nothing leaks onto the other worker's queue.
    assert!(rx0.try_recv().is_err());
}

#[tokio::test]
async fn test_get_is_non_blocking_and_empty_when_idle() {
    let mut bus = MessageBus::new();
    assert!(bus.try_next_result().is_none());
    assert!(bus.try_next_status().is_none());
    assert!(bus.drain_statuses(16).is_empty());
}

#[tokio::test]
async fn test_outbound_queues_split_results_from_statuses() {
    let mut bus = MessageBus::new();
    let (results_tx, statuses_tx) = bus.outbound_senders();

    statuses_tx
        .send(Message::new("worker_0", MessagePayload::Shutdown))
        .await
        .unwrap();
    results_tx
        .send(Message::new(
            "worker_0",
            MessagePayload::Result {
                result: shared::message::ActionResult {
                    success: true,
                    ..Default::default()
                },
            },
        ))
        .await
        .unwrap();

    assert_eq!(bus.drain_statuses(16).len(), 1);
    assert_eq!(bus.drain_results(16).len(), 1);
    assert!(bus.try_next_result().is_none());
}

#[tokio::test]
async fn test_put_blocks_then_times_out_when_queue_is_full() {
    let mut bus = MessageBus::new();
    // Hold the receiver without draining so the queue fills.
    let _rx = bus.register_worker("worker_0");

    for _ in 0..crate::bus::QUEUE_CAPACITY {
        bus.send_instruction(
            "worker_0",
            instruction("worker_0", Action::CleanVram),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    }

    let result = bus
        .send_instruction(
            "worker_0",
            instruction("worker_0", Action::CleanVram),
            Duration::from_millis(20),
        )
        .await;
    assert!(matches!(result, Err(BusError::Full(_))));
}

#[tokio::test]
async fn test_unregistered_worker_queue_is_closed() {
    let mut bus = MessageBus::new();
    let rx = bus.register_worker("worker_0");
    drop(rx);
    bus.unregister_worker("worker_0");

    let result = bus
        .send_instruction(
            "worker_0",
            instruction("worker_0", Action::CleanVram),
            Duration::from_millis(10),
        )
        .await;
    assert!(matches!(result, Err(BusError::UnknownWorker(_))));
}
