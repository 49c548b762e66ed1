//! In-process message bus between the orchestrator and its worker pumps
//!
//! One bounded inbound channel per worker id (orchestrator to worker) plus
//! two shared outbound channels (results and statuses, worker to
//! orchestrator). The orchestrator never broadcasts: every instruction is put
//! on exactly one worker's channel, which rules out one worker consuming
//! another's message by construction.
//!
//! Puts block when a queue is at capacity, bounded by a caller-supplied
//! timeout so the scheduler can never stall past its tick cadence. Gets are
//! non-blocking. Nothing here is durable; recovery after a crash relies on
//! the Store.

use shared::message::Message;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;

/// Bound applied to every queue. Large enough that it is only ever hit when a
/// consumer has wedged, at which point blocking the producer is the correct
/// back-pressure.
pub const QUEUE_CAPACITY: usize = 1024;

/// Failures putting a message on the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No inbound queue registered for worker {0}")]
    UnknownWorker(String),
    #[error("Inbound queue for worker {0} is full")]
    Full(String),
    #[error("Inbound queue for worker {0} is closed")]
    Closed(String),
}

/// The per-worker inbound queues and shared outbound queues.
pub struct MessageBus {
    /// Inbound sender per worker id. The receiving half is owned by the
    /// worker's stdin pump.
    inbound: HashMap<String, mpsc::Sender<Message>>,
    results_tx: mpsc::Sender<Message>,
    results_rx: mpsc::Receiver<Message>,
    statuses_tx: mpsc::Sender<Message>,
    statuses_rx: mpsc::Receiver<Message>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (statuses_tx, statuses_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            inbound: HashMap::new(),
            results_tx,
            results_rx,
            statuses_tx,
            statuses_rx,
        }
    }

    /// Create the inbound queue for a worker and hand back its receiving
    /// half. Replaces any previous queue for the same id (respawn).
    pub fn register_worker(&mut self, worker_id: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        if self.inbound.insert(worker_id.to_string(), tx).is_some() {
            debug!("Replaced inbound queue for worker {}", worker_id);
        }
        rx
    }

    /// Drop a worker's inbound queue. The pump sees the channel close and
    /// stops.
    pub fn unregister_worker(&mut self, worker_id: &str) {
        self.inbound.remove(worker_id);
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        self.inbound.contains_key(worker_id)
    }

    /// Senders for the shared outbound queues, cloned into each worker's
    /// stdout pump.
    pub fn outbound_senders(&self) -> (mpsc::Sender<Message>, mpsc::Sender<Message>) {
        (self.results_tx.clone(), self.statuses_tx.clone())
    }

    /// Blocking put on one worker's inbound queue, bounded by `timeout`.
    pub async fn send_instruction(
        &self,
        worker_id: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let sender = self
            .inbound
            .get(worker_id)
            .ok_or_else(|| BusError::UnknownWorker(worker_id.to_string()))?;

        sender
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    BusError::Full(worker_id.to_string())
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    BusError::Closed(worker_id.to_string())
                }
            })
    }

    /// Non-blocking get on the shared results queue.
    pub fn try_next_result(&mut self) -> Option<Message> {
        self.results_rx.try_recv().ok()
    }

    /// Non-blocking get on the shared statuses queue.
    pub fn try_next_status(&mut self) -> Option<Message> {
        self.statuses_rx.try_recv().ok()
    }

    /// Drain up to `limit` messages from the results queue.
    pub fn drain_results(&mut self, limit: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        while drained.len() < limit {
            match self.results_rx.try_recv() {
                Ok(msg) => drained.push(msg),
                Err(_) => break,
            }
        }
        drained
    }

    /// Drain up to `limit` messages from the statuses queue.
    pub fn drain_statuses(&mut self, limit: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        while drained.len() < limit {
            match self.statuses_rx.try_recv() {
                Ok(msg) => drained.push(msg),
                Err(_) => break,
            }
        }
        drained
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
