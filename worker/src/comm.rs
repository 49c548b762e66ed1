//! Communication loops between the worker and its orchestrator
//!
//! The transport is the process's own stdio: instructions arrive as JSON
//! lines on stdin, and every outbound message leaves as a JSON line on
//! stdout. Logging therefore must never touch stdout in this binary.
//!
//! Three loops run here: the instruction reader, the outbound writer, and
//! the idle heartbeat. EOF on stdin means the orchestrator is gone; there is
//! nothing to reconnect to, so it is handled as a shutdown (the
//! orchestrator's auto-restart spawns a fresh process when it returns).

use shared::message::{Action, Message, MessagePayload};
use shared::worker::WorkerState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Mutable fields mirrored into heartbeats, updated by the action loop.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    pub current_model: Option<String>,
    pub vram_usage_mb: u64,
}

/// Read instructions from stdin and feed them to the action loop.
///
/// Anything that is not an instruction or a shutdown is noise on this pipe
/// and is logged away. EOF and read errors both convert into a shutdown
/// action so the worker always winds down cleanly.
pub async fn run_instruction_reader(worker_id: String, actions_tx: mpsc::Sender<Action>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let message: Message = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Unparseable message on stdin: {}", e);
                        continue;
                    }
                };

                // Per-worker queues make misdelivery impossible by
                // construction; a mismatch here means a routing bug upstream.
                if message.worker_id != worker_id {
                    warn!(
                        "Message {} addressed to {} arrived at {}",
                        message.message_id, message.worker_id, worker_id
                    );
                    continue;
                }

                match message.payload {
                    MessagePayload::Instruction { action } => {
                        debug!("Received instruction: {}", action.name());
                        if actions_tx.send(action).await.is_err() {
                            break;
                        }
                    }
                    MessagePayload::Shutdown => {
                        info!("Shutdown message received");
                        let _ = actions_tx.send(Action::Shutdown).await;
                        break;
                    }
                    other => {
                        debug!("Ignoring unexpected payload on stdin: {:?}", other);
                    }
                }
            }
            Ok(None) => {
                info!("stdin closed, orchestrator is gone");
                let _ = actions_tx.send(Action::Shutdown).await;
                break;
            }
            Err(e) => {
                warn!("stdin read failed: {}", e);
                let _ = actions_tx.send(Action::Shutdown).await;
                break;
            }
        }
    }

    debug!("Instruction reader stopped");
}

/// Drain the outbound channel onto stdout, one JSON line per message.
/// Stops when every sender is dropped, which flushes the final messages.
pub async fn run_message_writer(mut outbound_rx: mpsc::Receiver<Message>) {
    let mut stdout = tokio::io::stdout();

    while let Some(message) = outbound_rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            warn!("stdout write failed: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!("stdout flush failed: {}", e);
            break;
        }
    }

    debug!("Message writer stopped");
}

/// Send a heartbeat every `interval_secs` while the worker is idle. A busy
/// worker's liveness is visible through its status traffic instead.
pub async fn run_heartbeat_loop(
    worker_id: String,
    outbound_tx: mpsc::Sender<Message>,
    busy: Arc<AtomicBool>,
    state: Arc<Mutex<HeartbeatState>>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    // The first tick fires immediately; skip it so registration goes first.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if busy.load(Ordering::Relaxed) {
            continue;
        }

        let (current_model, vram_usage_mb) = {
            let state = state.lock().expect("heartbeat state lock poisoned");
            (state.current_model.clone(), state.vram_usage_mb)
        };

        let message = Message::new(
            worker_id.clone(),
            MessagePayload::Heartbeat {
                state: WorkerState::Idle,
                current_model,
                vram_usage_mb,
            },
        );
        if outbound_tx.send(message).await.is_err() {
            break;
        }
    }
}
