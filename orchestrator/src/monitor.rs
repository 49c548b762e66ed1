//! System resource snapshots for health readback
//!
//! A supervised loop samples host memory and the queue counters into
//! `system_metrics`, and mirrors each worker's VRAM estimate into
//! `worker_metrics`. The orchestrator has no GPU probe of its own, so the
//! probe-only gauges stay NULL.

use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::store::{Store, SystemMetricsSnapshot, WorkerMetricsSnapshot};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct SystemMonitor {
    store: Arc<Mutex<Store>>,
    queue: Arc<Mutex<TaskQueue>>,
    registry: Arc<Mutex<WorkerRegistry>>,
    system: System,
}

impl SystemMonitor {
    pub fn new(
        store: Arc<Mutex<Store>>,
        queue: Arc<Mutex<TaskQueue>>,
        registry: Arc<Mutex<WorkerRegistry>>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            system: System::new(),
        }
    }

    /// Sample once and persist the snapshots.
    pub async fn collect_and_store(&mut self) {
        self.system.refresh_memory();

        let total = self.system.total_memory() as f64;
        let used = self.system.used_memory() as f64;
        let available = self.system.available_memory() as f64;

        let task_stats = self.queue.lock().await.stats();

        let snapshot = SystemMetricsSnapshot {
            total_ram_gb: total / BYTES_PER_GB,
            used_ram_gb: used / BYTES_PER_GB,
            available_ram_gb: available / BYTES_PER_GB,
            ram_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
            active_tasks: task_stats.active_tasks,
            queued_tasks: task_stats.queued_tasks,
            completed_tasks: task_stats.completed_tasks,
        };

        let workers = self.registry.lock().await.snapshot();

        let mut store = self.store.lock().await;
        if let Err(e) = store.insert_system_metrics(&snapshot).await {
            warn!("Failed to store system metrics: {}", e);
            return;
        }

        for entry in workers {
            let worker_snapshot = WorkerMetricsSnapshot {
                worker_id: entry.worker_id.clone(),
                vram_used_mb: entry.vram_usage_mb,
                vram_total_mb: None,
                gpu_utilization_percent: None,
                temperature_celsius: None,
                power_usage_watts: None,
            };
            if let Err(e) = store.insert_worker_metrics(&worker_snapshot).await {
                warn!(
                    "Failed to store worker metrics for {}: {}",
                    entry.worker_id, e
                );
            }
        }

        debug!(
            "Stored system metrics ({:.1}% RAM, {} queued, {} active)",
            snapshot.ram_percent, snapshot.queued_tasks, snapshot.active_tasks
        );
    }
}
