//! Test modules for the orchestrator crate

mod bus_tests;
mod queue_tests;
mod scheduler_tests;
mod store_tests;

use crate::store::Store;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// Open and initialize a store in a fresh temp directory.
pub(crate) async fn test_store(temp_dir: &TempDir) -> Arc<Mutex<Store>> {
    let mut store = Store::new(temp_dir.path(), 5).unwrap();
    store.initialize().await.unwrap();
    Arc::new(Mutex::new(store))
}
