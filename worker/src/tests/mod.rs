//! Test modules for the worker crate

mod engine_tests;
mod memory_tests;

use shared::config::NodeConfig;
use tempfile::TempDir;

/// A config whose paths all live inside the given temp directory.
pub(crate) fn test_config(temp_dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.paths.model_dir = temp_dir.path().join("models").to_string_lossy().into_owned();
    config.paths.output_dir = temp_dir.path().join("outputs").to_string_lossy().into_owned();
    config.paths.log_dir = temp_dir.path().join("logs").to_string_lossy().into_owned();
    config.store.data_dir = temp_dir.path().join("data").to_string_lossy().into_owned();
    config
}

/// Write a fake weight file and return its path.
pub(crate) fn write_model_file(temp_dir: &TempDir, name: &str) -> std::path::PathBuf {
    let models = temp_dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    let path = models.join(format!("{}.safetensors", name));
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    path
}
