//! Tests for the model-memory state machine

use super::write_model_file;
use crate::memory::ModelMemory;
use shared::task::ModelInfo;
use tempfile::TempDir;

fn model_info(name: &str, path: &std::path::Path) -> ModelInfo {
    ModelInfo {
        name: name.to_string(),
        path: path.to_string_lossy().into_owned(),
        size_mb: None,
        last_used: None,
        usage_count: 0,
    }
}

#[test]
fn test_load_missing_model_file_fails() {
    let mut memory = ModelMemory::new(0);
    let info = ModelInfo {
        name: "ghost".to_string(),
        path: "/nonexistent/ghost.safetensors".to_string(),
        size_mb: None,
        last_used: None,
        usage_count: 0,
    };

    let result = memory.load_model_to_ram(&info);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("not found"));
    assert!(memory.current_model().is_none());
}

#[test]
fn test_staging_then_promotion_releases_ram_copy() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_model_file(&temp_dir, "model_a");
    let mut memory = ModelMemory::new(0);

    let stats = memory.load_model_to_ram(&model_info("model_a", &path)).unwrap();
    assert_eq!(stats.model_name, "model_a");
    assert!(stats.ram_usage_mb >= 1);
    assert_eq!(memory.current_model(), Some("model_a"));
    assert!(memory.resident_model().is_none());
    assert!(memory.ram_usage_mb() >= 1);

    let stats = memory.load_model_from_ram_to_vram().unwrap();
    assert!(stats.vram_usage_mb > 0);
    // The contract: the staging copy is gone once promotion reports success.
    assert_eq!(memory.ram_usage_mb(), 0);
    assert_eq!(memory.resident_model(), Some("model_a"));
    assert_eq!(memory.vram_usage_mb(), stats.vram_usage_mb);
}

#[test]
fn test_promotion_without_staging_fails() {
    let mut memory = ModelMemory::new(0);
    let result = memory.load_model_from_ram_to_vram();
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("No model staged"));
}

#[test]
fn test_clear_operations() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_model_file(&temp_dir, "model_a");
    let mut memory = ModelMemory::new(0);

    memory.load_model_to_ram(&model_info("model_a", &path)).unwrap();
    assert!(memory.clear_ram());
    assert!(!memory.clear_ram());
    assert!(memory.current_model().is_none());

    memory.load_model_to_ram(&model_info("model_a", &path)).unwrap();
    memory.load_model_from_ram_to_vram().unwrap();
    assert!(memory.clear_vram());
    assert!(memory.resident_model().is_none());
    assert_eq!(memory.vram_usage_mb(), 0);
}

#[test]
fn test_clean_vram_reclaims_residuals_but_keeps_model() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_model_file(&temp_dir, "model_a");
    let mut memory = ModelMemory::new(0);

    memory.load_model_to_ram(&model_info("model_a", &path)).unwrap();
    let resident = memory.load_model_from_ram_to_vram().unwrap().vram_usage_mb;

    memory.note_inference_residuals(832, 1216);
    memory.note_inference_residuals(832, 1216);
    assert!(memory.vram_usage_mb() > resident);

    let cleaned = memory.clean_vram();
    assert!(cleaned > 0);
    // The resident pipeline survives the cleanup.
    assert_eq!(memory.resident_model(), Some("model_a"));
    assert_eq!(memory.vram_usage_mb(), resident);

    // Nothing left to reclaim.
    assert_eq!(memory.clean_vram(), 0);
}

#[test]
fn test_restaging_replaces_previous_staging() {
    let temp_dir = TempDir::new().unwrap();
    let path_a = write_model_file(&temp_dir, "model_a");
    let path_b = write_model_file(&temp_dir, "model_b");
    let mut memory = ModelMemory::new(0);

    memory.load_model_to_ram(&model_info("model_a", &path_a)).unwrap();
    memory.load_model_to_ram(&model_info("model_b", &path_b)).unwrap();
    assert_eq!(memory.current_model(), Some("model_b"));
}
