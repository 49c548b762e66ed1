//! Tests for the inference engine

use crate::engine::InferenceEngine;
use shared::task::TaskParams;
use tempfile::TempDir;

fn engine(temp_dir: &TempDir) -> InferenceEngine {
    InferenceEngine::new(
        "worker_0".to_string(),
        0,
        temp_dir.path().join("outputs"),
    )
    .unwrap()
}

fn params(width: u32, height: u32, steps: u32, seed: Option<u64>) -> TaskParams {
    TaskParams {
        prompt: "a cat".to_string(),
        width,
        height,
        steps,
        seed,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_inference_without_model_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);

    let result = engine.run("t1", &params(64, 64, 1, Some(1)), None).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("No model loaded"));
}

#[tokio::test]
async fn test_invalid_parameters_are_refused() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);

    for bad in [
        params(0, 64, 1, Some(1)),
        params(64, 0, 1, Some(1)),
        params(64, 64, 0, Some(1)),
        params(8192, 64, 1, Some(1)),
    ] {
        assert!(engine.run("t1", &bad, Some("model_a")).await.is_err());
    }
}

#[tokio::test]
async fn test_artifact_name_and_content() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);

    let outcome = engine
        .run("task_1", &params(64, 48, 2, Some(42)), Some("model_a"))
        .await
        .unwrap();

    assert_eq!(outcome.seed, 42);
    assert!(outcome.output_path.ends_with("worker_0_task_1_64x48_s42.png"));
    assert!(outcome.duration_secs > 0.0);

    let bytes = std::fs::read(&outcome.output_path).unwrap();
    // PNG signature and chunk framing.
    assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    assert_eq!(&bytes[12..16], b"IHDR");
    assert_eq!(&bytes[bytes.len() - 8..bytes.len() - 4], b"IEND");
}

#[tokio::test]
async fn test_same_seed_renders_identical_artifacts() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);

    let a = engine
        .run("t_a", &params(32, 32, 1, Some(7)), Some("model_a"))
        .await
        .unwrap();
    let b = engine
        .run("t_b", &params(32, 32, 1, Some(7)), Some("model_a"))
        .await
        .unwrap();
    let c = engine
        .run("t_c", &params(32, 32, 1, Some(8)), Some("model_a"))
        .await
        .unwrap();

    let bytes_a = std::fs::read(&a.output_path).unwrap();
    let bytes_b = std::fs::read(&b.output_path).unwrap();
    let bytes_c = std::fs::read(&c.output_path).unwrap();
    assert_eq!(bytes_a, bytes_b);
    assert_ne!(bytes_a, bytes_c);
}

#[tokio::test]
async fn test_random_seed_is_minted_when_absent() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);

    let outcome = engine
        .run("t1", &params(32, 32, 1, None), Some("model_a"))
        .await
        .unwrap();
    // The minted seed is surfaced and stamped into the filename.
    assert!(outcome
        .output_path
        .ends_with(&format!("worker_0_t1_32x32_s{}.png", outcome.seed)));
}
