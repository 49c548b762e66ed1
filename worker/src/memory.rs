//! Model-memory state machine for one device
//!
//! Weights move `disk -> RAM staging -> VRAM`. The staging copy exists only
//! to make the device upload restartable; promoting to VRAM releases it
//! before the operation reports success, so both copies are never resident at
//! once. `clean_vram` reclaims transient allocations between tasks and never
//! evicts the model itself.

use anyhow::{bail, Context, Result};
use shared::task::ModelInfo;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Device-resident pipelines below this size get a conventional VRAM
/// estimate instead; a quantized single-file checkpoint understates what the
/// expanded pipeline occupies.
const MIN_MEASURED_VRAM_MB: u64 = 1000;

/// Conventional VRAM footprint of an SDXL-class pipeline in half precision.
const ESTIMATED_PIPELINE_VRAM_MB: u64 = 5500;

/// Fixed per-inference transient overhead on top of the latent buffers.
const RESIDUAL_BASE_MB: u64 = 32;

/// A model staged in host RAM.
#[derive(Debug, Clone)]
struct StagedModel {
    name: String,
    size_mb: u64,
}

/// A model resident in device memory.
#[derive(Debug, Clone)]
struct ResidentModel {
    name: String,
    vram_usage_mb: u64,
}

/// Outcome of a RAM staging load.
#[derive(Debug, Clone)]
pub struct RamLoadStats {
    pub model_name: String,
    pub ram_usage_mb: u64,
    pub duration_secs: f64,
}

/// Outcome of a VRAM promotion.
#[derive(Debug, Clone)]
pub struct VramLoadStats {
    pub vram_usage_mb: u64,
    pub duration_secs: f64,
}

/// The per-device memory manager.
pub struct ModelMemory {
    device_id: u32,
    staged: Option<StagedModel>,
    resident: Option<ResidentModel>,
    /// Transient device memory accumulated by inferences since the last
    /// cleanup.
    residual_mb: u64,
}

impl ModelMemory {
    pub fn new(device_id: u32) -> Self {
        info!("Memory manager initialized for device {}", device_id);
        Self {
            device_id,
            staged: None,
            resident: None,
            residual_mb: 0,
        }
    }

    /// The model this worker currently holds, resident copy first.
    pub fn current_model(&self) -> Option<&str> {
        self.resident
            .as_ref()
            .map(|m| m.name.as_str())
            .or_else(|| self.staged.as_ref().map(|m| m.name.as_str()))
    }

    /// The VRAM-resident model, required for inference.
    pub fn resident_model(&self) -> Option<&str> {
        self.resident.as_ref().map(|m| m.name.as_str())
    }

    /// Current device-memory estimate: resident pipeline plus residuals.
    pub fn vram_usage_mb(&self) -> u64 {
        self.resident
            .as_ref()
            .map(|m| m.vram_usage_mb)
            .unwrap_or(0)
            + self.residual_mb
    }

    /// Host staging estimate.
    pub fn ram_usage_mb(&self) -> u64 {
        self.staged.as_ref().map(|m| m.size_mb).unwrap_or(0)
    }

    /// Stage a model's weights from disk into host RAM.
    ///
    /// Any previous staging copy is dropped first. The weight file must
    /// exist; its size feeds the memory estimates.
    pub fn load_model_to_ram(&mut self, model: &ModelInfo) -> Result<RamLoadStats> {
        let start = Instant::now();

        self.clear_ram();

        let path = PathBuf::from(&model.path);
        if !path.exists() {
            bail!("Model path not found: {}", path.display());
        }
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat model file {}", path.display()))?;
        if !metadata.is_file() {
            bail!("Model path is not a file: {}", path.display());
        }

        let size_mb = (metadata.len() / (1024 * 1024)).max(1);
        info!(
            "Loading model {} to RAM ({} MB) on device {}",
            model.name, size_mb, self.device_id
        );

        self.staged = Some(StagedModel {
            name: model.name.clone(),
            size_mb,
        });

        Ok(RamLoadStats {
            model_name: model.name.clone(),
            ram_usage_mb: size_mb,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Promote the staged weights to device memory.
    ///
    /// The host staging copy is released before this returns success; the
    /// state afterwards is exactly one resident copy.
    pub fn load_model_from_ram_to_vram(&mut self) -> Result<VramLoadStats> {
        let start = Instant::now();

        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => bail!("No model staged in RAM to transfer to VRAM"),
        };

        let vram_usage_mb = if staged.size_mb < MIN_MEASURED_VRAM_MB {
            ESTIMATED_PIPELINE_VRAM_MB
        } else {
            staged.size_mb
        };

        info!(
            "Model {} moved to VRAM on device {} ({} MB), staging released",
            staged.name, self.device_id, vram_usage_mb
        );

        self.resident = Some(ResidentModel {
            name: staged.name,
            vram_usage_mb,
        });

        Ok(VramLoadStats {
            vram_usage_mb,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Drop the host staging copy. Returns whether anything was dropped.
    pub fn clear_ram(&mut self) -> bool {
        if self.staged.take().is_some() {
            debug!("RAM staging cleared on device {}", self.device_id);
            true
        } else {
            false
        }
    }

    /// Drop the device-resident pipeline and its residuals.
    pub fn clear_vram(&mut self) -> bool {
        self.residual_mb = 0;
        if self.resident.take().is_some() {
            debug!("VRAM cleared on device {}", self.device_id);
            true
        } else {
            false
        }
    }

    /// Reclaim transient device memory between tasks. The resident model is
    /// never evicted here. Returns the amount reclaimed.
    pub fn clean_vram(&mut self) -> u64 {
        let cleaned = self.residual_mb;
        self.residual_mb = 0;
        if cleaned > 0 {
            debug!(
                "VRAM cleanup freed {} MB on device {}",
                cleaned, self.device_id
            );
        }
        cleaned
    }

    /// Account for the transient allocations one inference leaves behind.
    pub fn note_inference_residuals(&mut self, width: u32, height: u32) {
        let latents_mb = (width as u64 * height as u64 * 16) / (1024 * 1024);
        self.residual_mb += latents_mb + RESIDUAL_BASE_MB;
    }
}
