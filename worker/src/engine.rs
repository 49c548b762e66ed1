//! Inference engine for one device
//!
//! Executes a generation with fully pre-configured parameters and writes the
//! artifact to the shared output directory. The sampler itself is a
//! placeholder that synthesizes a deterministic seeded image; everything the
//! control plane observes (timing shape, artifact naming, seed handling,
//! no-model refusal) behaves like the real pipeline.

use anyhow::{bail, Context, Result};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::task::TaskParams;
use shared::utils::artifact_file_name;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Simulated compute cost per sampling step per megapixel.
const STEP_MS_PER_MEGAPIXEL: u64 = 4;

/// Largest output edge the pipeline accepts.
const MAX_DIMENSION: u32 = 4096;

/// Outcome of a finished generation.
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub output_path: String,
    pub seed: u64,
    pub duration_secs: f64,
}

pub struct InferenceEngine {
    worker_id: String,
    device_id: u32,
    output_dir: PathBuf,
}

impl InferenceEngine {
    /// Create the engine, ensuring the output directory exists.
    pub fn new(worker_id: String, device_id: u32, output_dir: PathBuf) -> Result<Self> {
        if !output_dir.exists() {
            std::fs::create_dir_all(&output_dir).with_context(|| {
                format!("Failed to create output directory {}", output_dir.display())
            })?;
        }
        info!("Inference engine initialized for device {}", device_id);
        Ok(Self {
            worker_id,
            device_id,
            output_dir,
        })
    }

    /// Run one generation. `resident_model` is the VRAM-resident model name;
    /// inference without one is refused.
    pub async fn run(
        &self,
        task_id: &str,
        params: &TaskParams,
        resident_model: Option<&str>,
    ) -> Result<InferenceOutcome> {
        let Some(model) = resident_model else {
            bail!("No model loaded");
        };

        if params.width == 0 || params.height == 0 {
            bail!("Invalid dimensions {}x{}", params.width, params.height);
        }
        if params.width > MAX_DIMENSION || params.height > MAX_DIMENSION {
            bail!(
                "Dimensions {}x{} exceed the maximum edge of {}",
                params.width,
                params.height,
                MAX_DIMENSION
            );
        }
        if params.steps == 0 {
            bail!("Steps must be at least 1");
        }

        let seed = params
            .seed
            .unwrap_or_else(|| rand::rng().random::<u32>() as u64);

        let start = Instant::now();
        debug!(
            "Running inference for task {} on device {} (model {}, seed {})",
            task_id, self.device_id, model, seed
        );

        // Stand-in for the sampler loop: cost scales with steps and pixels.
        let megapixels = (params.width as u64 * params.height as u64).div_ceil(1_000_000);
        let compute_ms = params.steps as u64 * STEP_MS_PER_MEGAPIXEL * megapixels.max(1);
        sleep(Duration::from_millis(compute_ms)).await;

        let image = render_png(params.width, params.height, seed)?;

        let file_name = artifact_file_name(
            &self.worker_id,
            task_id,
            params.width,
            params.height,
            seed,
        );
        let output_path = self.output_dir.join(file_name);
        tokio::fs::write(&output_path, &image)
            .await
            .with_context(|| format!("Failed to write artifact {}", output_path.display()))?;

        let duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Task {} generated {} in {:.2}s",
            task_id,
            output_path.display(),
            duration_secs
        );

        Ok(InferenceOutcome {
            output_path: output_path.to_string_lossy().into_owned(),
            seed,
            duration_secs,
        })
    }
}

/// Synthesize a valid RGB PNG deterministically from the seed.
fn render_png(width: u32, height: u32, seed: u64) -> Result<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);

    // One filter byte per scanline, then RGB. A coordinate gradient mixed
    // with seeded noise keeps the output stable per seed but visibly varied.
    let mut raw = Vec::with_capacity((height as usize) * (1 + width as usize * 3));
    for y in 0..height {
        raw.push(0u8);
        let gy = ((y as u64 * 255) / height.max(1) as u64) as u8;
        for x in 0..width {
            let gx = ((x as u64 * 255) / width.max(1) as u64) as u8;
            let noise: u8 = rng.random();
            raw.push(gx ^ (noise >> 2));
            raw.push(gy ^ (noise >> 3));
            raw.push(gx.wrapping_add(gy) ^ (noise >> 4));
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(&raw)
        .context("Failed to compress image data")?;
    let idat = encoder.finish().context("Failed to finish image stream")?;

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    // 8-bit depth, color type 2 (truecolor), default compression/filter, no
    // interlace.
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);

    let mut png = Vec::with_capacity(idat.len() + 64);
    png.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    write_chunk(&mut png, b"IHDR", &ihdr);
    write_chunk(&mut png, b"IDAT", &idat);
    write_chunk(&mut png, b"IEND", &[]);
    Ok(png)
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);

    let mut crc = Crc::new();
    crc.update(kind);
    crc.update(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
}
