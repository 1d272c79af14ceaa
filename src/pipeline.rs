//! Generation orchestrator.
//!
//! The pipeline owns the model components and runs the full lifecycle of a
//! request: validate, prepare conditioning, schedule, denoise, decode, gate,
//! persist. With offloading enabled only the component needed by the current
//! stage sits on the accelerator; everything else waits on the CPU.

use std::fs;
use std::path::PathBuf;

use candle_core::Device;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{Conditioning, FlowModel, ImageAutoencoder, NsfwClassifier, TextEncoder};
use crate::output::{self, OutputFormat};
use crate::safety::SafetyGate;
use crate::sampling::{
    denoise, draw_seed, image_seq_len, seeded_noise, AspectRatio, SamplingOptions, ASPECT_RATIOS,
    DIM_MULTIPLE,
};
use crate::schedule::get_schedule;
use crate::variant::ModelVariant;
use crate::weights::{verify_weight_keys, LoadMode};

/// The pluggable model components driving a pipeline.
pub struct Components {
    pub text_encoder: Box<dyn TextEncoder>,
    pub autoencoder: Box<dyn ImageAutoencoder>,
    pub flow: Box<dyn FlowModel>,
    pub classifier: Box<dyn NsfwClassifier>,
}

/// Transformer quantization mode. Each mode keeps its own compiled-execution
/// cache since the compiled graphs are not interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    None,
    Fp8,
}

impl QuantMode {
    pub fn compile_cache_file(&self) -> &'static str {
        match self {
            QuantMode::None => "compile-cache-kontext.bin",
            QuantMode::Fp8 => "compile-cache-kontext-fp8.bin",
        }
    }
}

/// Selects the weight groups quantized in fp8 mode: the two big linear
/// layers of every single-stream block. Attention and modulation stay at
/// full precision.
pub fn fp8_quant_filter(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("single_blocks.") else {
        return false;
    };
    let Some((_, layer)) = rest.split_once('.') else {
        return false;
    };
    layer.starts_with("linear1") || layer.starts_with("linear2")
}

/// Resolved locations of the checkpoint files.
pub struct WeightPaths {
    pub transformer: PathBuf,
    pub ae: PathBuf,
}

pub struct PipelineConfig {
    pub variant: ModelVariant,
    pub offload: bool,
    pub quant_mode: QuantMode,
    pub load_mode: LoadMode,
    pub safety_checker: bool,
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub quality: u8,
    /// Directory holding the per-quant-mode compile caches.
    pub compile_cache_dir: PathBuf,
}

/// One finished generation.
#[derive(Debug)]
pub struct RunOutput {
    pub path: PathBuf,
    pub seed: u64,
    pub width: usize,
    pub height: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    device: Device,
    text_encoder: Box<dyn TextEncoder>,
    autoencoder: Box<dyn ImageAutoencoder>,
    flow: Box<dyn FlowModel>,
    gate: SafetyGate,
}

impl Pipeline {
    /// Assembles the pipeline: restores the compile cache if one exists,
    /// applies quantization, and checks the checkpoint keys against what the
    /// flow model expects.
    pub fn new(
        config: PipelineConfig,
        components: Components,
        device: Device,
        weights: Option<&WeightPaths>,
    ) -> Result<Self> {
        let Components {
            text_encoder,
            autoencoder,
            mut flow,
            classifier,
        } = components;

        let cache_path = config
            .compile_cache_dir
            .join(config.quant_mode.compile_cache_file());
        match fs::read(&cache_path) {
            Ok(artifact) => {
                info!(path = %cache_path.display(), bytes = artifact.len(), "loading compile cache");
                flow.load_compile_cache(&artifact)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %cache_path.display(),
                    "compile cache not found, first runs will be slower"
                );
            }
            Err(e) => return Err(e.into()),
        }

        if config.quant_mode == QuantMode::Fp8 {
            info!("quantizing single-stream linear layers to fp8");
            flow.quantize(&fp8_quant_filter)?;
        }

        if let (Some(expected), Some(paths)) = (flow.expected_weight_keys(), weights) {
            if paths.transformer.is_file() {
                let report =
                    verify_weight_keys(&paths.transformer, &expected, config.load_mode)?;
                if report.is_clean() {
                    info!(path = %paths.transformer.display(), "checkpoint keys verified");
                }
            }
        }

        let gate = SafetyGate::new(classifier, config.safety_checker);
        let mut pipeline = Self {
            config,
            device,
            text_encoder,
            autoencoder,
            flow,
            gate,
        };
        pipeline.warm_up()?;
        Ok(pipeline)
    }

    /// Pre-compiles the flow model for every fixed aspect ratio so no
    /// request ever hits cold compilation. Runs once at construction.
    fn warm_up(&mut self) -> Result<()> {
        for (name, ratio) in ASPECT_RATIOS {
            let AspectRatio::Fixed(w, h) = ratio else {
                continue;
            };
            info!(ratio = name, width = w, height = h, "warming up");
            self.flow.warm_up(*w, *h)?;
        }
        Ok(())
    }

    /// Runs one generation. Consumes `opts.seed` so each run draws fresh
    /// entropy unless the caller sets a seed again.
    pub fn run(&mut self, opts: &mut SamplingOptions) -> Result<RunOutput> {
        opts.validate()?;

        let cond_image = image::open(&opts.img_cond_path)?;
        let (width, height) = resolve_dimensions(
            opts.width,
            opts.height,
            cond_image.width() as usize,
            cond_image.height() as usize,
        );
        // The conditioning latent sets the generation's shape, so the image
        // must be brought to the target resolution before encoding.
        let cond_image =
            if (cond_image.width() as usize, cond_image.height() as usize) != (width, height) {
                cond_image.resize_exact(
                    width as u32,
                    height as u32,
                    image::imageops::FilterType::Lanczos3,
                )
            } else {
                cond_image
            };

        let seed = match opts.seed.take() {
            Some(seed) => seed,
            None => draw_seed()?,
        };
        info!(seed, prompt = %opts.prompt, "generating");

        let cpu = Device::Cpu;
        if self.config.offload {
            self.text_encoder.move_to(&self.device)?;
            self.autoencoder.move_to(&self.device)?;
        }
        let conditioning = Conditioning {
            txt: self.text_encoder.encode_text(&opts.prompt)?,
            img_cond: self.autoencoder.encode_image(&cond_image)?,
        };
        if self.config.offload {
            self.text_encoder.move_to(&cpu)?;
            self.autoencoder.move_to(&cpu)?;
            self.flow.move_to(&self.device)?;
        }

        let seq_len = image_seq_len(width, height);
        let timesteps = get_schedule(
            opts.num_steps,
            seq_len,
            self.config.variant.shifted_schedule(),
        );
        info!(
            width,
            height,
            seq_len,
            steps = opts.num_steps,
            guidance = opts.guidance,
            "denoising"
        );

        let noise = seeded_noise(seed, conditioning.img_cond.dims(), &self.device)?;
        let latent = denoise(
            self.flow.as_ref(),
            noise,
            &conditioning,
            &timesteps,
            opts.guidance,
        )?;

        if self.config.offload {
            self.flow.move_to(&cpu)?;
            self.autoencoder.move_decoder_to(&self.device)?;
        }
        let image = self.autoencoder.decode_latent(&latent)?;
        if self.config.offload {
            self.autoencoder.move_to(&cpu)?;
        }

        let kept = self.gate.filter(vec![image])?;
        let Some(image) = kept.into_iter().next() else {
            return Err(Error::AllOutputsRejected);
        };

        let idx = output::next_index(&self.config.output_dir)?;
        let path = output::indexed_filename(&self.config.output_dir, idx, self.config.output_format);
        output::save_image(&image, &path, self.config.output_format, self.config.quality)?;
        info!(path = %path.display(), "saved");

        Ok(RunOutput {
            path,
            seed,
            width,
            height,
        })
    }
}

fn round_to_grid(v: usize) -> usize {
    DIM_MULTIPLE.max(DIM_MULTIPLE * (v / DIM_MULTIPLE))
}

/// Final output resolution: explicit values win, a lone height keeps the
/// conditioning image's aspect ratio, nothing set means the conditioning
/// image's own size snapped to the grid.
pub fn resolve_dimensions(
    width: Option<usize>,
    height: Option<usize>,
    img_width: usize,
    img_height: usize,
) -> (usize, usize) {
    match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (None, Some(h)) => (round_to_grid(img_width * h / img_height), h),
        (Some(w), None) => (w, round_to_grid(img_height * w / img_width)),
        (None, None) => (round_to_grid(img_width), round_to_grid(img_height)),
    }
}
