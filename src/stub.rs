//! Deterministic stand-in components.
//!
//! These implement the model traits with cheap tensor arithmetic so the full
//! control structure (placement, scheduling, the denoise loop, safety
//! gating, persistence) can run end to end without the real networks. The
//! stub flow follows the straight rectified-flow path towards the encoded
//! conditioning image, so a full denoise reproduces (roughly) the input.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use tracing::debug;

use crate::error::Result;
use crate::model::{Conditioning, FlowModel, ImageAutoencoder, NsfwClassifier, TextEncoder};
use crate::pipeline::Components;

/// Spatial compression factor of the stub autoencoder.
pub const LATENT_SCALE: usize = 8;

const TXT_DIM: usize = 64;

/// Observable side effects of the stub flow model, for assertions.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub warmed: Vec<(usize, usize)>,
    pub quantized: Vec<String>,
    pub compile_cache_bytes: Option<usize>,
    pub steps: usize,
}

pub struct StubTextEncoder {
    device: Device,
}

impl StubTextEncoder {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl TextEncoder for StubTextEncoder {
    fn encode_text(&mut self, prompt: &str) -> Result<Tensor> {
        // Fold the prompt bytes into a fixed-width embedding.
        let mut data = vec![0f32; TXT_DIM];
        for (i, b) in prompt.bytes().enumerate() {
            data[i % TXT_DIM] += f32::from(b) / 255.0;
        }
        Ok(Tensor::from_vec(data, (1, TXT_DIM), &self.device)?)
    }

    fn move_to(&mut self, device: &Device) -> Result<()> {
        debug!(?device, "text encoder placement");
        self.device = device.clone();
        Ok(())
    }
}

pub struct StubAutoencoder {
    device: Device,
}

impl StubAutoencoder {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl ImageAutoencoder for StubAutoencoder {
    fn encode_image(&mut self, image: &DynamicImage) -> Result<Tensor> {
        let rgb = image.to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let mut data = Vec::with_capacity(3 * height * width);
        for c in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let px = rgb.get_pixel(x as u32, y as u32);
                    data.push(f32::from(px[c]) / 127.5 - 1.0);
                }
            }
        }
        let pixels = Tensor::from_vec(data, (1, 3, height, width), &self.device)?;
        Ok(pixels.avg_pool2d(LATENT_SCALE)?)
    }

    fn decode_latent(&mut self, latent: &Tensor) -> Result<DynamicImage> {
        let latent = latent.to_device(&Device::Cpu)?;
        let (_b, _c, lh, lw) = latent.dims4()?;
        let (height, width) = (lh * LATENT_SCALE, lw * LATENT_SCALE);
        let upsampled = latent.upsample_nearest2d(height, width)?;
        let bytes = upsampled
            .clamp(-1f64, 1f64)?
            .affine(127.5, 127.5)?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?;
        let mut img = RgbImage::new(width as u32, height as u32);
        let plane = height * width;
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                img.put_pixel(
                    x as u32,
                    y as u32,
                    image::Rgb([bytes[i], bytes[plane + i], bytes[2 * plane + i]]),
                );
            }
        }
        Ok(DynamicImage::ImageRgb8(img))
    }

    fn move_to(&mut self, device: &Device) -> Result<()> {
        debug!(?device, "autoencoder placement");
        self.device = device.clone();
        Ok(())
    }
}

pub struct StubFlow {
    device: Device,
    stats: Arc<Mutex<FlowStats>>,
}

impl StubFlow {
    pub fn new(device: &Device) -> (Self, Arc<Mutex<FlowStats>>) {
        let stats = Arc::new(Mutex::new(FlowStats::default()));
        (
            Self {
                device: device.clone(),
                stats: stats.clone(),
            },
            stats,
        )
    }

    /// The parameter names the stub pretends to own; shaped like the real
    /// transformer's so the quantization filter has something to bite on.
    pub fn parameter_names() -> Vec<String> {
        let mut names = Vec::new();
        for i in 0..2 {
            names.push(format!("double_blocks.{i}.img_attn.qkv.weight"));
            names.push(format!("single_blocks.{i}.linear1.weight"));
            names.push(format!("single_blocks.{i}.linear2.weight"));
            names.push(format!("single_blocks.{i}.norm.weight"));
        }
        names.push("final_layer.linear.weight".to_string());
        names
    }
}

impl FlowModel for StubFlow {
    fn denoise_step(
        &self,
        latent: &Tensor,
        t_curr: f64,
        t_prev: f64,
        conditioning: &Conditioning,
        guidance: f64,
    ) -> Result<Tensor> {
        // Straight path towards the conditioning latent, nudged by a
        // prompt-derived bias scaled with guidance.
        let bias = f64::from(conditioning.txt.mean_all()?.to_scalar::<f32>()?) * guidance * 1e-3;
        let target = (&conditioning.img_cond + bias)?;
        let velocity = ((latent - &target)? / t_curr)?;
        let next = (latent + (velocity * (t_prev - t_curr))?)?;
        self.stats.lock().unwrap().steps += 1;
        Ok(next)
    }

    fn move_to(&mut self, device: &Device) -> Result<()> {
        debug!(?device, "flow model placement");
        self.device = device.clone();
        Ok(())
    }

    fn warm_up(&mut self, width: usize, height: usize) -> Result<()> {
        self.stats.lock().unwrap().warmed.push((width, height));
        Ok(())
    }

    fn quantize(&mut self, filter: &dyn Fn(&str) -> bool) -> Result<()> {
        let hit: Vec<String> = Self::parameter_names()
            .into_iter()
            .filter(|n| filter(n))
            .collect();
        self.stats.lock().unwrap().quantized = hit;
        Ok(())
    }

    fn load_compile_cache(&mut self, artifact: &[u8]) -> Result<()> {
        self.stats.lock().unwrap().compile_cache_bytes = Some(artifact.len());
        Ok(())
    }

    fn expected_weight_keys(&self) -> Option<Vec<String>> {
        Some(Self::parameter_names())
    }
}

/// Classifier with a fixed verdict.
pub struct StubClassifier {
    reject: bool,
}

impl StubClassifier {
    pub fn permissive() -> Self {
        Self { reject: false }
    }

    pub fn rejecting() -> Self {
        Self { reject: true }
    }
}

impl NsfwClassifier for StubClassifier {
    fn classify(&self, _image: &DynamicImage) -> Result<bool> {
        Ok(self.reject)
    }
}

/// A full set of stub components plus the flow-model stats handle.
pub fn components(device: &Device) -> (Components, Arc<Mutex<FlowStats>>) {
    let (flow, stats) = StubFlow::new(device);
    (
        Components {
            text_encoder: Box::new(StubTextEncoder::new(device)),
            autoencoder: Box::new(StubAutoencoder::new(device)),
            flow: Box::new(flow),
            classifier: Box::new(StubClassifier::permissive()),
        },
        stats,
    )
}
