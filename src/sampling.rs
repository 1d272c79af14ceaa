//! Sampling options, the fixed aspect-ratio table, seeded noise, and the
//! sequential denoise loop.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, TryRngCore};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::model::{Conditioning, FlowModel};
use crate::variant::ModelVariant;

/// Dimensions must stay on this grid for the latent packing to line up.
pub const DIM_MULTIPLE: usize = 16;

/// One latent token covers a 16x16 pixel patch.
pub fn image_seq_len(width: usize, height: usize) -> usize {
    (width / DIM_MULTIPLE) * (height / DIM_MULTIPLE)
}

/// Target resolution for a named aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    /// Fixed (width, height).
    Fixed(usize, usize),
    /// Derive the resolution from the conditioning image.
    MatchInput,
}

/// The fixed table of supported ratios, width/height pairs tuned to roughly
/// one megapixel, plus the match-input sentinel.
pub const ASPECT_RATIOS: &[(&str, AspectRatio)] = &[
    ("1:1", AspectRatio::Fixed(1024, 1024)),
    ("16:9", AspectRatio::Fixed(1328, 800)),
    ("21:9", AspectRatio::Fixed(1568, 672)),
    ("3:2", AspectRatio::Fixed(1248, 832)),
    ("2:3", AspectRatio::Fixed(832, 1248)),
    ("4:5", AspectRatio::Fixed(944, 1104)),
    ("5:4", AspectRatio::Fixed(1104, 944)),
    ("3:4", AspectRatio::Fixed(880, 1184)),
    ("4:3", AspectRatio::Fixed(1184, 880)),
    ("9:16", AspectRatio::Fixed(800, 1328)),
    ("9:21", AspectRatio::Fixed(672, 1568)),
    ("match_input_image", AspectRatio::MatchInput),
];

pub fn lookup_aspect_ratio(name: &str) -> Option<AspectRatio> {
    ASPECT_RATIOS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, r)| *r)
}

pub fn aspect_ratio_names() -> impl Iterator<Item = &'static str> {
    ASPECT_RATIOS.iter().map(|(n, _)| *n)
}

/// Everything one generation request needs, mutable across interactive turns.
///
/// `seed` is consumed by each run: it is cleared back to `None` so the next
/// run draws a fresh random seed unless the user sets one again.
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub img_cond_path: String,
}

impl SamplingOptions {
    pub fn new(variant: ModelVariant, prompt: &str, img_cond_path: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            width: None,
            height: None,
            num_steps: variant.default_steps(),
            guidance: variant.default_guidance(),
            seed: None,
            img_cond_path: img_cond_path.to_string(),
        }
    }

    /// Explicit dimensions must sit on the 16-pixel grid. Both unset means
    /// "match the conditioning image"; a lone height derives the width from
    /// the conditioning image's aspect ratio.
    pub fn validate(&self) -> Result<()> {
        if self.width.is_some() && self.height.is_none() {
            return Err(Error::InvalidOptions(
                "width cannot be set without a height".into(),
            ));
        }
        for dim in [self.width, self.height].into_iter().flatten() {
            if dim == 0 {
                return Err(Error::InvalidOptions("resolution must be non-zero".into()));
            }
            if dim % DIM_MULTIPLE != 0 {
                return Err(Error::InvalidOptions(format!(
                    "resolution ({dim}) must be a multiple of {DIM_MULTIPLE}"
                )));
            }
        }
        if self.num_steps == 0 {
            return Err(Error::InvalidOptions("num_steps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Draw a fresh seed from the operating system's entropy source.
pub fn draw_seed() -> Result<u64> {
    let mut rng = rand::rngs::OsRng;
    rng.try_next_u64()
        .map_err(|e| Error::InvalidOptions(format!("failed to draw seed from OS entropy: {e}")))
}

/// Deterministic standard-normal noise tensor for a given seed.
pub fn seeded_noise(seed: u64, shape: &[usize], device: &Device) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Run the denoise loop over consecutive timestep pairs.
///
/// Strictly sequential: each step consumes the latent produced by the
/// previous one, so there is no valid reordering or parallelism here.
pub fn denoise(
    model: &dyn FlowModel,
    mut latent: Tensor,
    conditioning: &Conditioning,
    timesteps: &[f64],
    guidance: f64,
) -> Result<Tensor> {
    for pair in timesteps.windows(2) {
        let (t_curr, t_prev) = (pair[0], pair[1]);
        latent = model.denoise_step(&latent, t_curr, t_prev, conditioning, guidance)?;
    }
    Ok(latent)
}
