//! Trait seams for the external model components.
//!
//! The networks themselves live outside this crate: anything that can encode
//! text, encode/decode images, predict a denoising step and classify NSFW
//! content can drive the pipeline. All components are movable between the
//! CPU and the accelerator so the orchestrator can serialize stages under
//! memory pressure.

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::error::Result;

/// Conditioning state prepared once per request and threaded through every
/// denoise step.
pub struct Conditioning {
    /// Encoded prompt.
    pub txt: Tensor,
    /// Encoded conditioning image latent.
    pub img_cond: Tensor,
}

/// Prompt encoder.
pub trait TextEncoder {
    fn encode_text(&mut self, prompt: &str) -> Result<Tensor>;

    /// Synchronous placement move; blocks until the component lives on
    /// `device`.
    fn move_to(&mut self, device: &Device) -> Result<()>;
}

/// Image encoder/decoder pair.
pub trait ImageAutoencoder {
    fn encode_image(&mut self, image: &DynamicImage) -> Result<Tensor>;

    fn decode_latent(&mut self, latent: &Tensor) -> Result<DynamicImage>;

    fn move_to(&mut self, device: &Device) -> Result<()>;

    /// Move only the decoder half. Components that cannot split just move
    /// everything.
    fn move_decoder_to(&mut self, device: &Device) -> Result<()> {
        self.move_to(device)
    }
}

/// The denoising network.
pub trait FlowModel {
    /// Advance the latent from `t_curr` to `t_prev` by one external step.
    fn denoise_step(
        &self,
        latent: &Tensor,
        t_curr: f64,
        t_prev: f64,
        conditioning: &Conditioning,
        guidance: f64,
    ) -> Result<Tensor>;

    fn move_to(&mut self, device: &Device) -> Result<()>;

    /// Force any deferred compilation for the given resolution to happen
    /// now rather than on the first real request.
    fn warm_up(&mut self, _width: usize, _height: usize) -> Result<()> {
        Ok(())
    }

    /// Apply a selective quantization transform to the weight groups the
    /// filter accepts. Default: no quantization support.
    fn quantize(&mut self, _filter: &dyn Fn(&str) -> bool) -> Result<()> {
        Ok(())
    }

    /// Ingest a previously saved compiled-execution artifact. The blob is
    /// opaque to the orchestrator.
    fn load_compile_cache(&mut self, _artifact: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Tensor names this model expects in its checkpoint, if it can
    /// enumerate them. Used for the lenient/strict key verification.
    fn expected_weight_keys(&self) -> Option<Vec<String>> {
        None
    }
}

/// NSFW image classifier; `true` means the image should be withheld.
pub trait NsfwClassifier {
    fn classify(&self, image: &DynamicImage) -> Result<bool>;
}
