//! Image editing with a rectified-flow transformer.
//!
//! This crate hosts the orchestration around the networks: weight fetching
//! and verification, the timestep schedule, the denoise loop, CPU/accelerator
//! placement, the NSFW gate and output persistence. The networks themselves
//! plug in behind the traits in [`model`]; deterministic stand-ins live in
//! [`stub`].

pub mod error;
pub mod interactive;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod safety;
pub mod sampling;
pub mod schedule;
pub mod stub;
pub mod variant;
pub mod weights;

pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineConfig, QuantMode, RunOutput, WeightPaths};
pub use sampling::SamplingOptions;
pub use variant::ModelVariant;
