use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flux_kontext::interactive::{self, LineSource, ScriptedSource, StdinSource};
use flux_kontext::output::OutputFormat;
use flux_kontext::pipeline::{Components, Pipeline, PipelineConfig, QuantMode, WeightPaths};
use flux_kontext::sampling::{lookup_aspect_ratio, AspectRatio, SamplingOptions};
use flux_kontext::stub;
use flux_kontext::variant::ModelVariant;
use flux_kontext::weights::{Fetcher, LoadMode, AE_WEIGHTS, TRANSFORMER_WEIGHTS};
use flux_kontext::Error;

#[derive(Parser, Debug)]
#[command(version, about = "Prompt-driven image editing")]
struct Args {
    /// Model variant to run, flux-dev or flux-schnell.
    #[arg(long, default_value = "flux-dev")]
    name: String,

    /// Image to edit.
    #[arg(long)]
    img_cond_path: String,

    /// Initial edit instruction.
    #[arg(long, default_value = "replace the background with a starry sky")]
    prompt: String,

    /// Output aspect ratio, one of the named ratios or match_input_image.
    #[arg(long, default_value = "match_input_image")]
    aspect_ratio: String,

    /// Seed for the first generation; later runs draw fresh seeds.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of denoising steps; defaults per variant.
    #[arg(long)]
    num_steps: Option<usize>,

    /// Guidance strength; defaults per variant.
    #[arg(long)]
    guidance: Option<f64>,

    /// Keep prompting for further edits after the first image.
    #[arg(long = "loop")]
    interactive: bool,

    /// Run on CPU rather than the accelerator.
    #[arg(long)]
    cpu: bool,

    /// Shuttle components between the CPU and the accelerator so only the
    /// active stage holds accelerator memory.
    #[arg(long)]
    offload: bool,

    /// Quantize the transformer's single-stream linears to fp8.
    #[arg(long)]
    fp8: bool,

    /// Fail instead of warning when checkpoint keys do not match the model.
    #[arg(long)]
    strict_weights: bool,

    #[arg(long)]
    disable_safety_checker: bool,

    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// jpg, png or webp.
    #[arg(long, default_value = "jpg")]
    output_format: String,

    /// Quality for the lossy output formats, 0-100.
    #[arg(long, default_value_t = 80)]
    quality: u8,

    /// Use a local transformer checkpoint instead of downloading.
    #[arg(long)]
    transformer_path: Option<PathBuf>,

    /// Use a local autoencoder checkpoint instead of downloading.
    #[arg(long)]
    ae_path: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    compile_cache_dir: PathBuf,

    /// Read interactive commands from this file instead of stdin.
    #[arg(long)]
    script: Option<PathBuf>,
}

fn weight_paths(args: &Args) -> Result<WeightPaths> {
    let fetcher = Fetcher::new();
    let transformer = match &args.transformer_path {
        Some(path) => path.clone(),
        None => fetcher.ensure_source(&TRANSFORMER_WEIGHTS)?,
    };
    let ae = match &args.ae_path {
        Some(path) => path.clone(),
        None => fetcher.ensure_source(&AE_WEIGHTS)?,
    };
    Ok(WeightPaths { transformer, ae })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let variant = ModelVariant::from_name(&args.name)?;
    let format: OutputFormat = args.output_format.parse()?;
    interactive::validate_img_cond_path(&args.img_cond_path)?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    info!(?device, variant = variant.name(), "starting");

    let weights = weight_paths(&args)?;

    let mut opts = SamplingOptions::new(variant, &args.prompt, &args.img_cond_path);
    match lookup_aspect_ratio(&args.aspect_ratio) {
        Some(AspectRatio::Fixed(w, h)) => {
            opts.width = Some(w);
            opts.height = Some(h);
        }
        Some(AspectRatio::MatchInput) => {}
        None => {
            anyhow::bail!(
                "unknown aspect ratio {:?}, choose from: {}",
                args.aspect_ratio,
                flux_kontext::sampling::aspect_ratio_names()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
    opts.seed = args.seed;
    if let Some(steps) = args.num_steps {
        opts.num_steps = steps;
    }
    if let Some(guidance) = args.guidance {
        opts.guidance = guidance;
    }

    let config = PipelineConfig {
        variant,
        offload: args.offload,
        quant_mode: if args.fp8 { QuantMode::Fp8 } else { QuantMode::None },
        load_mode: if args.strict_weights {
            LoadMode::Strict
        } else {
            LoadMode::Lenient
        },
        safety_checker: !args.disable_safety_checker,
        output_dir: args.output_dir.clone(),
        output_format: format,
        quality: args.quality,
        compile_cache_dir: args.compile_cache_dir.clone(),
    };

    let (components, _flow_stats): (Components, _) = stub::components(&device);
    let mut pipeline = Pipeline::new(config, components, device, Some(&weights))?;

    let mut source: Box<dyn LineSource> = match &args.script {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Box::new(ScriptedSource::new(text.lines().map(str::to_string)))
        }
        None => Box::new(StdinSource),
    };

    loop {
        match pipeline.run(&mut opts) {
            Ok(out) => println!(
                "Saved {} ({}x{}, seed {})",
                out.path.display(),
                out.width,
                out.height,
                out.seed
            ),
            Err(e @ Error::AllOutputsRejected) if args.interactive => eprintln!("{e}"),
            Err(e) => return Err(e.into()),
        }
        if !args.interactive {
            break;
        }
        if !interactive::read_options(source.as_mut(), &mut opts)? {
            break;
        }
        if !interactive::read_img_cond_path(source.as_mut(), &mut opts)? {
            break;
        }
    }
    Ok(())
}
