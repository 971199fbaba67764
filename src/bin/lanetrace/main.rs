//! lanetrace CLI - render a procedural scene through the lane pipeline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use lanetrace::prelude::*;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("LANETRACE_BUILD_DATE"),
    ")"
);

/// Command-line options. Each one overrides the config file.
#[derive(Parser, Debug)]
#[command(name = "lanetrace", version, long_version = LONG_VERSION, about)]
struct Cli {
    /// JSON render config (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output image; an .exr is written next to it
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Total samples per pixel
    #[arg(short, long)]
    samples: Option<u32>,

    #[arg(long)]
    samples_per_step: Option<u32>,

    #[arg(long)]
    interactive_samples: Option<u32>,

    #[arg(long)]
    lanes: Option<usize>,

    #[arg(long)]
    items_per_lane: Option<usize>,

    /// Rebalance lanes by measured path length
    #[arg(long)]
    load_balancing: bool,

    /// Start from raster order instead of a shuffle
    #[arg(long)]
    raster: bool,

    /// Copy device values into the film instead of averaging
    #[arg(long)]
    overwrite: bool,

    /// Save every N steps
    #[arg(long)]
    save_interval: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    /// uniform, normal or truncated-normal
    #[arg(long)]
    aa_noise: Option<AaNoise>,

    #[arg(long)]
    aa_noise_scale: Option<f32>,

    /// Field of view in degrees
    #[arg(long)]
    fov: Option<f32>,

    /// Environment rotation in degrees
    #[arg(long)]
    env_rotation: Option<f32>,

    #[arg(long)]
    exposure: Option<f32>,

    #[arg(long)]
    gamma: Option<f32>,

    #[arg(long)]
    max_path_length: Option<u32>,

    /// Environment asset to load before rendering
    #[arg(long)]
    environment: Option<PathBuf>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(&self, config: &mut RenderConfig) {
        if let Some(v) = &self.output {
            config.outfile = v.clone();
        }
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field {
                    config.$field = v;
                })*
            };
        }
        set!(
            width,
            height,
            samples,
            samples_per_step,
            interactive_samples,
            lanes,
            save_interval,
            seed,
            aa_noise,
            aa_noise_scale,
            fov,
            env_rotation,
            exposure,
            gamma,
            max_path_length
        );
        if self.items_per_lane.is_some() {
            config.items_per_lane = self.items_per_lane;
        }
        if self.load_balancing {
            config.load_balancing = true;
        }
        if self.raster {
            config.initial_order = InitialOrder::Raster;
        }
        if self.overwrite {
            config.accumulate = AccumulatePolicy::Overwrite;
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Console logging, plus a Chrome trace in `trace.json` when LANETRACE_TRACE=1.
#[cfg(feature = "chrome-trace")]
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let registry = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(false));

    if std::env::var("LANETRACE_TRACE").ok().as_deref() != Some("1") {
        registry.init();
        return None;
    }
    let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file("trace.json")
        .build();
    registry.with(chrome_layer).init();
    Some(guard)
}

#[cfg(not(feature = "chrome-trace"))]
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    #[allow(clippy::let_unit_value)]
    let _trace_guard = init_tracing(&cli.log_level);

    let config_path = cli.config.clone().or_else(RenderConfig::default_path);
    let mut config = match &config_path {
        Some(path) => RenderConfig::load(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => RenderConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("Invalid render configuration")?;

    if let Some(path) = &cli.write_config {
        config
            .save(path)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        info!("Wrote {}", path.display());
        return Ok(());
    }

    let mut executor = SyntheticExecutor::new();
    if let Some(path) = &cli.environment {
        if let Err(e) = executor.load_environment(path) {
            warn!("Could not load {}: {e}", path.display());
        }
    }

    let control = SharedControl::new(ControlState::from_config(&config));
    let on_interrupt = control.clone();
    ctrlc::set_handler(move || on_interrupt.stop()).context("Failed to install Ctrl+C handler")?;

    let outfile = config.outfile.clone();
    let mut driver = PipelineDriver::new(config, executor)?.with_control(control);
    let summary = driver.run().context("Render failed")?;

    println!(
        "{} {}/{} steps in {:.2}s ({:.0} samples/sec, {:.0} samples/sec/lane)",
        outfile.display(),
        summary.steps_completed,
        summary.total_steps,
        summary.elapsed.as_secs_f64(),
        summary.samples_per_sec,
        summary.samples_per_sec_per_lane
    );
    Ok(())
}
