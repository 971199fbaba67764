//! Render session configuration.
//!
//! Loaded from JSON (every field optional) and then overridden from the
//! command line. [`RenderConfig::validate`] reports the fatal configuration
//! errors before any buffer is allocated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::balance::InitialOrder;
use crate::film::{AccumulatePolicy, ToneMap};
use crate::util::{Error, Result};
use crate::work::{LaneLayout, PADDING_COORD};

/// Distribution of the anti-aliasing jitter applied to primary rays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AaNoise {
    /// Uniform in [-1, 1].
    Uniform,
    /// Standard normal.
    #[default]
    Normal,
    /// Standard normal truncated at 3 sigma.
    TruncatedNormal,
}

impl std::str::FromStr for AaNoise {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "normal" => Ok(Self::Normal),
            "truncated-normal" => Ok(Self::TruncatedNormal),
            other => Err(Error::config(format!("invalid AA noise type: {other}"))),
        }
    }
}

/// Settings for one render session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    // Output
    pub outfile: PathBuf,
    pub width: u32,
    pub height: u32,
    pub save_interval: u32,

    // Lanes
    pub lanes: usize,
    /// Derived from the pixel count when absent.
    pub items_per_lane: Option<usize>,

    // Sampling
    pub samples: u32,
    pub samples_per_step: u32,
    pub interactive_samples: u32,
    pub seed: u64,
    pub aa_noise: AaNoise,
    pub aa_noise_scale: f32,

    // Work distribution
    pub load_balancing: bool,
    pub initial_order: InitialOrder,

    // Camera / environment (degrees)
    pub fov: f32,
    pub env_rotation: f32,

    // Tone mapping
    pub exposure: f32,
    pub gamma: f32,
    pub accumulate: AccumulatePolicy,

    // Path tracing
    pub max_path_length: u32,
    pub roulette_depth: u16,
    pub stop_prob: f32,
    pub refractive_index: f32,

    pub max_batch_retries: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            outfile: PathBuf::from("render.png"),
            width: 256,
            height: 256,
            save_interval: 4000,
            lanes: 1472,
            items_per_lane: None,
            samples: 1_000_000,
            samples_per_step: 1,
            interactive_samples: 1,
            seed: 1,
            aa_noise: AaNoise::Normal,
            aa_noise_scale: 0.1,
            load_balancing: false,
            initial_order: InitialOrder::Shuffled,
            fov: 90.0,
            env_rotation: 0.0,
            exposure: 0.0,
            gamma: 2.2,
            accumulate: AccumulatePolicy::Average,
            max_path_length: 10,
            roulette_depth: 3,
            stop_prob: 0.3,
            refractive_index: 1.5,
            max_batch_retries: 3,
        }
    }
}

impl RenderConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Config file in the user's config directory, if one exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("lanetrace").join("render.json"))
            .filter(|p| p.exists())
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations that cannot start a session.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::config("image dimensions must be non-zero"));
        }
        if self.width >= PADDING_COORD as u32 || self.height >= PADDING_COORD as u32 {
            return Err(Error::config(format!(
                "image dimensions must be below {PADDING_COORD}"
            )));
        }
        if self.samples_per_step == 0 || self.interactive_samples == 0 {
            return Err(Error::config("samples per step must be non-zero"));
        }
        if self.samples_per_step > u16::MAX as u32 || self.interactive_samples > u16::MAX as u32 {
            return Err(Error::config(format!(
                "samples per step must not exceed {}",
                u16::MAX
            )));
        }
        if self.samples == 0 {
            return Err(Error::config("samples per pixel must be non-zero"));
        }
        if self.save_interval == 0 {
            return Err(Error::config("save interval must be non-zero"));
        }
        if self.gamma <= 0.0 {
            return Err(Error::config("gamma must be positive"));
        }
        if !(0.0..=1.0).contains(&self.stop_prob) {
            return Err(Error::config("stop probability must be in [0, 1]"));
        }
        if self.max_path_length == 0 || self.max_path_length > u16::MAX as u32 {
            return Err(Error::config("max path length out of range"));
        }
        // Overwrite films read the per-item u16 sample total
        if self.accumulate == AccumulatePolicy::Overwrite && self.rounded_samples() > u16::MAX as u32 {
            return Err(Error::config(format!(
                "overwrite accumulation supports at most {} samples per pixel",
                u16::MAX
            )));
        }
        let layout = self.layout()?;
        let pixels = self.pixels();
        if layout.len() < pixels {
            return Err(Error::config(format!(
                "{} lanes x {} items cannot hold {pixels} pixels",
                layout.lanes, layout.items_per_lane
            )));
        }
        Ok(())
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Lane partition of the work buffer.
    pub fn layout(&self) -> Result<LaneLayout> {
        match self.items_per_lane {
            Some(n) => LaneLayout::new(self.lanes, n),
            None => LaneLayout::for_pixels(self.pixels(), self.lanes),
        }
    }

    /// Total samples per pixel, rounded up to a whole number of steps.
    pub fn rounded_samples(&self) -> u32 {
        round_samples_per_pixel(self.samples, self.samples_per_step)
    }

    /// Number of batches in a full render.
    pub fn steps(&self) -> u32 {
        self.rounded_samples() / self.samples_per_step.max(1)
    }

    pub fn tone_map(&self) -> ToneMap {
        ToneMap::new(self.exposure, self.gamma)
    }
}

/// Round `samples` up to the next multiple of `per_step`.
pub fn round_samples_per_pixel(samples: u32, per_step: u32) -> u32 {
    if per_step == 0 || samples % per_step == 0 {
        return samples;
    }
    let rounded = samples.saturating_add(per_step - samples % per_step);
    info!("Rounding SPP to next multiple of {per_step} (rounded SPP := {rounded})");
    rounded
}
