//! Compute executor interface.
//!
//! The executor runs one batch over a lane-partitioned work buffer and
//! returns once every lane has finished. It is the only writer of the
//! active buffer's statistics while a batch is in flight.

use std::path::Path;

use thiserror::Error;

use crate::config::{AaNoise, RenderConfig};
use crate::util::{Error, Result};
use crate::work::{check_lane_divisible, LaneLayout, WorkItem};

/// Random values per work item used for anti-aliasing jitter (x, y).
pub const AA_COMPONENTS: usize = 2;

/// Static per-session parameters handed to the executor at setup.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub width: u32,
    pub height: u32,
    pub layout: LaneLayout,
    pub aa_noise: AaNoise,
    pub aa_noise_scale: f32,
    pub max_path_length: u16,
    pub roulette_depth: u16,
    pub stop_prob: f32,
    pub refractive_index: f32,
    pub seed: u64,
}

impl SessionParams {
    pub fn from_config(config: &RenderConfig) -> Result<Self> {
        Ok(Self {
            width: config.width,
            height: config.height,
            layout: config.layout()?,
            aa_noise: config.aa_noise,
            aa_noise_scale: config.aa_noise_scale,
            max_path_length: config.max_path_length.min(u16::MAX as u32) as u16,
            roulette_depth: config.roulette_depth,
            stop_prob: config.stop_prob,
            refractive_index: config.refractive_index,
            seed: config.seed,
        })
    }

    /// Length of the anti-aliasing noise buffer.
    pub fn aa_noise_len(&self) -> usize {
        AA_COMPONENTS * self.layout.len()
    }

    /// Check the work buffer splits over `lanes` and the noise buffer over
    /// `noise_workers`.
    pub fn check_divisible(&self, lanes: usize, noise_workers: usize) -> Result<()> {
        check_lane_divisible(self.layout.len(), lanes)?;
        let noise = self.aa_noise_len();
        if noise_workers == 0 || noise % noise_workers != 0 {
            return Err(Error::SampleBufferMismatch {
                len: noise,
                workers: noise_workers,
            });
        }
        Ok(())
    }
}

/// Per-batch render settings.
///
/// The driver refreshes camera and environment values only at the start of a
/// render and when the interactive sample count reverts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSettings {
    /// Samples per pixel taken in this batch.
    pub samples: u16,
    pub fov_radians: f32,
    pub env_rotation_radians: f32,
}

/// Counters reported by a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Ray segments traced across all lanes.
    pub rays: u64,
}

/// Failure of a single batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// The batch may be retried; the buffer was left unchanged.
    #[error("transient batch failure: {0}")]
    Transient(String),
    /// The executor cannot continue.
    #[error("fatal batch failure: {0}")]
    Fatal(String),
}

/// Executes path tracing batches over lane segments.
///
/// `execute` is all-or-nothing: on `Err` the buffer contents must be exactly
/// as they were before the call.
pub trait ComputeExecutor {
    /// Prepare for a session. Rejects buffer shapes the executor cannot split.
    fn configure(&mut self, params: &SessionParams) -> Result<()>;

    /// Run one batch. Segment `i` of `batch` is processed by lane `i`.
    fn execute(
        &mut self,
        batch: &mut [WorkItem],
        settings: &BatchSettings,
    ) -> std::result::Result<BatchStats, BatchError>;

    /// Replace the environment lighting asset. On error the previous
    /// environment stays in use.
    fn load_environment(&mut self, path: &Path) -> Result<()> {
        let _ = path;
        Ok(())
    }
}

impl<E: ComputeExecutor + ?Sized> ComputeExecutor for Box<E> {
    fn configure(&mut self, params: &SessionParams) -> Result<()> {
        (**self).configure(params)
    }

    fn execute(
        &mut self,
        batch: &mut [WorkItem],
        settings: &BatchSettings,
    ) -> std::result::Result<BatchStats, BatchError> {
        (**self).execute(batch, settings)
    }

    fn load_environment(&mut self, path: &Path) -> Result<()> {
        (**self).load_environment(path)
    }
}
