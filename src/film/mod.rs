//! Persistent HDR accumulation buffer.
//!
//! The film lives for one render session. Every host task merges the
//! previous batch into it; saves and previews read a tone-mapped copy.

mod export;

pub use export::hdr_path;

use image::{Rgb32FImage, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::work::WorkItem;

/// How batch results are merged into the film.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccumulatePolicy {
    /// The device keeps a running radiance sum and sample count in each item;
    /// the film copies the latest pair in and divides on read.
    Overwrite,
    /// The device returns a per-batch radiance sum plus its sample count;
    /// the film keeps the running per-pixel mean.
    #[default]
    Average,
}

/// Exposure and gamma applied when quantizing to 8 bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMap {
    /// Exposure compensation in stops (scale = 2^exposure).
    pub exposure: f32,
    pub gamma: f32,
}

impl Default for ToneMap {
    fn default() -> Self {
        Self {
            exposure: 0.0,
            gamma: 2.2,
        }
    }
}

impl ToneMap {
    pub fn new(exposure: f32, gamma: f32) -> Self {
        Self { exposure, gamma }
    }

    /// Map one linear channel value to a display byte.
    #[inline]
    pub fn quantize(&self, value: f32) -> u8 {
        let scaled = value * self.exposure.exp2();
        let inv_gamma = if self.gamma > 0.0 { 1.0 / self.gamma } else { 1.0 };
        let display = scaled.max(0.0).powf(inv_gamma);
        (display.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

/// Accumulated image for one render session.
#[derive(Debug, Clone)]
pub struct Film {
    width: u32,
    height: u32,
    policy: AccumulatePolicy,
    /// Linear RGB, row-major. Running means under `Average`, the latest
    /// device sums under `Overwrite`.
    hdr: Vec<[f32; 3]>,
    /// Samples behind each `hdr` entry.
    samples: Vec<u32>,
}

impl Film {
    /// Zeroed film for a `width` x `height` image.
    pub fn new(width: u32, height: u32, policy: AccumulatePolicy) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            policy,
            hdr: vec![[0.0; 3]; len],
            samples: vec![0; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn policy(&self) -> AccumulatePolicy {
        self.policy
    }

    #[inline]
    fn index(&self, column: u32, row: u32) -> Option<usize> {
        if column < self.width && row < self.height {
            Some(row as usize * self.width as usize + column as usize)
        } else {
            None
        }
    }

    /// Current linear value of a pixel.
    pub fn pixel(&self, column: u32, row: u32) -> Option<[f32; 3]> {
        self.index(column, row)
            .map(|i| radiance(self.policy, self.hdr[i], self.samples[i]))
    }

    /// Samples behind the current value of a pixel.
    pub fn sample_count(&self, column: u32, row: u32) -> Option<u32> {
        self.index(column, row).map(|i| self.samples[i])
    }

    /// Merge a finished batch into the film.
    ///
    /// Padding and any other out-of-bounds coordinates are skipped. Returns
    /// the number of items merged.
    #[tracing::instrument(skip_all, fields(items = batch.len()))]
    pub fn accumulate(&mut self, batch: &[WorkItem]) -> usize {
        let mut merged = 0;
        for item in batch {
            let Some(i) = self.index(item.pixel_column as u32, item.pixel_row as u32) else {
                continue;
            };
            let added = item.sample_count as u32;
            if added == 0 {
                continue;
            }
            match self.policy {
                AccumulatePolicy::Overwrite => {
                    self.hdr[i] = item.color;
                    self.samples[i] = added;
                }
                AccumulatePolicy::Average => {
                    let total = self.samples[i].saturating_add(added);
                    let weight = added as f32;
                    let px = &mut self.hdr[i];
                    for (old, &sum) in px.iter_mut().zip(item.color.iter()) {
                        *old += (sum - weight * *old) / total as f32;
                    }
                    self.samples[i] = total;
                }
            }
            merged += 1;
        }
        merged
    }

    /// 8-bit preview of the current buffer. Does not modify the film.
    pub fn tone_map(&self, tone: ToneMap) -> RgbImage {
        let mut ldr = RgbImage::new(self.width, self.height);
        ldr.par_chunks_mut(3)
            .zip(self.hdr.par_iter().zip(self.samples.par_iter()))
            .for_each(|(out, (&px, &n))| {
                let value = radiance(self.policy, px, n);
                for (o, &v) in out.iter_mut().zip(value.iter()) {
                    *o = tone.quantize(v);
                }
            });
        ldr
    }

    /// Normalized linear image.
    ///
    /// Averaged films are stored normalized. Overwrite films hold the sums
    /// of whichever buffer last reported a pixel, so each pixel is divided
    /// by the sample count that buffer carried.
    pub fn hdr_image(&self) -> Rgb32FImage {
        let mut hdr = Rgb32FImage::new(self.width, self.height);
        hdr.par_chunks_mut(3)
            .zip(self.hdr.par_iter().zip(self.samples.par_iter()))
            .for_each(|(out, (&px, &n))| {
                out.copy_from_slice(&radiance(self.policy, px, n));
            });
        hdr
    }

    /// Zero the film.
    pub fn reset(&mut self) {
        self.hdr.fill([0.0; 3]);
        self.samples.fill(0);
    }
}

#[inline]
fn radiance(policy: AccumulatePolicy, px: [f32; 3], samples: u32) -> [f32; 3] {
    match policy {
        AccumulatePolicy::Average => px,
        AccumulatePolicy::Overwrite if samples == 0 => [0.0; 3],
        AccumulatePolicy::Overwrite => {
            let inv = 1.0 / samples as f32;
            px.map(|c| c * inv)
        }
    }
}
