//! Image export for the film.
//!
//! Every save writes two files:
//! - `<name>.<ext>` - tone-mapped 8-bit raster (format from the extension)
//! - `<name>.exr` - normalized linear float image

use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::debug;

use super::{Film, ToneMap};
use crate::util::Result;

/// Path of the HDR companion file for `path`.
pub fn hdr_path(path: &Path) -> PathBuf {
    path.with_extension("exr")
}

impl Film {
    /// Write the tone-mapped raster and the normalized HDR image.
    pub fn save(&self, path: &Path, tone: ToneMap) -> Result<()> {
        self.save_ldr(path, tone)?;
        self.save_hdr(&hdr_path(path))?;
        Ok(())
    }

    /// Write only the tone-mapped 8-bit raster.
    pub fn save_ldr(&self, path: &Path, tone: ToneMap) -> Result<()> {
        self.tone_map(tone).save(path)?;
        debug!("wrote {}", path.display());
        Ok(())
    }

    /// Write only the linear float image.
    pub fn save_hdr(&self, path: &Path) -> Result<()> {
        DynamicImage::ImageRgb32F(self.hdr_image()).save(path)?;
        debug!("wrote {}", path.display());
        Ok(())
    }
}
