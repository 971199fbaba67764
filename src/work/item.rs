//! Fixed-size per-pixel work record.
//!
//! Flat `#[repr(C)]` layout so a lane segment can be streamed to a device
//! as raw bytes:
//! - 4 bytes pixel coordinate
//! - 12 bytes RGB contribution
//! - 4 bytes statistics

use bytemuck::{Pod, Zeroable};

/// Coordinate value marking a padding item (no real pixel).
pub const PADDING_COORD: u16 = u16::MAX;

/// One pixel's path tracing job and its accumulated result.
///
/// `color` is the radiance sum of the `sample_count` samples traced since
/// the item was last cleared; both keep growing across batches until then.
/// `path_length` covers the latest batch only and is rewritten every batch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WorkItem {
    pub pixel_column: u16,
    pub pixel_row: u16,
    pub color: [f32; 3],
    pub sample_count: u16,
    pub path_length: u16,
}

const _: () = assert!(std::mem::size_of::<WorkItem>() == 20);

impl WorkItem {
    /// Padding item, inserted to make lane segments equal length.
    pub const PADDING: Self = Self {
        pixel_column: PADDING_COORD,
        pixel_row: PADDING_COORD,
        color: [0.0; 3],
        sample_count: 0,
        path_length: 0,
    };

    /// Work item for a pixel with cleared accumulators.
    pub fn new(column: u16, row: u16) -> Self {
        Self {
            pixel_column: column,
            pixel_row: row,
            ..Self::zeroed()
        }
    }

    /// True if this item carries no real pixel.
    #[inline]
    pub fn is_padding(&self) -> bool {
        self.pixel_column == PADDING_COORD && self.pixel_row == PADDING_COORD
    }

    /// Cost used for load balancing. Padding is free.
    #[inline]
    pub fn cost(&self) -> u64 {
        if self.is_padding() {
            0
        } else {
            self.path_length as u64
        }
    }

    /// Pixel coordinate, or `None` for padding.
    #[inline]
    pub fn pixel(&self) -> Option<(u16, u16)> {
        if self.is_padding() {
            None
        } else {
            Some((self.pixel_column, self.pixel_row))
        }
    }

    /// Zero color and statistics, keeping the pixel coordinate.
    #[inline]
    pub fn clear(&mut self) {
        self.color = [0.0; 3];
        self.sample_count = 0;
        self.path_length = 0;
    }
}

impl Default for WorkItem {
    fn default() -> Self {
        Self::PADDING
    }
}
