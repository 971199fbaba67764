//! Double-buffered work list.

use tracing::trace;

use super::item::WorkItem;
use crate::util::{Error, Result};

/// Fixed lane partition of a flat work buffer.
///
/// Segment `i` (`items_per_lane` long, contiguous) is always dispatched to
/// lane `i`. Both values are fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneLayout {
    pub lanes: usize,
    pub items_per_lane: usize,
}

impl LaneLayout {
    /// Layout for `lanes` segments of `items_per_lane` items each.
    pub fn new(lanes: usize, items_per_lane: usize) -> Result<Self> {
        if lanes == 0 {
            return Err(Error::config("lane count must be non-zero"));
        }
        if items_per_lane == 0 {
            return Err(Error::config("items per lane must be non-zero"));
        }
        Ok(Self { lanes, items_per_lane })
    }

    /// Smallest layout over `lanes` that holds `pixels` items.
    pub fn for_pixels(pixels: usize, lanes: usize) -> Result<Self> {
        if lanes == 0 {
            return Err(Error::config("lane count must be non-zero"));
        }
        Self::new(lanes, pixels.div_ceil(lanes).max(1))
    }

    /// Total buffer length.
    #[inline]
    pub fn len(&self) -> usize {
        self.lanes * self.items_per_lane
    }

    /// Never true for a constructed layout.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index range of lane `lane`'s segment.
    #[inline]
    pub fn segment(&self, lane: usize) -> std::ops::Range<usize> {
        let start = lane * self.items_per_lane;
        start..start + self.items_per_lane
    }
}

/// Check that a buffer of `len` items splits into equal lane segments.
pub fn check_lane_divisible(len: usize, lanes: usize) -> Result<usize> {
    if lanes == 0 || len % lanes != 0 {
        return Err(Error::LaneMismatch { len, lanes });
    }
    Ok(len / lanes)
}

/// A double-buffered work list.
///
/// The active buffer is owned by the compute executor during a batch; the
/// inactive buffer holds the previous batch's results for host processing.
/// References returned by [`active`](Self::active) and
/// [`inactive`](Self::inactive) must not outlive the next [`swap`](Self::swap).
#[derive(Debug)]
pub struct WorkList {
    layout: LaneLayout,
    active: Vec<WorkItem>,
    inactive: Vec<WorkItem>,
}

impl WorkList {
    /// Two padding-filled buffers sized to `layout`.
    pub fn new(layout: LaneLayout) -> Self {
        Self {
            layout,
            active: vec![WorkItem::PADDING; layout.len()],
            inactive: vec![WorkItem::PADDING; layout.len()],
        }
    }

    pub fn layout(&self) -> LaneLayout {
        self.layout
    }

    pub fn active(&mut self) -> &mut [WorkItem] {
        &mut self.active
    }

    pub fn inactive(&mut self) -> &mut [WorkItem] {
        &mut self.inactive
    }

    /// Read-only view of the active buffer.
    pub fn active_items(&self) -> &[WorkItem] {
        &self.active
    }

    /// Read-only view of the inactive buffer.
    pub fn inactive_items(&self) -> &[WorkItem] {
        &self.inactive
    }

    /// Exchange the buffers without copying elements.
    ///
    /// Fails if the new active buffer is empty, which only happens when the
    /// inactive buffer was lent out with [`take_inactive`](Self::take_inactive)
    /// and never returned.
    pub fn swap(&mut self) -> Result<()> {
        std::mem::swap(&mut self.active, &mut self.inactive);
        if self.active.is_empty() {
            return Err(Error::EmptyActiveBuffer);
        }
        trace!("work list swapped");
        Ok(())
    }

    /// Move the inactive buffer out for exclusive use by a host task.
    ///
    /// The list holds an empty inactive buffer until
    /// [`restore_inactive`](Self::restore_inactive) is called.
    pub fn take_inactive(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.inactive)
    }

    /// Return a buffer previously taken with [`take_inactive`](Self::take_inactive).
    pub fn restore_inactive(&mut self, buffer: Vec<WorkItem>) -> Result<()> {
        if buffer.len() != self.layout.len() {
            return Err(Error::LaneMismatch {
                len: buffer.len(),
                lanes: self.layout.lanes,
            });
        }
        self.inactive = buffer;
        Ok(())
    }

    /// Copy the inactive buffer's layout into the active one.
    pub fn mirror_inactive(&mut self) {
        self.active.clone_from(&self.inactive);
    }
}
