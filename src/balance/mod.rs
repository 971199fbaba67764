//! Lane load balancing.
//!
//! Produces per-lane work assignments whose expected cost is roughly equal.
//! The cost of an item is the path length measured during the previous batch;
//! padding items cost nothing.
//!
//! ## Rebalance by cost
//! ```text
//! sorted by path length:  c0 c1 c2 ... e2 e1 e0
//!                         ^cheap          dear^
//! lane 0 <- c0, e0    lane 1 <- c1, e1    ...   (round-robin until cursors meet)
//! ```
//! Pairing the cheapest remaining item with the most expensive one on every
//! lane approximates a balanced partition in `O(n log n)`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::util::{Error, Result};
use crate::work::{check_lane_divisible, LaneLayout, WorkItem, WorkList, PADDING_COORD};

/// Order of the first work assignment, before any cost is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitialOrder {
    /// Pixels in row-major order, padding at the end.
    Raster,
    /// Seeded shuffle of the raster order, padding included.
    #[default]
    Shuffled,
}

/// Work assignment policy for one render session.
#[derive(Debug, Clone, Copy)]
pub struct LoadBalancer {
    layout: LaneLayout,
    order: InitialOrder,
    seed: u64,
}

impl LoadBalancer {
    pub fn new(layout: LaneLayout, order: InitialOrder, seed: u64) -> Self {
        Self { layout, order, seed }
    }

    pub fn layout(&self) -> LaneLayout {
        self.layout
    }

    /// Build a work list for a `width` x `height` image.
    ///
    /// Both buffers receive the same layout so either can be dispatched first.
    pub fn initial_work_list(&self, width: u32, height: u32) -> Result<WorkList> {
        let mut list = WorkList::new(self.layout);
        self.initialise(list.inactive(), width, height)?;
        list.mirror_inactive();
        debug!(
            lanes = self.layout.lanes,
            items_per_lane = self.layout.items_per_lane,
            order = ?self.order,
            "created work list"
        );
        Ok(list)
    }

    /// Fill `items` with one item per pixel followed by padding.
    pub fn initialise(&self, items: &mut [WorkItem], width: u32, height: u32) -> Result<()> {
        if width >= PADDING_COORD as u32 || height >= PADDING_COORD as u32 {
            return Err(Error::config(format!(
                "image {width}x{height} exceeds the maximum of {} pixels per side",
                PADDING_COORD - 1
            )));
        }
        let pixels = width as usize * height as usize;
        if pixels > items.len() {
            return Err(Error::config(format!(
                "{pixels} pixels do not fit in a work buffer of {} items",
                items.len()
            )));
        }

        let mut slot = items.iter_mut();
        for row in 0..height as u16 {
            for column in 0..width as u16 {
                if let Some(w) = slot.next() {
                    *w = WorkItem::new(column, row);
                }
            }
        }
        slot.for_each(|w| *w = WorkItem::PADDING);

        if self.order == InitialOrder::Shuffled {
            let mut rng = StdRng::seed_from_u64(self.seed);
            items.shuffle(&mut rng);
        }
        Ok(())
    }

    /// Reorder `items` in place by the path lengths they carry.
    #[tracing::instrument(skip_all, fields(items = items.len()))]
    pub fn rebalance(&self, items: &mut [WorkItem]) -> Result<()> {
        let before = cost_variance(items, self.layout.lanes)?;
        let balanced = allocate_work_by_path_length(items, self.layout.lanes)?;
        items.copy_from_slice(&balanced);
        let after = cost_variance(items, self.layout.lanes)?;
        debug!("lane cost variance {before:.1} -> {after:.1}");
        Ok(())
    }
}

/// Redistribute `items` across `lanes` equal segments by path length.
///
/// Output has the same length as the input and contains exactly the same
/// items; only their order changes. Equal-cost items keep their relative
/// order from the stable sort.
pub fn allocate_work_by_path_length(items: &[WorkItem], lanes: usize) -> Result<Vec<WorkItem>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let per_lane = check_lane_divisible(items.len(), lanes)?;

    let mut sorted = items.to_vec();
    sorted.par_sort_by_key(WorkItem::cost);
    trace!(
        cheapest = ?sorted.first().map(WorkItem::cost),
        dearest = ?sorted.last().map(WorkItem::cost),
        "sorted work list"
    );

    let mut groups: Vec<Vec<WorkItem>> = (0..lanes).map(|_| Vec::with_capacity(per_lane)).collect();
    // Unassigned items are sorted[cheap..dear]
    let mut cheap = 0;
    let mut dear = sorted.len();
    while cheap < dear {
        for group in groups.iter_mut() {
            if cheap >= dear {
                break;
            }
            if group.len() < per_lane {
                group.push(sorted[cheap]);
                cheap += 1;
            }
            if cheap >= dear {
                break;
            }
            if group.len() < per_lane {
                dear -= 1;
                group.push(sorted[dear]);
            }
        }
    }

    Ok(groups.concat())
}

/// Zero color and statistics of every item, padding included.
pub fn clear_accumulators(items: &mut [WorkItem]) {
    items.par_iter_mut().for_each(WorkItem::clear);
}

/// Sum of path lengths over non-padding items.
pub fn total_path_length(items: &[WorkItem]) -> u64 {
    items.par_iter().map(WorkItem::cost).sum()
}

/// Total cost per lane segment.
pub fn lane_costs(items: &[WorkItem], lanes: usize) -> Result<Vec<u64>> {
    if items.is_empty() {
        return Ok(vec![0; lanes]);
    }
    let per_lane = check_lane_divisible(items.len(), lanes)?;
    Ok(items
        .par_chunks(per_lane)
        .map(|segment| segment.iter().map(WorkItem::cost).sum())
        .collect())
}

/// Population variance of the per-lane costs.
pub fn cost_variance(items: &[WorkItem], lanes: usize) -> Result<f64> {
    let costs = lane_costs(items, lanes)?;
    if costs.is_empty() {
        return Ok(0.0);
    }
    let n = costs.len() as f64;
    let mean = costs.iter().map(|&c| c as f64).sum::<f64>() / n;
    Ok(costs.iter().map(|&c| (c as f64 - mean).powi(2)).sum::<f64>() / n)
}
