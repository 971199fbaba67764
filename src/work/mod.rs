//! Work items and the double-buffered work list.
//!
//! ## Layout
//! ```text
//! | lane 0 segment | lane 1 segment | ... | lane N-1 segment |
//!   items_per_lane   items_per_lane         items_per_lane
//! ```
//! Rebalancing reorders items across segments; segment boundaries never move.

pub mod item;
pub mod list;

pub use item::{WorkItem, PADDING_COORD};
pub use list::{check_lane_divisible, LaneLayout, WorkList};
