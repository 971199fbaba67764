//! # lanetrace
//!
//! Work distribution for lane-partitioned path tracing.
//!
//! A fixed number of compute lanes each process one contiguous segment of a
//! flat work buffer per batch. Two buffers alternate: while the device renders
//! one, a background host task merges the other into the film and reorders it
//! so that every lane gets roughly the same amount of work next time.
//!
//! ## Modules
//!
//! - [`util`] - Error type
//! - [`config`] - Render configuration (JSON, validation)
//! - [`work`] - Work items and the double-buffered work list
//! - [`balance`] - Initial assignment and rebalancing by path length
//! - [`film`] - HDR accumulation, tone mapping, PNG/EXR export
//! - [`host`] - Single-slot background task
//! - [`pipeline`] - Render loop, executor interface, remote control
//!
//! ## Example
//!
//! ```ignore
//! use lanetrace::prelude::*;
//!
//! let config = RenderConfig::load("render.json".as_ref())?;
//! let mut driver = PipelineDriver::new(config, SyntheticExecutor::new())?;
//! let summary = driver.run()?;
//! println!("{:.0} samples/sec", summary.samples_per_sec);
//! ```

pub mod util;
pub mod config;
pub mod work;
pub mod balance;
pub mod film;
pub mod host;
pub mod pipeline;

// Re-export commonly used types
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Error, Result};
    pub use crate::config::{AaNoise, RenderConfig};
    pub use crate::work::{LaneLayout, WorkItem, WorkList};
    pub use crate::balance::{InitialOrder, LoadBalancer};
    pub use crate::film::{AccumulatePolicy, Film, ToneMap};
    pub use crate::host::AsyncTask;
    pub use crate::pipeline::*;
}
