//! Double-buffered render pipeline.
//!
//! - [`PipelineDriver`] - render loop and restart handling
//! - [`ComputeExecutor`] - device interface, with [`SyntheticExecutor`] as a CPU implementation
//! - [`SharedControl`] / [`UiLink`] - inbound control state and outbound UI updates

mod control;
mod driver;
mod executor;
mod synthetic;

pub use control::{ControlState, ControlStatus, SharedControl, UiLink};
pub use driver::{Phase, PipelineDriver, RenderSummary, SAMPLE_COUNT_REVERSION_STEP};
pub use executor::{
    BatchError, BatchSettings, BatchStats, ComputeExecutor, SessionParams, AA_COMPONENTS,
};
pub use synthetic::SyntheticExecutor;
