//! Utility types shared by every module.
//!
//! - [`Error`] / [`Result`] - Error handling

mod error;

pub use error::*;
