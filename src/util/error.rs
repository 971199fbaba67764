//! Error types for the render pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
///
/// Every variant except [`Error::Image`] and [`Error::Io`] is fatal to a
/// render session. Image and I/O failures during periodic saves are logged
/// and skipped by the driver instead of being propagated.
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer swap would leave the device with nothing to process
    #[error("The new active work list is empty")]
    EmptyActiveBuffer,

    /// Work buffer cannot be split into equal lane segments
    #[error("Work buffer of {len} items does not divide evenly across {lanes} lanes")]
    LaneMismatch { len: usize, lanes: usize },

    /// Random-sample buffer cannot be split across workers
    #[error("Random sample buffer of {len} values does not divide evenly across {workers} workers")]
    SampleBufferMismatch { len: usize, workers: usize },

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Host task submitted while the previous one was not yet joined
    #[error("Async host task submitted before the previous task was awaited")]
    TaskInFlight,

    /// Film requested while the host task still owns it
    #[error("Film is still held by the async host task")]
    FilmInUse,

    /// Host task panicked before completing
    #[error("Async host task panicked")]
    TaskPanicked,

    /// Compute executor reported an unrecoverable failure
    #[error("Batch failed: {0}")]
    BatchFailed(String),

    /// Transient failures kept repeating for the same batch
    #[error("Batch still failing after {attempts} attempts")]
    BatchRetriesExhausted { attempts: u32 },

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file parse error
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for failures that only affect a single save or load.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Image(_) | Self::Io(_))
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::EmptyActiveBuffer;
        assert!(e.to_string().contains("empty"));

        let e = Error::LaneMismatch { len: 10, lanes: 3 };
        assert!(e.to_string().contains("10"));
        assert!(e.to_string().contains("3"));

        let e = Error::FilmInUse;
        assert!(e.to_string().contains("Film"));
        assert!(!e.to_string().contains("submitted"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_io());
        assert!(!Error::TaskInFlight.is_io());
    }
}
