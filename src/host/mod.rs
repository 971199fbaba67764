//! Single-slot background executor for host-side batch processing.
//!
//! At most one unit of work is in flight. A new unit may only be submitted
//! once the previous one has been joined with
//! [`wait_for_completion`](AsyncTask::wait_for_completion). Work is never
//! cancelled; it always runs to completion.

use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::util::{Error, Result};

/// Handle to at most one background computation producing a `T`.
pub struct AsyncTask<T> {
    name: String,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Idle task whose worker threads are called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
        }
    }

    /// Start `work` on a background thread.
    ///
    /// Fails with [`Error::TaskInFlight`] if the previous submission has not
    /// been joined, even if it already finished.
    pub fn run<F>(&mut self, work: F) -> Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(Error::TaskInFlight);
        }
        let handle = thread::Builder::new().name(self.name.clone()).spawn(work)?;
        self.handle = Some(handle);
        trace!("{} started", self.name);
        Ok(())
    }

    /// Block until the last submitted work finishes and return its output.
    ///
    /// Returns `Ok(None)` when nothing is pending, including before the first
    /// [`run`](Self::run).
    pub fn wait_for_completion(&mut self) -> Result<Option<T>> {
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        trace!("waiting for {}", self.name);
        let output = handle.join().map_err(|_| Error::TaskPanicked)?;
        trace!("{} completed", self.name);
        Ok(Some(output))
    }

    /// Work was submitted and not yet joined.
    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }

    /// Submitted work is still executing.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<T> Drop for AsyncTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
