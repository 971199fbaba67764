//! Remote control state and outbound UI link.
//!
//! The transport (sockets, packet serialization, video encoding) lives
//! outside this crate. A transport writes inbound packets into a
//! [`SharedControl`] and receives outbound updates through [`UiLink`]:
//!
//! | packet | direction | effect |
//! |---|---|---|
//! | `stop` | in | leave the render loop |
//! | `detach` | in | drop the UI, keep rendering |
//! | `env_rotation`, `fov`, `load_nif` | in | restart the render |
//! | `exposure`, `gamma` | in | next tone map only |
//! | `progress`, `sample_rate`, `render_preview` | out | [`UiLink`] |

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbImage;
use parking_lot::Mutex;

use crate::config::RenderConfig;
use crate::film::ToneMap;

/// Snapshot of the remotely controlled render parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub env_rotation_degrees: f32,
    pub exposure: f32,
    pub gamma: f32,
    pub fov_degrees: f32,
    /// Environment asset to load on the next restart.
    pub new_model_path: Option<PathBuf>,
    pub stop: bool,
    pub detach: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::from_config(&RenderConfig::default())
    }
}

impl ControlState {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            env_rotation_degrees: config.env_rotation,
            exposure: config.exposure,
            gamma: config.gamma,
            fov_degrees: config.fov,
            new_model_path: None,
            stop: false,
            detach: false,
        }
    }

    pub fn tone_map(&self) -> ToneMap {
        ToneMap::new(self.exposure, self.gamma)
    }
}

/// What the driver does after consuming a changed control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Stop,
    Restart,
    Continue,
    Disconnected,
}

struct ControlInner {
    state: Mutex<ControlState>,
    changed: AtomicBool,
}

/// Thread-safe control state shared between a transport and the driver.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct SharedControl {
    inner: Arc<ControlInner>,
}

impl SharedControl {
    pub fn new(initial: ControlState) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                state: Mutex::new(initial),
                changed: AtomicBool::new(false),
            }),
        }
    }

    /// Has the state changed since it was last consumed?
    pub fn state_changed(&self) -> bool {
        self.inner.changed.load(Ordering::Acquire)
    }

    /// Copy of the state, marking it consumed and clearing any model request.
    pub fn consume(&self) -> ControlState {
        let mut state = self.inner.state.lock();
        let snapshot = state.clone();
        state.new_model_path = None;
        self.inner.changed.store(false, Ordering::Release);
        snapshot
    }

    /// Copy of the state without consuming it.
    pub fn snapshot(&self) -> ControlState {
        self.inner.state.lock().clone()
    }

    fn update(&self, restart: bool, f: impl FnOnce(&mut ControlState)) {
        f(&mut self.inner.state.lock());
        if restart {
            self.inner.changed.store(true, Ordering::Release);
        }
    }

    pub fn stop(&self) {
        self.update(true, |s| s.stop = true);
    }

    pub fn detach(&self) {
        self.update(true, |s| s.detach = true);
    }

    pub fn set_env_rotation(&self, degrees: f32) {
        self.update(true, |s| s.env_rotation_degrees = degrees);
    }

    pub fn set_fov(&self, degrees: f32) {
        self.update(true, |s| s.fov_degrees = degrees);
    }

    pub fn load_model(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.update(true, |s| s.new_model_path = Some(path));
    }

    /// Tone mapping happens on the host, so this never restarts a render.
    pub fn set_exposure(&self, exposure: f32) {
        self.update(false, |s| s.exposure = exposure);
    }

    /// Tone mapping happens on the host, so this never restarts a render.
    pub fn set_gamma(&self, gamma: f32) {
        self.update(false, |s| s.gamma = gamma);
    }
}

impl Default for SharedControl {
    fn default() -> Self {
        Self::new(ControlState::default())
    }
}

/// Outbound half of the remote control channel.
pub trait UiLink: Send + Sync {
    /// Tone-mapped preview of the film after a batch.
    fn send_preview(&self, image: &RgbImage);

    fn update_progress(&self, step: u32, total_steps: u32);

    fn update_sample_rate(&self, path_rate: f64, ray_rate: f64);
}
