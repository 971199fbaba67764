//! Render loop driving the device and the host task in lockstep.
//!
//! ```text
//! Idle -> Setup -> DeviceDispatch -> WaitHost -> Swap -> HostAsync -> Rebalance
//!                        ^                                              |
//!                        +----------------------------------------------+
//! ```
//! Each iteration the device renders the active buffer while the host task
//! processes the buffer from the previous iteration. Buffers change hands
//! only at the swap, after the host task has been joined.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, trace, warn};

use super::control::{ControlState, ControlStatus, SharedControl, UiLink};
use super::executor::{BatchError, BatchSettings, BatchStats, ComputeExecutor, SessionParams};
use crate::balance::{clear_accumulators, total_path_length, LoadBalancer};
use crate::config::RenderConfig;
use crate::film::{AccumulatePolicy, Film, ToneMap};
use crate::host::AsyncTask;
use crate::util::{Error, Result};
use crate::work::{WorkItem, WorkList};

/// First step after a restart that may go back to the full sample count.
/// A step that consumed control input keeps the interactive count.
pub const SAMPLE_COUNT_REVERSION_STEP: u32 = 5;

/// Position of the driver in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Setup,
    DeviceDispatch,
    WaitHost,
    Swap,
    HostAsync,
    /// Host task submitted with a rebalance of the next buffer.
    Rebalance,
    Finished,
}

/// Outcome of [`PipelineDriver::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSummary {
    /// Steps completed since the last restart.
    pub steps_completed: u32,
    pub total_steps: u32,
    /// Batches dispatched over the whole session, restarts included.
    pub batches: u64,
    pub elapsed: Duration,
    pub samples_per_sec: f64,
    pub samples_per_sec_per_lane: f64,
    pub restarts: u32,
    pub stopped_early: bool,
    /// Batches that finished while the host task was still busy.
    pub host_stalls: u32,
}

/// Work handed to the host task. Owns the inactive buffer and the film
/// until it is joined.
struct HostJob {
    step: u32,
    total_steps: u32,
    work: Vec<WorkItem>,
    film: Film,
    rebalance: Option<LoadBalancer>,
    clear: bool,
    save: Option<PathBuf>,
    tone: ToneMap,
    ui: Option<Arc<dyn UiLink>>,
}

struct HostOutput {
    work: Vec<WorkItem>,
    film: Film,
}

impl HostJob {
    fn process(mut self) -> Result<HostOutput> {
        let span = info_span!("host_task", step = self.step);
        let _enter = span.enter();

        let merged = self.film.accumulate(&self.work);
        trace!(merged, "accumulated batch");

        if let Some(ui) = &self.ui {
            ui.send_preview(&self.film.tone_map(self.tone));
            ui.update_progress(self.step, self.total_steps);
        }
        debug!(total_path_length = total_path_length(&self.work), "batch cost");

        if let Some(balancer) = &self.rebalance {
            balancer.rebalance(&mut self.work)?;
        }
        if self.clear {
            clear_accumulators(&mut self.work);
        }

        if let Some(path) = &self.save {
            match self.film.save(path, self.tone) {
                Ok(()) => info!("Saved {} at step {}", path.display(), self.step),
                Err(e) if e.is_io() => warn!("Skipping save at step {}: {e}", self.step),
                Err(e) => return Err(e),
            }
        }

        Ok(HostOutput {
            work: self.work,
            film: self.film,
        })
    }
}

type HostTask = AsyncTask<Result<HostOutput>>;

/// Join the host task and hand its buffer and film back.
fn join_host(host: &mut HostTask, work: &mut WorkList, film: &mut Option<Film>) -> Result<()> {
    if !host.is_pending() {
        return Ok(());
    }
    if let Some(output) = host.wait_for_completion()? {
        let output = output?;
        work.restore_inactive(output.work)?;
        *film = Some(output.film);
    }
    Ok(())
}

/// Drives a [`ComputeExecutor`] through a full render session.
pub struct PipelineDriver<E> {
    config: RenderConfig,
    executor: E,
    control: Option<SharedControl>,
    ui: Option<Arc<dyn UiLink>>,
    phase: Phase,
    fov_degrees: f32,
    env_rotation_degrees: f32,
    film: Option<Film>,
}

impl<E: ComputeExecutor> PipelineDriver<E> {
    /// Validate `config` and bind it to `executor`.
    pub fn new(config: RenderConfig, executor: E) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fov_degrees: config.fov,
            env_rotation_degrees: config.env_rotation,
            config,
            executor,
            control: None,
            ui: None,
            phase: Phase::Idle,
            film: None,
        })
    }

    /// Poll `control` for stop, detach and restart requests between batches.
    pub fn with_control(mut self, control: SharedControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_ui(mut self, ui: Arc<dyn UiLink>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Film of the last finished session.
    pub fn film(&self) -> Option<&Film> {
        self.film.as_ref()
    }

    pub fn has_ui(&self) -> bool {
        self.ui.is_some()
    }

    fn enter(&mut self, phase: Phase) {
        trace!(?phase, "phase");
        self.phase = phase;
    }

    fn tone(&self) -> ToneMap {
        match &self.control {
            Some(control) => control.snapshot().tone_map(),
            None => self.config.tone_map(),
        }
    }

    fn batch_settings(&self, samples: u16) -> BatchSettings {
        BatchSettings {
            samples,
            fov_radians: self.fov_degrees.to_radians(),
            env_rotation_radians: self.env_rotation_degrees.to_radians(),
        }
    }

    /// Apply a consumed control snapshot and decide how the loop proceeds.
    ///
    /// A pending model is loaded here; on failure the previous environment
    /// stays in use and the render restarts anyway.
    pub fn process_user_input(&mut self, state: &ControlState) -> ControlStatus {
        if state.stop {
            return ControlStatus::Stop;
        }
        let detached = state.detach && self.ui.take().is_some();

        let mut restart = false;
        if let Some(path) = &state.new_model_path {
            match self.executor.load_environment(path) {
                Ok(()) => info!("Loaded environment {}", path.display()),
                Err(e) => warn!("Could not load {}: {e}", path.display()),
            }
            restart = true;
        }
        if state.fov_degrees != self.fov_degrees
            || state.env_rotation_degrees != self.env_rotation_degrees
        {
            self.fov_degrees = state.fov_degrees;
            self.env_rotation_degrees = state.env_rotation_degrees;
            restart = true;
        }

        if restart {
            ControlStatus::Restart
        } else if detached {
            ControlStatus::Disconnected
        } else {
            ControlStatus::Continue
        }
    }

    fn poll_control(&mut self) -> Option<ControlStatus> {
        let control = self.control.as_ref()?;
        if !control.state_changed() {
            return None;
        }
        let state = control.consume();
        Some(self.process_user_input(&state))
    }

    /// Run one batch, retrying transient failures on the unchanged buffer.
    fn dispatch(&mut self, batch: &mut [WorkItem], settings: &BatchSettings) -> Result<BatchStats> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.executor.execute(batch, settings) {
                Ok(stats) => return Ok(stats),
                Err(BatchError::Transient(msg)) if attempts <= self.config.max_batch_retries => {
                    warn!(attempt = attempts, "Batch failed, retrying: {msg}");
                }
                Err(BatchError::Transient(msg)) => {
                    warn!("Batch failed: {msg}");
                    return Err(Error::BatchRetriesExhausted { attempts });
                }
                Err(BatchError::Fatal(msg)) => return Err(Error::BatchFailed(msg)),
            }
        }
    }

    /// Render until every step is done or a stop request arrives.
    ///
    /// The last batch is always accumulated and the film saved before
    /// returning, also when stopping early.
    pub fn run(&mut self) -> Result<RenderSummary> {
        let span = info_span!(
            "render_session",
            width = self.config.width,
            height = self.config.height,
            lanes = self.config.lanes
        );
        let _enter = span.enter();

        self.enter(Phase::Setup);
        let params = SessionParams::from_config(&self.config)?;
        self.executor.configure(&params)?;
        let balancer = LoadBalancer::new(params.layout, self.config.initial_order, self.config.seed);
        let mut work = balancer.initial_work_list(params.width, params.height)?;
        let mut film = Some(Film::new(params.width, params.height, self.config.accumulate));
        let mut host: HostTask = AsyncTask::new("lanetrace-host");

        let total_steps = self.config.steps();
        let pixels = self.config.pixels() as f64;
        let mut samples = self.config.samples_per_step as u16;
        let mut settings = self.batch_settings(samples);
        info!(
            "Rendering {}x{} with {} lanes x {} items, {} steps of {} samples",
            params.width,
            params.height,
            params.layout.lanes,
            params.layout.items_per_lane,
            total_steps,
            samples
        );

        let start = Instant::now();
        let mut step = 0u32;
        let mut batches = 0u64;
        let mut restarts = 0u32;
        let mut stopped_early = false;
        let mut host_stalls = 0u32;
        let mut samples_traced = 0f64;
        // Interactive sample counts only apply after a restart
        let mut reverted = true;

        while step < total_steps {
            let input = self.poll_control();
            match input {
                Some(ControlStatus::Stop) => {
                    info!("Stop requested at step {step}");
                    stopped_early = true;
                    break;
                }
                Some(ControlStatus::Disconnected) => info!("UI detached"),
                Some(ControlStatus::Restart) => {
                    join_host(&mut host, &mut work, &mut film)?;
                    work = balancer.initial_work_list(params.width, params.height)?;
                    film.as_mut().ok_or(Error::FilmInUse)?.reset();
                    step = 0;
                    samples = self.config.interactive_samples as u16;
                    reverted = false;
                    restarts += 1;
                    info!(restarts, "Render restarted");
                }
                Some(ControlStatus::Continue) | None => {}
            }

            step += 1;
            let mut push = step == 1;
            // Held back while the user is still interacting
            if !reverted && step >= SAMPLE_COUNT_REVERSION_STEP && input.is_none() {
                samples = self.config.samples_per_step as u16;
                reverted = true;
                push = true;
            }
            if push {
                settings = self.batch_settings(samples);
                debug!(?settings, "Pushed render settings");
            }

            let step_start = Instant::now();
            self.enter(Phase::DeviceDispatch);
            let stats = self.dispatch(work.active(), &settings)?;
            batches += 1;
            if host.is_running() {
                host_stalls += 1;
                warn!("Host processing is slower than the device at step {step}");
            }

            self.enter(Phase::WaitHost);
            join_host(&mut host, &mut work, &mut film)?;

            self.enter(Phase::Swap);
            work.swap()?;

            self.enter(Phase::HostAsync);
            let rebalance = (self.config.load_balancing && step > 1).then_some(balancer);
            let save = (step % self.config.save_interval == 0 && step < total_steps)
                .then(|| self.config.outfile.clone());
            let job = HostJob {
                step,
                total_steps,
                work: work.take_inactive(),
                film: film.take().ok_or(Error::FilmInUse)?,
                rebalance,
                clear: self.config.accumulate == AccumulatePolicy::Average,
                save,
                tone: self.tone(),
                ui: self.ui.clone(),
            };
            host.run(move || job.process())?;
            if rebalance.is_some() {
                self.enter(Phase::Rebalance);
            }

            let secs = step_start.elapsed().as_secs_f64().max(f64::EPSILON);
            let step_samples = pixels * samples as f64;
            samples_traced += step_samples;
            let path_rate = step_samples / secs;
            let ray_rate = stats.rays as f64 / secs;
            info!(
                "Step {step}/{total_steps}: {secs:.3}s, {path_rate:.0} samples/sec, {ray_rate:.0} rays/sec"
            );
            if let Some(ui) = &self.ui {
                ui.update_sample_rate(path_rate, ray_rate);
            }
        }

        self.enter(Phase::WaitHost);
        join_host(&mut host, &mut work, &mut film)?;
        self.enter(Phase::Finished);

        let film = film.ok_or(Error::FilmInUse)?;
        let tone = self.tone();
        match film.save(&self.config.outfile, tone) {
            Ok(()) => info!("Saved {}", self.config.outfile.display()),
            Err(e) if e.is_io() => warn!("Final save failed: {e}"),
            Err(e) => return Err(e),
        }
        if host_stalls > 0 {
            warn!(host_stalls, "Host task fell behind the device");
        }
        self.film = Some(film);

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let samples_per_sec = samples_traced / secs;
        let samples_per_sec_per_lane = samples_per_sec / params.layout.lanes as f64;
        info!("Render time: {:.3} seconds", elapsed.as_secs_f64());
        info!("Samples/sec: {samples_per_sec:.0}");
        info!("Samples/sec/lane: {samples_per_sec_per_lane:.0}");

        Ok(RenderSummary {
            steps_completed: step,
            total_steps,
            batches,
            elapsed,
            samples_per_sec,
            samples_per_sec_per_lane,
            restarts,
            stopped_early,
            host_stalls,
        })
    }
}
