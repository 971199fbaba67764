//! End-to-end tests for the render pipeline.

use std::path::Path;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use lanetrace::balance::cost_variance;
use lanetrace::prelude::*;

type Hook = Box<dyn Fn()>;

/// Executor with per-pixel costs and scripted failures.
struct Scripted {
    cost: fn(u16, u16) -> u16,
    attempts: u32,
    transient_attempts: Vec<u32>,
    fail_always: Option<BatchError>,
    dispatched: Vec<Vec<WorkItem>>,
    settings: Vec<BatchSettings>,
    hook: Option<(usize, Hook)>,
}

impl Scripted {
    fn new(cost: fn(u16, u16) -> u16) -> Self {
        Self {
            cost,
            attempts: 0,
            transient_attempts: Vec::new(),
            fail_always: None,
            dispatched: Vec::new(),
            settings: Vec::new(),
            hook: None,
        }
    }

    /// Run `hook` right after batch `n` (1-based) completes.
    fn after_batch(mut self, n: usize, hook: impl Fn() + 'static) -> Self {
        self.hook = Some((n, Box::new(hook)));
        self
    }
}

impl ComputeExecutor for Scripted {
    fn configure(&mut self, _params: &SessionParams) -> lanetrace::Result<()> {
        Ok(())
    }

    fn execute(
        &mut self,
        batch: &mut [WorkItem],
        settings: &BatchSettings,
    ) -> std::result::Result<BatchStats, BatchError> {
        self.attempts += 1;
        if self.transient_attempts.contains(&self.attempts) {
            return Err(BatchError::Transient("device busy".into()));
        }
        if let Some(err) = &self.fail_always {
            return Err(err.clone());
        }

        let mut rays = 0;
        for item in batch.iter_mut() {
            let Some((column, row)) = item.pixel() else {
                continue;
            };
            item.color = [0.25 * settings.samples as f32; 3];
            item.sample_count = settings.samples;
            item.path_length = (self.cost)(column, row);
            rays += item.path_length as u64;
        }
        self.dispatched.push(batch.to_vec());
        self.settings.push(*settings);

        if let Some((n, hook)) = &self.hook {
            if *n == self.dispatched.len() {
                hook();
            }
        }
        Ok(BatchStats { rays })
    }

    fn load_environment(&mut self, path: &Path) -> lanetrace::Result<()> {
        Err(Error::config(format!("cannot read {}", path.display())))
    }
}

#[derive(Default)]
struct RecordingUi {
    previews: Mutex<Vec<(u32, u32)>>,
    progress: Mutex<Vec<(u32, u32)>>,
    rates: Mutex<Vec<(f64, f64)>>,
}

impl UiLink for RecordingUi {
    fn send_preview(&self, image: &image::RgbImage) {
        self.previews.lock().push(image.dimensions());
    }

    fn update_progress(&self, step: u32, total_steps: u32) {
        self.progress.lock().push((step, total_steps));
    }

    fn update_sample_rate(&self, path_rate: f64, ray_rate: f64) {
        self.rates.lock().push((path_rate, ray_rate));
    }
}

/// Holds the host task in its first preview long enough for the next batch
/// to finish first.
struct SlowUi {
    entered: Mutex<Option<Sender<()>>>,
}

impl UiLink for SlowUi {
    fn send_preview(&self, _image: &image::RgbImage) {
        if let Some(tx) = self.entered.lock().take() {
            let _ = tx.send(());
            thread::sleep(Duration::from_millis(300));
        }
    }

    fn update_progress(&self, _step: u32, _total_steps: u32) {}

    fn update_sample_rate(&self, _path_rate: f64, _ray_rate: f64) {}
}

fn flat(_: u16, _: u16) -> u16 {
    3
}

fn expensive_first_row(_: u16, row: u16) -> u16 {
    if row == 0 {
        100
    } else {
        1
    }
}

fn config(dir: &Path) -> RenderConfig {
    RenderConfig {
        outfile: dir.join("render.png"),
        width: 8,
        height: 4,
        lanes: 4,
        samples: 8,
        samples_per_step: 2,
        initial_order: InitialOrder::Raster,
        ..Default::default()
    }
}

fn sorted_pixels(items: &[WorkItem]) -> Vec<(u16, u16)> {
    let mut pixels: Vec<_> = items.iter().filter_map(WorkItem::pixel).collect();
    pixels.sort_unstable();
    pixels
}

fn mean_red(film: &Film) -> f32 {
    let hdr = film.hdr_image();
    hdr.pixels().map(|px| px.0[0]).sum::<f32>() / (hdr.width() * hdr.height()) as f32
}

fn assert_film_samples(film: &Film, expected: u32) {
    for row in 0..film.height() {
        for column in 0..film.width() {
            assert_eq!(film.sample_count(column, row), Some(expected), "pixel {column},{row}");
        }
    }
}

#[test]
fn test_synthetic_render_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        outfile: dir.path().join("synthetic.png"),
        width: 12,
        height: 8,
        lanes: 6,
        samples: 5,
        samples_per_step: 2,
        load_balancing: true,
        ..Default::default()
    };

    let mut driver = PipelineDriver::new(cfg, SyntheticExecutor::new()).unwrap();
    let summary = driver.run().unwrap();

    // 5 rounds up to 6 samples in 3 steps
    assert_eq!(summary.total_steps, 3);
    assert_eq!(summary.steps_completed, 3);
    assert_eq!(summary.batches, 3);
    assert!(summary.samples_per_sec > 0.0);
    assert_film_samples(driver.film().unwrap(), 6);

    let png = image::open(dir.path().join("synthetic.png")).unwrap();
    assert_eq!((png.width(), png.height()), (12, 8));
    assert!(dir.path().join("synthetic.exr").exists());
}

#[test]
fn test_synthetic_overwrite_matches_average() {
    let dir = tempfile::tempdir().unwrap();
    let render = |accumulate: AccumulatePolicy| {
        let cfg = RenderConfig {
            outfile: dir.path().join(format!("{accumulate:?}.png")),
            width: 8,
            height: 8,
            lanes: 4,
            samples: 16,
            samples_per_step: 1,
            accumulate,
            ..Default::default()
        };
        let mut driver = PipelineDriver::new(cfg, SyntheticExecutor::new()).unwrap();
        driver.run().unwrap();
        let film = driver.film().unwrap();
        // Overwrite keeps the totals of the buffer reported last
        let expected = match accumulate {
            AccumulatePolicy::Overwrite => 8,
            AccumulatePolicy::Average => 16,
        };
        assert_eq!(film.sample_count(0, 0), Some(expected));
        mean_red(film)
    };

    let average = render(AccumulatePolicy::Average);
    let overwrite = render(AccumulatePolicy::Overwrite);
    assert!(average > 0.0);
    let ratio = overwrite / average;
    assert!((0.75..1.33).contains(&ratio), "average {average}, overwrite {overwrite}");

    let exr = image::open(dir.path().join("Overwrite.exr")).unwrap().to_rgb32f();
    let exr_red = exr.pixels().map(|px| px.0[0]).sum::<f32>() / 64.0;
    assert!((exr_red - overwrite).abs() < 1e-4);
}

#[test]
fn test_load_balancing_evens_lane_costs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        samples: 6,
        samples_per_step: 1,
        load_balancing: true,
        ..config(dir.path())
    };

    let mut driver = PipelineDriver::new(cfg, Scripted::new(expensive_first_row)).unwrap();
    driver.run().unwrap();

    let dispatched = &driver.executor().dispatched;
    assert_eq!(dispatched.len(), 6);

    let expected = sorted_pixels(&dispatched[0]);
    assert_eq!(expected.len(), 32);
    for batch in dispatched {
        assert_eq!(sorted_pixels(batch), expected);
    }

    // Raster order puts the whole expensive row on lane 0
    let raster = cost_variance(&dispatched[0], 4).unwrap();
    assert!(raster > 0.0);
    // Buffers are rebalanced from step 2 on and come back two steps later
    let balanced = cost_variance(&dispatched[3], 4).unwrap();
    assert!(balanced < raster);
    assert_eq!(balanced, 0.0);

    let film = driver.film().unwrap();
    assert_film_samples(film, 6);
    assert_eq!(film.pixel(0, 0), Some([0.25; 3]));
}

#[test]
fn test_transient_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = Scripted::new(flat);
    executor.transient_attempts = vec![2, 3];

    let mut driver = PipelineDriver::new(config(dir.path()), executor).unwrap();
    let summary = driver.run().unwrap();

    assert_eq!(summary.steps_completed, 4);
    assert_eq!(driver.executor().attempts, 6);
    assert_film_samples(driver.film().unwrap(), 8);
}

#[test]
fn test_retries_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = Scripted::new(flat);
    executor.fail_always = Some(BatchError::Transient("device lost".into()));
    let cfg = RenderConfig {
        max_batch_retries: 2,
        ..config(dir.path())
    };

    let mut driver = PipelineDriver::new(cfg, executor).unwrap();
    let err = driver.run().unwrap_err();
    assert!(matches!(err, Error::BatchRetriesExhausted { attempts: 3 }));
}

#[test]
fn test_fatal_batch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = Scripted::new(flat);
    executor.fail_always = Some(BatchError::Fatal("lane fault".into()));

    let mut driver = PipelineDriver::new(config(dir.path()), executor).unwrap();
    assert!(matches!(driver.run(), Err(Error::BatchFailed(msg)) if msg == "lane fault"));
    assert_eq!(driver.executor().attempts, 1);
}

#[test]
fn test_stop_before_run_still_saves() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let control = SharedControl::new(ControlState::from_config(&cfg));
    control.stop();

    let mut driver = PipelineDriver::new(cfg, Scripted::new(flat))
        .unwrap()
        .with_control(control);
    let summary = driver.run().unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.steps_completed, 0);
    assert_eq!(summary.batches, 0);
    assert_eq!(driver.phase(), Phase::Finished);
    assert!(dir.path().join("render.png").exists());
    assert!(dir.path().join("render.exr").exists());
}

#[test]
fn test_stop_keeps_last_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let control = SharedControl::new(ControlState::from_config(&cfg));
    let remote = control.clone();
    let executor = Scripted::new(flat).after_batch(2, move || remote.stop());

    let mut driver = PipelineDriver::new(cfg, executor).unwrap().with_control(control);
    let summary = driver.run().unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.steps_completed, 2);
    // Both batches reached the film, including the one in flight at the stop
    assert_film_samples(driver.film().unwrap(), 4);
}

#[test]
fn test_restart_on_fov_change() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        interactive_samples: 1,
        ..config(dir.path())
    };
    let control = SharedControl::new(ControlState::from_config(&cfg));
    let remote = control.clone();
    let executor = Scripted::new(flat).after_batch(2, move || remote.set_fov(60.0));

    let mut driver = PipelineDriver::new(cfg, executor).unwrap().with_control(control);
    let summary = driver.run().unwrap();

    assert_eq!(summary.restarts, 1);
    assert_eq!(summary.steps_completed, 4);
    assert_eq!(summary.batches, 6);

    let settings = &driver.executor().settings;
    assert_eq!(settings[1].samples, 2);
    assert_eq!(settings[2].samples, 1);
    assert!((settings[2].fov_radians - 60f32.to_radians()).abs() < 1e-6);
    assert!((settings[0].fov_radians - 90f32.to_radians()).abs() < 1e-6);

    // Only post-restart batches are in the film
    assert_film_samples(driver.film().unwrap(), 4);
}

#[test]
fn test_interactive_samples_revert() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        samples: 16,
        samples_per_step: 2,
        interactive_samples: 1,
        ..config(dir.path())
    };
    let control = SharedControl::new(ControlState::from_config(&cfg));
    control.set_env_rotation(45.0);

    let mut driver = PipelineDriver::new(cfg, Scripted::new(flat))
        .unwrap()
        .with_control(control);
    let summary = driver.run().unwrap();
    assert_eq!(summary.restarts, 1);

    let samples: Vec<u16> = driver.executor().settings.iter().map(|s| s.samples).collect();
    assert_eq!(samples, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    assert_film_samples(driver.film().unwrap(), 12);
}

#[test]
fn test_interactive_samples_held_during_input() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        samples: 16,
        samples_per_step: 2,
        interactive_samples: 1,
        ..config(dir.path())
    };
    let control = SharedControl::new(ControlState::from_config(&cfg));
    control.set_env_rotation(45.0);
    let remote = control.clone();
    // Unchanged fov: input without a restart, seen right before step 5
    let fov = cfg.fov;
    let executor = Scripted::new(flat).after_batch(4, move || remote.set_fov(fov));

    let mut driver = PipelineDriver::new(cfg, executor).unwrap().with_control(control);
    let summary = driver.run().unwrap();
    assert_eq!(summary.restarts, 1);

    let samples: Vec<u16> = driver.executor().settings.iter().map(|s| s.samples).collect();
    assert_eq!(samples, vec![1, 1, 1, 1, 1, 2, 2, 2]);
    assert_film_samples(driver.film().unwrap(), 11);
}

#[test]
fn test_failed_model_load_keeps_rendering() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let control = SharedControl::new(ControlState::from_config(&cfg));
    control.load_model(dir.path().join("missing.nif"));

    let mut driver = PipelineDriver::new(cfg, Scripted::new(flat))
        .unwrap()
        .with_control(control.clone());
    let summary = driver.run().unwrap();

    assert_eq!(summary.steps_completed, summary.total_steps);
    assert!(!summary.stopped_early);
    assert_eq!(control.snapshot().new_model_path, None);
}

#[test]
fn test_ui_receives_progress() {
    let dir = tempfile::tempdir().unwrap();
    let ui = Arc::new(RecordingUi::default());

    let mut driver = PipelineDriver::new(config(dir.path()), Scripted::new(flat))
        .unwrap()
        .with_ui(ui.clone());
    driver.run().unwrap();

    assert_eq!(*ui.progress.lock(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    assert_eq!(ui.previews.lock().len(), 4);
    assert!(ui.previews.lock().iter().all(|&d| d == (8, 4)));
    let rates = ui.rates.lock();
    assert_eq!(rates.len(), 4);
    assert!(rates.iter().all(|&(paths, rays)| paths > 0.0 && rays > 0.0));
}

#[test]
fn test_slow_host_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = channel();
    let ui = Arc::new(SlowUi {
        entered: Mutex::new(Some(tx)),
    });
    // Batch 2 finishes only once the host task is stuck in the preview
    let executor = Scripted::new(flat).after_batch(2, move || {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    });

    let mut driver = PipelineDriver::new(config(dir.path()), executor)
        .unwrap()
        .with_ui(ui);
    let summary = driver.run().unwrap();

    assert!(summary.host_stalls >= 1);
    assert_eq!(summary.steps_completed, 4);
    assert_film_samples(driver.film().unwrap(), 8);
}

#[test]
fn test_detach_drops_ui() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let ui = Arc::new(RecordingUi::default());
    let control = SharedControl::new(ControlState::from_config(&cfg));
    let remote = control.clone();
    let executor = Scripted::new(flat).after_batch(2, move || remote.detach());

    let mut driver = PipelineDriver::new(cfg, executor)
        .unwrap()
        .with_control(control)
        .with_ui(ui.clone());
    let summary = driver.run().unwrap();

    assert!(!driver.has_ui());
    assert_eq!(summary.restarts, 0);
    assert_eq!(summary.steps_completed, 4);
    assert_eq!(*ui.progress.lock(), vec![(1, 4), (2, 4)]);
}

#[test]
fn test_exposure_change_does_not_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let control = SharedControl::new(ControlState::from_config(&cfg));
    let remote = control.clone();
    let executor = Scripted::new(flat).after_batch(1, move || {
        remote.set_exposure(2.0);
        remote.set_gamma(1.0);
    });

    let mut driver = PipelineDriver::new(cfg, executor).unwrap().with_control(control);
    let summary = driver.run().unwrap();

    assert_eq!(summary.restarts, 0);
    assert_film_samples(driver.film().unwrap(), 8);
}

#[test]
fn test_failed_save_does_not_stop_render() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RenderConfig {
        outfile: dir.path().join("missing").join("render.png"),
        save_interval: 1,
        ..config(dir.path())
    };

    let mut driver = PipelineDriver::new(cfg, Scripted::new(flat)).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(summary.steps_completed, 4);
    assert!(!dir.path().join("missing").exists());
}

#[test]
fn test_executor_rejects_lane_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SyntheticExecutor::new().with_lanes(3);

    let mut driver = PipelineDriver::new(config(dir.path()), executor).unwrap();
    assert!(matches!(
        driver.run(),
        Err(Error::LaneMismatch { len: 32, lanes: 3 })
    ));
}
