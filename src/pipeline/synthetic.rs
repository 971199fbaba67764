//! CPU stand-in for the lane accelerator.
//!
//! Traces a small procedural scene (a glossy sphere on a checkered floor under
//! a rotatable sky) so the pipeline can run end to end without hardware.
//! Path lengths vary with the pixel, which gives the load balancer real
//! costs to work with. Not a physically based renderer.

use std::f32::consts::PI;
use std::path::{Path, PathBuf};

use glam::{Vec2, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, info};

use super::executor::{
    BatchError, BatchSettings, BatchStats, ComputeExecutor, SessionParams, AA_COMPONENTS,
};
use crate::config::AaNoise;
use crate::util::{Error, Result};
use crate::work::WorkItem;

const SPHERE_CENTER: Vec3 = Vec3::new(0.0, 0.0, -3.0);
const SPHERE_RADIUS: f32 = 1.0;
const FLOOR_Y: f32 = -1.0;
const EPSILON: f32 = 1e-3;
/// Normal samples beyond this many sigma are redrawn.
const TRUNCATE_SIGMA: f32 = 3.0;

/// Procedural path tracer executing one rayon task per lane segment.
#[derive(Debug, Default)]
pub struct SyntheticExecutor {
    hardware_lanes: Option<usize>,
    noise_workers: Option<usize>,
    session: Option<Session>,
    environment: Option<PathBuf>,
}

#[derive(Debug)]
struct Session {
    params: SessionParams,
    lanes: usize,
    noise_workers: usize,
    iteration: u64,
}

impl SyntheticExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the device has `lanes` lanes. Sessions laid out for any other
    /// lane count are rejected by `configure`.
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.hardware_lanes = Some(lanes);
        self
    }

    /// Split anti-aliasing noise generation over `workers` generators.
    pub fn with_noise_workers(mut self, workers: usize) -> Self {
        self.noise_workers = Some(workers);
        self
    }

    /// Environment asset currently in use.
    pub fn environment(&self) -> Option<&Path> {
        self.environment.as_deref()
    }
}

impl ComputeExecutor for SyntheticExecutor {
    fn configure(&mut self, params: &SessionParams) -> Result<()> {
        let lanes = self.hardware_lanes.unwrap_or(params.layout.lanes);
        let noise_workers = self.noise_workers.unwrap_or(lanes);
        params.check_divisible(lanes, noise_workers)?;
        if lanes != params.layout.lanes {
            return Err(Error::config(format!(
                "work list is laid out for {} lanes, device has {lanes}",
                params.layout.lanes
            )));
        }
        debug!(lanes, noise_workers, "synthetic executor configured");
        self.session = Some(Session {
            params: params.clone(),
            lanes,
            noise_workers,
            iteration: 0,
        });
        Ok(())
    }

    fn execute(
        &mut self,
        batch: &mut [WorkItem],
        settings: &BatchSettings,
    ) -> std::result::Result<BatchStats, BatchError> {
        let Some(session) = self.session.as_mut() else {
            return Err(BatchError::Fatal("executor not configured".into()));
        };
        let params = &session.params;
        if batch.len() != params.layout.len() {
            return Err(BatchError::Fatal(format!(
                "batch of {} items does not match configured buffer of {}",
                batch.len(),
                params.layout.len()
            )));
        }

        let iteration = session.iteration;
        session.iteration += 1;

        let noise = aa_noise(params, session.noise_workers, iteration);
        let per_lane = batch.len() / session.lanes;
        let camera = Camera::new(params.width, params.height, settings.fov_radians);
        let scene = Scene {
            params,
            env_rotation: settings.env_rotation_radians,
        };

        let rays = batch
            .par_chunks_mut(per_lane)
            .zip(noise.par_chunks(per_lane * AA_COMPONENTS))
            .map(|(segment, noise)| {
                let mut rays = 0u64;
                for (offset, item) in segment.iter_mut().enumerate() {
                    let Some((column, row)) = item.pixel() else {
                        continue;
                    };
                    let jitter = Vec2::new(
                        noise[offset * AA_COMPONENTS],
                        noise[offset * AA_COMPONENTS + 1],
                    );
                    let pixel_seed = ((row as u64) << 16) | column as u64;
                    let mut rng = StdRng::seed_from_u64(mix(params.seed, pixel_seed, iteration));
                    rays += scene.render_item(
                        item,
                        &camera,
                        jitter,
                        settings.samples,
                        &mut rng,
                    );
                }
                rays
            })
            .sum();

        Ok(BatchStats { rays })
    }

    fn load_environment(&mut self, path: &Path) -> Result<()> {
        std::fs::metadata(path)?;
        info!("environment set to {}", path.display());
        self.environment = Some(path.to_path_buf());
        Ok(())
    }
}

/// SplitMix64 finalizer over three keys.
fn mix(seed: u64, a: u64, b: u64) -> u64 {
    let mut z = seed
        .wrapping_add(a.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(b.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn draw_noise(kind: AaNoise, rng: &mut StdRng) -> f32 {
    match kind {
        AaNoise::Uniform => rng.gen_range(-1.0..=1.0),
        AaNoise::Normal => rng.sample(StandardNormal),
        AaNoise::TruncatedNormal => loop {
            let x: f32 = rng.sample(StandardNormal);
            if x.abs() <= TRUNCATE_SIGMA {
                break x;
            }
        },
    }
}

/// Anti-aliasing offsets for one batch, two per work item, in pixels.
fn aa_noise(params: &SessionParams, workers: usize, iteration: u64) -> Vec<f32> {
    let mut noise = vec![0.0f32; params.aa_noise_len()];
    let chunk = noise.len() / workers;
    noise
        .par_chunks_mut(chunk)
        .enumerate()
        .for_each(|(worker, values)| {
            let mut rng = StdRng::seed_from_u64(mix(!params.seed, worker as u64, iteration));
            for v in values {
                *v = draw_noise(params.aa_noise, &mut rng) * params.aa_noise_scale;
            }
        });
    noise
}

struct Camera {
    width: f32,
    height: f32,
    half_extent: f32,
}

impl Camera {
    fn new(width: u32, height: u32, fov_radians: f32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
            half_extent: (fov_radians * 0.5).tan(),
        }
    }

    fn primary_ray(&self, column: u16, row: u16, jitter: Vec2) -> Vec3 {
        let aspect = self.width / self.height;
        let u = ((column as f32 + 0.5 + jitter.x) / self.width) * 2.0 - 1.0;
        let v = 1.0 - ((row as f32 + 0.5 + jitter.y) / self.height) * 2.0;
        Vec3::new(u * self.half_extent * aspect, v * self.half_extent, -1.0).normalize()
    }
}

enum Surface {
    Sphere,
    Floor { checker: bool },
}

struct Hit {
    position: Vec3,
    normal: Vec3,
    surface: Surface,
}

struct Scene<'a> {
    params: &'a SessionParams,
    env_rotation: f32,
}

impl Scene<'_> {
    fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<Hit> {
        let mut best: Option<(f32, Hit)> = None;

        let oc = origin - SPHERE_CENTER;
        let b = oc.dot(dir);
        let c = oc.length_squared() - SPHERE_RADIUS * SPHERE_RADIUS;
        let disc = b * b - c;
        if disc > 0.0 {
            let sq = disc.sqrt();
            let t = if -b - sq > EPSILON { -b - sq } else { -b + sq };
            if t > EPSILON {
                let position = origin + dir * t;
                let normal = (position - SPHERE_CENTER) / SPHERE_RADIUS;
                best = Some((t, Hit { position, normal, surface: Surface::Sphere }));
            }
        }

        if dir.y < -1e-6 {
            let t = (FLOOR_Y - origin.y) / dir.y;
            if t > EPSILON && best.as_ref().map_or(true, |(bt, _)| t < *bt) {
                let position = origin + dir * t;
                let checker = ((position.x.floor() + position.z.floor()) as i64) & 1 == 0;
                best = Some((
                    t,
                    Hit {
                        position,
                        normal: Vec3::Y,
                        surface: Surface::Floor { checker },
                    },
                ));
            }
        }

        best.map(|(_, hit)| hit)
    }

    /// Sky gradient with a sun whose azimuth follows the environment rotation.
    fn sky(&self, dir: Vec3) -> Vec3 {
        let t = 0.5 * (dir.y + 1.0);
        let base = Vec3::new(1.0, 1.0, 1.0).lerp(Vec3::new(0.5, 0.7, 1.0), t);
        let (s, c) = self.env_rotation.sin_cos();
        let sun = Vec3::new(s, 0.6, -c).normalize();
        let lobe = dir.dot(sun).max(0.0).powi(64);
        base + Vec3::new(8.0, 7.0, 5.0) * lobe
    }

    /// Trace `samples` paths for `item`. Returns the number of ray segments.
    fn render_item(
        &self,
        item: &mut WorkItem,
        camera: &Camera,
        first_jitter: Vec2,
        samples: u16,
        rng: &mut StdRng,
    ) -> u64 {
        let mut color = Vec3::ZERO;
        let mut path_length = 0u16;
        let mut rays = 0u64;

        for sample in 0..samples {
            let jitter = if sample == 0 {
                first_jitter
            } else {
                Vec2::new(
                    draw_noise(self.params.aa_noise, rng),
                    draw_noise(self.params.aa_noise, rng),
                ) * self.params.aa_noise_scale
            };
            let dir = camera.primary_ray(item.pixel_column, item.pixel_row, jitter);
            let (radiance, segments) = self.trace(Vec3::ZERO, dir, rng);
            color += radiance;
            rays += segments as u64;
            path_length = path_length.saturating_add(segments);
        }

        // Sums run on until the host clears the item
        for (c, r) in item.color.iter_mut().zip(color.to_array()) {
            *c += r;
        }
        item.sample_count = item.sample_count.saturating_add(samples);
        item.path_length = path_length;
        rays
    }

    fn trace(&self, mut origin: Vec3, mut dir: Vec3, rng: &mut StdRng) -> (Vec3, u16) {
        let params = self.params;
        let mut throughput = Vec3::ONE;
        let mut radiance = Vec3::ZERO;
        let mut segments = 0u16;

        for depth in 0..params.max_path_length {
            segments += 1;
            let Some(hit) = self.intersect(origin, dir) else {
                radiance += throughput * self.sky(dir);
                break;
            };

            if depth >= params.roulette_depth {
                if rng.gen::<f32>() < params.stop_prob {
                    break;
                }
                throughput /= 1.0 - params.stop_prob;
            }

            let (next, albedo) = match hit.surface {
                Surface::Sphere => {
                    let cos = (-dir).dot(hit.normal).clamp(0.0, 1.0);
                    if rng.gen::<f32>() < schlick(cos, params.refractive_index) {
                        (reflect(dir, hit.normal), Vec3::ONE)
                    } else {
                        (cosine_sample(hit.normal, rng), Vec3::new(0.8, 0.3, 0.2))
                    }
                }
                Surface::Floor { checker } => {
                    let albedo = if checker { Vec3::splat(0.7) } else { Vec3::splat(0.2) };
                    (cosine_sample(hit.normal, rng), albedo)
                }
            };
            throughput *= albedo;
            origin = hit.position + hit.normal * EPSILON;
            dir = next;
        }

        (radiance, segments)
    }
}

fn schlick(cos: f32, ior: f32) -> f32 {
    let r0 = ((1.0 - ior) / (1.0 + ior)).powi(2);
    r0 + (1.0 - r0) * (1.0 - cos).powi(5)
}

fn reflect(dir: Vec3, normal: Vec3) -> Vec3 {
    dir - 2.0 * dir.dot(normal) * normal
}

fn cosine_sample(normal: Vec3, rng: &mut StdRng) -> Vec3 {
    let r1: f32 = rng.gen();
    let r2: f32 = rng.gen();
    let phi = 2.0 * PI * r1;
    let r = r2.sqrt();
    let local = Vec3::new(r * phi.cos(), r * phi.sin(), (1.0 - r2).sqrt());
    let (t, b) = normal.any_orthonormal_pair();
    (t * local.x + b * local.y + normal * local.z).normalize()
}
