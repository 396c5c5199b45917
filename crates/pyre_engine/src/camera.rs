//! Camera: primary ray generation.
//!
//! The camera owns a horizontal chunk of the image and walks a cursor
//! over it, emitting one intersect ray per supersample cell. Generation
//! is rate-limited: at most one primary ray per 200 microseconds, with
//! the camera briefly sleeping off the remainder rather than spinning.

use std::time::{Duration, Instant};

use pyre_core::config::Config;
use pyre_core::scene::CameraDesc;
use pyre_math::{Quat, SlimRay, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ray::{FatRay, HitRecord, RayKind};
use crate::bvh::TraversalState;

/// Minimum time between two generated primary rays.
const CAST_INTERVAL: Duration = Duration::from_micros(200);

/// Camera state: the look-at frame, the image parameters it needs from
/// the config, and the sample cursor.
pub struct Camera {
    pub eye: Vec3,
    pub look: Vec3,
    pub up: Vec3,

    /// Roll around the gaze vector, in degrees
    pub rotation: f32,

    /// Screen aspect ratio
    pub ratio: f32,

    width: u32,
    height: u32,
    antialiasing: u32,

    // Cursor: pixel (x, y), supersample cell (i, j)
    x: u32,
    y: u32,
    i: u32,
    j: u32,

    // Horizontal chunk this camera owns
    offset: u32,
    end: u32,
    chunk_size: u32,

    // Basis and screen extents, computed lazily on the first ray
    u: Vec3,
    v: Vec3,
    w: Vec3,
    l: f32,
    t: f32,
    initialized: bool,

    progress: f32,
    last_cast: Option<Instant>,
    rng: StdRng,
}

impl Camera {
    /// Build a camera from its scene description and the render config.
    pub fn from_desc(desc: &CameraDesc, config: &Config, seed: u64) -> Camera {
        Camera {
            eye: Vec3::from_array(desc.eye),
            look: Vec3::from_array(desc.look),
            up: desc
                .up
                .map(|u| Vec3::from_array(u).normalize())
                .unwrap_or(Vec3::Y),
            rotation: desc.rotation,
            ratio: desc.ratio.unwrap_or_else(|| config.ratio()),
            width: config.width,
            height: config.height,
            antialiasing: config.antialiasing.max(1),
            x: 0,
            y: 0,
            i: 0,
            j: 0,
            offset: 0,
            end: config.width,
            chunk_size: config.width,
            u: Vec3::ZERO,
            v: Vec3::ZERO,
            w: Vec3::ZERO,
            l: 0.0,
            t: 0.0,
            initialized: false,
            progress: 0.0,
            last_cast: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Restrict the camera to the horizontal chunk `[offset, offset + size)`.
    /// A single worker owns the whole image width.
    pub fn set_range(&mut self, offset: u32, size: u32) {
        self.offset = offset;
        self.end = offset + size;
        self.chunk_size = size.max(1);
        self.x = offset;
        self.progress = 0.0;
    }

    /// Percentage of this camera's chunk already emitted.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Generate the next primary ray into `ray`.
    ///
    /// Returns false, leaving the ray untouched, once the cursor has
    /// passed the end of the camera's chunk. A successful call may block
    /// for up to 200 microseconds of rate limiting.
    pub fn generate_primary(&mut self, ray: &mut FatRay) -> bool {
        if !self.initialized {
            self.initialize();
        }

        // Termination condition.
        if self.x >= self.end {
            return false;
        }

        self.throttle();

        let aa = self.antialiasing;
        let (us, vs, transmittance) = if aa <= 1 {
            // No antialiasing: one ray through the pixel center.
            let us = self.l + self.ratio * (self.x as f32 + 0.5) / self.width as f32;
            let vs = self.t - (self.y as f32 + 0.5) / self.height as f32;
            (us, vs, 1.0)
        } else {
            // Stratified supersampling on an AxA grid with uniform jitter
            // inside each cell; the weights of a pixel's samples sum to 1.
            let cell = 1.0 / aa as f32;
            let ju: f32 = self.rng.gen();
            let jv: f32 = self.rng.gen();
            let us = self.l
                + self.ratio * (self.x as f32 + self.i as f32 * cell + ju * cell)
                    / self.width as f32;
            let vs = self.t - (self.y as f32 + self.j as f32 * cell + jv * cell) / self.height as f32;
            (us, vs, 1.0 / (aa * aa) as f32)
        };

        // Convert the screen-space point into world space.
        let screen_pt = self.eye + self.u * us + self.v * vs + self.w;

        ray.kind = RayKind::Intersect;
        ray.x = self.x;
        ray.y = self.y;
        ray.bounces = 0;
        ray.slim = SlimRay::new(self.eye, (screen_pt - self.eye).normalize());
        ray.transmittance = transmittance;
        ray.hit = HitRecord::default();
        ray.traversal = TraversalState::fresh();
        ray.target = Vec3::ZERO;
        ray.emission = Vec3::ZERO;

        // Advance the cursor: j -> i -> y -> x.
        self.j += 1;
        if self.j >= aa {
            self.j = 0;
            self.i += 1;
            if self.i >= aa {
                self.i = 0;
                self.y += 1;
                if self.y >= self.height {
                    self.y = 0;
                    self.x += 1;
                }
            }
        }

        self.progress = 100.0 * (self.x - self.offset) as f32 / self.chunk_size as f32;

        if self.y == 0 && self.i == 0 && self.j == 0 {
            log::info!("{:.3}% of primary rays cast", self.progress);
        }

        true
    }

    fn initialize(&mut self) {
        // Top left screen space extents.
        self.l = self.ratio / -2.0;
        self.t = 0.5;

        // Camera gaze vector.
        self.w = (self.look - self.eye).normalize();

        // Up vector before rotation.
        let temp = self.w.cross(self.up).normalize();
        self.v = temp.cross(self.w).normalize();

        // Roll the up vector around the gaze axis.
        if self.rotation != 0.0 {
            let roll = Quat::from_axis_angle(self.w, self.rotation.to_radians());
            self.v = (roll * self.v).normalize();
        }

        self.u = self.w.cross(self.v).normalize();

        self.initialized = true;
    }

    /// Enforce the minimum inter-arrival time between primary rays by
    /// sleeping off the remainder of the window.
    fn throttle(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_cast {
            let elapsed = now.duration_since(last);
            if elapsed < CAST_INTERVAL {
                std::thread::sleep(CAST_INTERVAL - elapsed);
            }
        }
        self.last_cast = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(width: u32, height: u32, antialiasing: u32) -> Config {
        Config::from_json(&format!(
            r#"{{
                "width": {width},
                "height": {height},
                "buffers": ["R", "G", "B"],
                "antialiasing": {antialiasing},
                "name": "test"
            }}"#
        ))
        .unwrap()
    }

    fn test_desc() -> CameraDesc {
        let scene = pyre_core::SceneFile::from_json(
            r#"{ "camera": { "eye": [0, 0, 0], "look": [0, 0, -1] } }"#,
        )
        .unwrap();
        scene.camera
    }

    #[test]
    fn test_basis_for_straight_down_z() {
        let config = test_config(2, 2, 1);
        let mut camera = Camera::from_desc(&test_desc(), &config, 1);

        let mut ray = FatRay::default();
        assert!(camera.generate_primary(&mut ray));

        // Gaze down -Z with +Y up: u = +X, v = +Y
        assert!((camera.w - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
        assert!((camera.v - Vec3::Y).length() < 1e-5);
        assert!((camera.u - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn test_coverage_no_antialiasing() {
        // Each pixel is the subject of exactly one primary ray.
        let config = test_config(4, 3, 1);
        let mut camera = Camera::from_desc(&test_desc(), &config, 1);

        let mut counts = vec![0u32; 12];
        let mut ray = FatRay::default();
        while camera.generate_primary(&mut ray) {
            counts[(ray.y * 4 + ray.x) as usize] += 1;
            assert_eq!(ray.transmittance, 1.0);
            assert_eq!(ray.kind, RayKind::Intersect);
            assert_eq!(ray.bounces, 0);
        }

        assert!(counts.iter().all(|&c| c == 1));
        assert!(!camera.generate_primary(&mut ray), "camera must stay exhausted");
        assert_eq!(camera.progress(), 100.0);
    }

    #[test]
    fn test_coverage_antialiased() {
        // A*A samples per pixel whose transmittances sum to 1.
        let config = test_config(2, 2, 2);
        let mut camera = Camera::from_desc(&test_desc(), &config, 7);

        let mut counts = vec![0u32; 4];
        let mut weights = vec![0.0f32; 4];
        let mut ray = FatRay::default();
        while camera.generate_primary(&mut ray) {
            let p = (ray.y * 2 + ray.x) as usize;
            counts[p] += 1;
            weights[p] += ray.transmittance;
        }

        assert!(counts.iter().all(|&c| c == 4));
        assert!(weights.iter().all(|&w| (w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_chunk_range() {
        // A camera owning columns [1, 3) emits no rays outside them.
        let config = test_config(4, 2, 1);
        let mut camera = Camera::from_desc(&test_desc(), &config, 1);
        camera.set_range(1, 2);

        let mut ray = FatRay::default();
        let mut xs = Vec::new();
        while camera.generate_primary(&mut ray) {
            xs.push(ray.x);
        }

        assert_eq!(xs, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_throttle_minimum_spacing() {
        let config = test_config(4, 1, 1);
        let mut camera = Camera::from_desc(&test_desc(), &config, 1);

        let mut ray = FatRay::default();
        let start = Instant::now();
        let mut generated = 0;
        while camera.generate_primary(&mut ray) {
            generated += 1;
        }

        // The first ray is free; the other three wait 200us each.
        assert_eq!(generated, 4);
        assert!(start.elapsed() >= CAST_INTERVAL * 3);
    }

    #[test]
    fn test_jitter_deterministic_for_seed() {
        let config = test_config(2, 2, 2);
        let mut a = Camera::from_desc(&test_desc(), &config, 123);
        let mut b = Camera::from_desc(&test_desc(), &config, 123);

        let mut ray_a = FatRay::default();
        let mut ray_b = FatRay::default();
        while a.generate_primary(&mut ray_a) {
            assert!(b.generate_primary(&mut ray_b));
            assert_eq!(ray_a.slim.direction, ray_b.slim.direction);
        }
    }
}
