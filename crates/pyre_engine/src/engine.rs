//! The engine: scene materialization, job dispatch, and ray processing.
//!
//! A single dispatcher thread owns the camera, the image, and the stats;
//! workers own nothing but the ray they were handed. The dispatcher's
//! event loop services two sources: completed work results, and a 1 s
//! stats deadline that doubles as a progress watchdog.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use pyre_core::config::{Config, ConfigError};
use pyre_core::scene::{SceneError, SceneFile, TextureSource};
use pyre_core::texture::TextureError;
use pyre_core::{ImageTexture, Material, Mesh, Texture};
use thiserror::Error;

use crate::bvh::Bvh;
use crate::camera::Camera;
use crate::image::Image;
use crate::library::Library;
use crate::pool::WorkerPool;
use crate::ray::{FatRay, HitRecord, RayKind};
use crate::shader::{prepare_shader, Shader, ShaderError, TextureProgram, TextureResource};
use crate::work::{BufferOpKind, RenderStats, WorkResults};

/// Stats reporting cadence.
const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Occlusion rays stop just short of the light sample.
const SHADOW_BIAS: f32 = 1e-3;

/// The single-worker core always intersects as worker 1; 0 means "no
/// hit" in the hit record.
pub(crate) const WORKER_ID: u32 = 1;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("scene: {0}")]
    Scene(#[from] SceneError),

    #[error("texture: {0}")]
    Texture(#[from] TextureError),

    #[error("shader: {0}")]
    Shader(#[from] ShaderError),

    #[error("image output: {0}")]
    Output(#[from] exr::error::Error),
}

/// Knobs the command line exposes.
#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    /// Maximum jobs in flight on the worker pool
    pub max_jobs: u32,

    /// Stop after this many consecutive stats intervals with no counter
    /// movement (0 disables the watchdog)
    pub max_intervals: u32,

    /// Sampling seed; omitted means seeded from entropy
    pub seed: Option<u64>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_jobs: 4,
            max_intervals: 16,
            seed: None,
        }
    }
}

/// Everything the workers share, frozen before the first job is queued.
pub(crate) struct RenderContext {
    pub lib: Library,

    /// Dense ids of the R/G/B buffers, where configured; light-ray
    /// responses accumulate into these
    pub beauty: Option<[usize; 3]>,
}

/// The scene parser's sync callback: assign the next mesh id, store the
/// mesh, and prepare its material's shader and procedural textures if
/// they have not been prepared yet. Returns the assigned id; a parser
/// flush with no mesh returns 0.
pub fn sync_mesh(lib: &mut Library, image: &Image, mesh: Option<Mesh>) -> Result<u32, RenderError> {
    let Some(mesh) = mesh else {
        return Ok(0);
    };

    let material_id = mesh.material;
    let Some(material) = lib.lookup_material(material_id) else {
        return Err(RenderError::Scene(SceneError::Invalid(format!(
            "mesh references unknown material id {material_id}"
        ))));
    };
    let shader_id = material.shader;
    let texture_ids: Vec<u32> = material.textures.values().copied().collect();

    let id = lib.next_mesh_id();
    lib.store_mesh(id, mesh);

    // Prep the shader if we haven't already.
    match lib.lookup_shader(shader_id) {
        None => {
            return Err(RenderError::Scene(SceneError::Invalid(format!(
                "material {material_id} references unknown shader id {shader_id}"
            ))));
        }
        Some(shader) if shader.program.is_none() => {
            let code = shader.code.clone();
            let program = prepare_shader(&code, image)?;
            if let Some(shader) = lib.lookup_shader_mut(shader_id) {
                shader.program = Some(program);
            }
        }
        Some(_) => {}
    }

    // Prep any procedural textures for execution.
    for tex_id in texture_ids {
        let code = match lib.lookup_texture(tex_id) {
            None => {
                return Err(RenderError::Scene(SceneError::Invalid(format!(
                    "material {material_id} references unknown texture id {tex_id}"
                ))));
            }
            Some(tex) if tex.program.is_none() => match &tex.data {
                Texture::Procedural { code } => Some(code.clone()),
                Texture::Image(_) => None,
            },
            Some(_) => None,
        };

        if let Some(code) = code {
            let program = TextureProgram::prepare(&code)?;
            if let Some(tex) = lib.lookup_texture_mut(tex_id) {
                tex.program = Some(program);
            }
        }
    }

    Ok(id)
}

pub struct Engine {
    ctx: Arc<RenderContext>,
    camera: Camera,
    image: Image,
    pool: WorkerPool,
    results_rx: mpsc::Receiver<WorkResults>,

    /// Rays forwarded back by workers, waiting for a job slot
    pending: VecDeque<FatRay>,

    active_jobs: u32,
    max_jobs: u32,
    max_intervals: u32,
    quiet_intervals: u32,

    interval: RenderStats,
    totals: RenderStats,

    load_time: Duration,
    build_time: Duration,
    render_time: Duration,
}

impl Engine {
    /// Materialize a parsed config and scene into a ready-to-run engine:
    /// image buffers, library resources, prepared shader programs, and
    /// the two BVH levels.
    pub fn new(config: Config, scene: SceneFile, options: RenderOptions) -> Result<Engine, RenderError> {
        let width = config.width;

        // The image with all the requested buffers.
        let mut image = Image::new(config.width, config.height);
        for buffer in &config.buffers {
            image.add_buffer(buffer);
        }

        let seed = options.seed.unwrap_or_else(rand::random);

        let mut lib = Library::new();
        lib.store_camera(Camera::from_desc(&scene.camera, &config, seed));
        lib.store_config(config);

        let load_start = Instant::now();

        // Textures first; materials reference them by name.
        let mut texture_ids = HashMap::new();
        for desc in &scene.textures {
            let data = match &desc.source {
                TextureSource::Procedural { code } => Texture::Procedural { code: code.clone() },
                TextureSource::Image { path } => Texture::Image(ImageTexture::load(path)?),
                TextureSource::Pixels {
                    width,
                    height,
                    pixels,
                } => Texture::Image(ImageTexture::new(*width, *height, pixels.clone())?),
            };
            let id = lib.next_texture_id();
            lib.store_texture(id, TextureResource::new(data));
            texture_ids.insert(desc.name.as_str(), id);
        }

        let mut shader_ids = HashMap::new();
        for desc in &scene.shaders {
            let id = lib.next_shader_id();
            lib.store_shader(id, Shader::new(id, &desc.code));
            shader_ids.insert(desc.name.as_str(), id);
        }

        for desc in &scene.materials {
            let Some(&shader_id) = shader_ids.get(desc.shader.as_str()) else {
                return Err(SceneError::Invalid(format!(
                    "material '{}' references unknown shader '{}'",
                    desc.name, desc.shader
                ))
                .into());
            };

            let id = lib.next_material_id();
            let mut material = Material::new(id, shader_id);
            material.emissive = desc.emissive;
            for (slot, tex_name) in &desc.textures {
                let Some(&tex_id) = texture_ids.get(tex_name.as_str()) else {
                    return Err(SceneError::Invalid(format!(
                        "material '{}' references unknown texture '{}'",
                        desc.name, tex_name
                    ))
                    .into());
                };
                material.textures.insert(slot.clone(), tex_id);
            }
            lib.store_material(id, material, &desc.name);
        }

        // Meshes arrive through the sync callback, which also prepares
        // each shader and procedural texture exactly once.
        let mut total_verts = 0u64;
        let mut total_faces = 0u64;
        let mut total_bytes = 0u64;
        for desc in &scene.meshes {
            let material_id = lib.lookup_material_id(&desc.material);
            if material_id == 0 {
                return Err(SceneError::Invalid(format!(
                    "mesh references unknown material '{}'",
                    desc.material
                ))
                .into());
            }

            let mesh = Mesh::new(
                material_id,
                desc.matrix(),
                desc.vertex_data(),
                desc.triangles.clone(),
            );
            let (verts, faces, bytes) = (
                mesh.vertex_count() as u64,
                mesh.triangle_count() as u64,
                mesh.size_bytes() as u64,
            );

            sync_mesh(&mut lib, &image, Some(mesh))?;

            total_verts += verts;
            total_faces += faces;
            total_bytes += bytes;
            log::info!(
                "Loaded {}v, {}f, {} bytes ({}v, {}f, {:.1} KB total)",
                verts,
                faces,
                bytes,
                total_verts,
                total_faces,
                total_bytes as f32 / 1024.0
            );
        }

        let load_time = load_start.elapsed();

        // Build a triangle BVH per mesh, then the top-level BVH over the
        // mesh extents.
        log::info!("Building BVH");
        let build_start = Instant::now();

        let mut mesh_ids = Vec::new();
        lib.for_each_mesh(|id, _| mesh_ids.push(id));

        let mut mesh_bounds = Vec::new();
        for id in mesh_ids {
            let Some(mesh) = lib.lookup_mesh(id) else {
                continue;
            };
            let accel = Bvh::from_mesh(mesh);
            log::debug!("mesh {} BVH: {} nodes", id, accel.node_count());
            mesh_bounds.push((id, mesh.world_bounds()));
            lib.store_accel(id, accel);
        }
        lib.store_mbvh(Bvh::from_extents(&mesh_bounds));

        let build_time = build_start.elapsed();
        log::info!("Local BVH ready.");

        // The dispatcher owns the camera from here on; a single worker
        // owns the full image width.
        let mut camera = lib
            .take_camera()
            .expect("camera stored during scene load");
        camera.set_range(0, width);

        let beauty = match (
            image.buffer_id("R"),
            image.buffer_id("G"),
            image.buffer_id("B"),
        ) {
            (Some(r), Some(g), Some(b)) => Some([r, g, b]),
            _ => None,
        };

        // Freeze the library for the workers.
        let ctx = Arc::new(RenderContext { lib, beauty });
        let (results_tx, results_rx) = mpsc::channel();
        let max_jobs = options.max_jobs.max(1);
        let pool = WorkerPool::new(max_jobs as usize, ctx.clone(), results_tx);

        Ok(Engine {
            ctx,
            camera,
            image,
            pool,
            results_rx,
            pending: VecDeque::new(),
            active_jobs: 0,
            max_jobs,
            max_intervals: options.max_intervals,
            quiet_intervals: 0,
            interval: RenderStats::default(),
            totals: RenderStats::default(),
            load_time,
            build_time,
            render_time: Duration::ZERO,
        })
    }

    /// Drive the render to completion: keep up to `max_jobs` rays in
    /// flight until the camera is exhausted and the last forward has been
    /// processed, reporting stats once a second.
    pub fn render(&mut self) -> Result<(), RenderError> {
        let render_start = Instant::now();

        // Queue up some jobs.
        for _ in 0..self.max_jobs {
            self.schedule_job();
        }

        let mut next_tick = Instant::now() + STATS_PERIOD;
        while self.active_jobs > 0 {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(timeout) {
                Ok(results) => self.after_work(results),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    next_tick += STATS_PERIOD;
                    if self.on_stats_tick() {
                        log::warn!(
                            "no progress for {} intervals; abandoning render",
                            self.max_intervals
                        );
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Workers only disappear by panicking; there is no
                    // recovery that preserves their rays' contributions.
                    panic!("render workers disappeared");
                }
            }
        }

        self.render_time = render_start.elapsed();
        Ok(())
    }

    /// Write the image and report timings. Consumes the engine; dropping
    /// the pool terminates and joins the workers.
    pub fn finish(self) -> Result<RenderStats, RenderError> {
        let name = self
            .ctx
            .lib
            .lookup_config()
            .map(|config| config.name.clone())
            .unwrap_or_else(|| "render".to_string());
        let path = format!("{name}.exr");

        self.image.write_exr(&path)?;
        log::info!("Wrote {path}.");
        log::info!("Time spent loading: {:.2?}", self.load_time);
        log::info!("Time spent building: {:.2?}", self.build_time);
        log::info!("Time spent rendering: {:.2?}", self.render_time);

        Ok(self.totals)
    }

    /// Render and write the output in one step.
    pub fn run(mut self) -> Result<RenderStats, RenderError> {
        self.render()?;
        self.finish()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn stats(&self) -> &RenderStats {
        &self.totals
    }

    /// Put one more job in flight: a forwarded ray if any is waiting,
    /// otherwise the camera's next primary ray.
    fn schedule_job(&mut self) {
        // Don't schedule anything if we're maxed out.
        if self.active_jobs >= self.max_jobs {
            return;
        }

        let ray = match self.pending.pop_front() {
            Some(ray) => Some(ray),
            None => {
                let mut ray = FatRay::default();
                if self.camera.generate_primary(&mut ray) {
                    self.interval.intersects_produced += 1;
                    self.totals.intersects_produced += 1;
                    Some(ray)
                } else {
                    None
                }
            }
        };

        if let Some(ray) = ray {
            self.pool.submit(ray);
            self.active_jobs += 1;
        }
    }

    /// Fold a completed job back into the render: buffer ops in listed
    /// order, forwards into the local queue, counters into the stats.
    fn after_work(&mut self, mut results: WorkResults) {
        for op in &results.ops {
            match op.kind {
                BufferOpKind::Write => self.image.write(op.buffer, op.x, op.y, op.value),
                BufferOpKind::Accumulate => self.image.accumulate(op.buffer, op.x, op.y, op.value),
            }
        }

        for forward in results.forwards.drain(..) {
            match forward.node {
                // No destination known: requeue locally.
                None => self.pending.push_back(forward.ray),
                Some(node) => {
                    log::warn!("dropping ray forwarded to unknown worker {node}");
                }
            }
        }

        self.interval.merge(&results);
        self.totals.merge(&results);

        self.active_jobs -= 1;
        self.schedule_job();
    }

    /// One stats interval: report, then check the watchdog. Returns true
    /// when the render should be abandoned.
    fn on_stats_tick(&mut self) -> bool {
        self.interval.primary_progress = self.camera.progress();

        log::info!(
            "stats: {:.1}% primary, {} in flight | intersect +{}/-{} | illuminate +{}/-{} | light +{}/-{}",
            self.interval.primary_progress,
            self.active_jobs,
            self.interval.intersects_produced,
            self.interval.intersects_killed,
            self.interval.illuminates_produced,
            self.interval.illuminates_killed,
            self.interval.lights_produced,
            self.interval.lights_killed,
        );

        if self.interval.is_quiet() {
            self.quiet_intervals += 1;
        } else {
            self.quiet_intervals = 0;
        }
        self.interval.reset();

        self.max_intervals > 0 && self.quiet_intervals >= self.max_intervals
    }
}

/// Dispatch one ray on a worker thread.
///
/// Everything called from here must be thread-safe: it reads only the
/// frozen render context and the ray this job owns, and writes only into
/// the job's own results.
pub(crate) fn process_ray(ctx: &RenderContext, ray: FatRay, results: &mut WorkResults) {
    match ray.kind {
        RayKind::Intersect => process_intersect(ctx, ray, results),
        RayKind::Light => process_light(ctx, ray, results),
        RayKind::Illuminate => {
            // Reserved for the distributed emission pipeline.
            results.illuminates_killed += 1;
        }
    }
}

fn process_intersect(ctx: &RenderContext, mut ray: FatRay, results: &mut WorkResults) {
    // Test geometry for intersection.
    ray.traversal.hit = ctx.lib.intersect(&mut ray, WORKER_ID);

    if ray.hit.is_hit() {
        illuminate_intersection(ctx, &ray, results);
    }

    // The ray dies here either way.
    results.intersects_killed += 1;
}

fn illuminate_intersection(ctx: &RenderContext, ray: &FatRay, results: &mut WorkResults) {
    // Where did we hit?
    let hit_point = ray.evaluate_at(ray.hit.t);

    // Find the shader and run its indirect response.
    let program = ctx
        .lib
        .lookup_mesh(ray.hit.mesh)
        .and_then(|mesh| ctx.lib.lookup_material(mesh.material))
        .and_then(|mat| ctx.lib.lookup_shader(mat.shader))
        .and_then(|shader| shader.program.as_deref());

    match program {
        Some(program) => program.indirect(&ctx.lib, ray, hit_point, results),
        None => debug_assert!(false, "hit mesh without a prepared shader"),
    }
}

fn process_light(ctx: &RenderContext, mut ray: FatRay, results: &mut WorkResults) {
    // Occlusion test, bounded to stop just short of the light sample.
    let distance = (ray.target - ray.slim.origin).length();
    ray.hit = HitRecord {
        t: distance - SHADOW_BIAS,
        ..HitRecord::default()
    };

    ctx.lib.intersect(&mut ray, WORKER_ID);

    if !ray.hit.is_hit() {
        // Unoccluded: the carried radiance reaches the primary sample.
        if let Some([r, g, b]) = ctx.beauty {
            results.accumulate(r, ray.x, ray.y, ray.emission.x * ray.transmittance);
            results.accumulate(g, ray.x, ray.y, ray.emission.y * ray.transmittance);
            results.accumulate(b, ray.x, ray.y, ray.emission.z * ray.transmittance);
        }
    }

    results.lights_killed += 1;
}
