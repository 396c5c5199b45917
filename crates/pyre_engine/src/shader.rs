//! Shader and procedural texture bridge.
//!
//! The scripting runtime that interprets shader source is an external
//! collaborator; the engine only consumes a prepared, thread-safe
//! capability: given the ray and its hit, fill a `WorkResults` with
//! buffer operations and spawned rays. Programs are prepared exactly once
//! (the first time their material is synced) with buffer names resolved
//! to dense image ids, and are immutable afterwards so any worker may
//! call them.
//!
//! In this build the shader resource's code string selects one of the
//! built-in programs; unknown code is a load-time error.

use pyre_core::{Material, Texture};
use pyre_math::{SlimRay, Vec2, Vec3};
use thiserror::Error;

use crate::image::Image;
use crate::library::Library;
use crate::ray::{FatRay, RayKind};
use crate::work::WorkResults;

/// Albedo used for unbound color slots.
const DEFAULT_ALBEDO: f32 = 0.8;

/// Constant ambient term of the matte shader.
const AMBIENT: f32 = 0.05;

/// Fraction of transmittance a mirror bounce keeps.
const REFLECTIVITY: f32 = 0.8;

/// Offset along the surface normal for spawned ray origins.
const SPAWN_OFFSET: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("unknown shader code '{0}'")]
    UnknownShader(String),

    #[error("bad procedural texture code '{0}'")]
    BadTextureCode(String),

    #[error("shader '{shader}' requires image buffer '{buffer}'")]
    MissingBuffer { shader: String, buffer: String },
}

/// The capability the render core consumes: respond to an intersection.
///
/// Implementations read only the frozen library and the ray they are
/// given, and write only into the job's own `WorkResults`; that makes
/// them callable from any worker thread without synchronization. Spawned
/// rays go into `results.forwards` with the spawning ray's `bounces + 1`.
pub trait ShaderProgram: Send + Sync {
    fn indirect(&self, lib: &Library, ray: &FatRay, hit_point: Vec3, results: &mut WorkResults);
}

/// A shader resource: opaque source plus the program prepared from it.
pub struct Shader {
    pub id: u32,
    pub code: String,
    pub program: Option<Box<dyn ShaderProgram>>,
}

impl Shader {
    pub fn new(id: u32, code: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            program: None,
        }
    }
}

/// A procedural texture compiled from its code string.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TextureProgram {
    /// `const <value>`: the same value everywhere
    Const(f32),

    /// `checker <scale> <a> <b>`: alternating squares of a and b
    Checker { scale: f32, a: f32, b: f32 },
}

impl TextureProgram {
    /// Compile a procedural texture code string.
    pub fn prepare(code: &str) -> Result<TextureProgram, ShaderError> {
        let bad = || ShaderError::BadTextureCode(code.to_string());
        let mut tokens = code.split_whitespace();

        let program = match tokens.next().ok_or_else(bad)? {
            "const" => {
                let value = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
                TextureProgram::Const(value)
            }
            "checker" => {
                let mut num = || -> Result<f32, ShaderError> {
                    tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)
                };
                TextureProgram::Checker {
                    scale: num()?,
                    a: num()?,
                    b: num()?,
                }
            }
            _ => return Err(bad()),
        };

        Ok(program)
    }

    pub fn sample(&self, u: f32, v: f32) -> f32 {
        match *self {
            TextureProgram::Const(value) => value,
            TextureProgram::Checker { scale, a, b } => {
                let cell =
                    (u * scale).floor() as i64 + (v * scale).floor() as i64;
                if cell.rem_euclid(2) == 0 {
                    a
                } else {
                    b
                }
            }
        }
    }
}

/// A texture resource: the stored data plus, for procedural textures, the
/// program prepared from its code.
pub struct TextureResource {
    pub data: Texture,
    pub program: Option<TextureProgram>,
}

impl TextureResource {
    pub fn new(data: Texture) -> Self {
        Self {
            data,
            program: None,
        }
    }

    /// Sample the texture at (u, v).
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        match &self.data {
            Texture::Image(img) => img.sample(u, v),
            Texture::Procedural { .. } => match &self.program {
                Some(program) => program.sample(u, v),
                None => {
                    debug_assert!(false, "procedural texture sampled before preparation");
                    0.0
                }
            },
        }
    }
}

/// Prepare the program for a shader's code string, resolving the buffers
/// it writes to. Called once per shader, before rendering starts.
pub fn prepare_shader(code: &str, image: &Image) -> Result<Box<dyn ShaderProgram>, ShaderError> {
    match code {
        "matte" => Ok(Box::new(MatteProgram {
            rgb: rgb_buffers(code, image)?,
        })),
        "emissive" => Ok(Box::new(EmissiveProgram {
            rgb: rgb_buffers(code, image)?,
        })),
        "mirror" => Ok(Box::new(MirrorProgram)),
        "normal" => Ok(Box::new(NormalProgram {
            rgb: rgb_buffers(code, image)?,
        })),
        #[cfg(test)]
        "test.probe" => Ok(Box::new(probe::ProbeProgram {
            rgb: rgb_buffers(code, image)?,
        })),
        _ => Err(ShaderError::UnknownShader(code.to_string())),
    }
}

fn rgb_buffers(shader: &str, image: &Image) -> Result<[usize; 3], ShaderError> {
    let mut ids = [0usize; 3];
    for (slot, name) in ids.iter_mut().zip(["R", "G", "B"]) {
        *slot = image
            .buffer_id(name)
            .ok_or_else(|| ShaderError::MissingBuffer {
                shader: shader.to_string(),
                buffer: name.to_string(),
            })?;
    }
    Ok(ids)
}

/// Sample one of a material's scalar texture slots.
fn sample_slot(lib: &Library, mat: &Material, slot: &str, uv: Vec2, default: f32) -> f32 {
    match mat.texture(slot) {
        0 => default,
        id => lib
            .lookup_texture(id)
            .map(|tex| tex.sample(uv.x, uv.y))
            .unwrap_or(default),
    }
}

/// The r/g/b slots of a material, as a color.
fn albedo(lib: &Library, mat: &Material, uv: Vec2) -> Vec3 {
    Vec3::new(
        sample_slot(lib, mat, "r", uv, DEFAULT_ALBEDO),
        sample_slot(lib, mat, "g", uv, DEFAULT_ALBEDO),
        sample_slot(lib, mat, "b", uv, DEFAULT_ALBEDO),
    )
}

/// Radiant color of an emissive material. Sampled at the slot center;
/// emitters are treated as uniform.
fn emission_color(lib: &Library, mat: &Material) -> Vec3 {
    let uv = Vec2::new(0.5, 0.5);
    Vec3::new(
        sample_slot(lib, mat, "r", uv, 0.0),
        sample_slot(lib, mat, "g", uv, 0.0),
        sample_slot(lib, mat, "b", uv, 0.0),
    )
}

fn material_of<'a>(lib: &'a Library, ray: &FatRay) -> Option<&'a Material> {
    let mesh = lib.lookup_mesh(ray.hit.mesh)?;
    lib.lookup_material(mesh.material)
}

/// Lambertian surface: a small ambient term now, plus one light ray per
/// emissive mesh whose contribution lands only if the dispatcher finds it
/// unoccluded.
struct MatteProgram {
    rgb: [usize; 3],
}

impl ShaderProgram for MatteProgram {
    fn indirect(&self, lib: &Library, ray: &FatRay, hit_point: Vec3, results: &mut WorkResults) {
        let Some(mat) = material_of(lib, ray) else {
            debug_assert!(false, "shaded ray without material");
            return;
        };

        let n = ray.hit.geom.n;
        let color = albedo(lib, mat, ray.hit.geom.tex);

        for (buffer, channel) in self.rgb.iter().zip([color.x, color.y, color.z]) {
            results.accumulate(*buffer, ray.x, ray.y, AMBIENT * channel * ray.transmittance);
        }

        // Direct lighting: one occlusion ray per emissive mesh, carrying
        // the radiance to deposit if the path is clear.
        for &light_id in lib.emissive_meshes() {
            if light_id == ray.hit.mesh {
                continue;
            }
            let Some(light) = lib.lookup_mesh(light_id) else {
                continue;
            };
            let Some(light_mat) = lib.lookup_material(light.material) else {
                continue;
            };

            let emission = emission_color(lib, light_mat);
            if emission == Vec3::ZERO {
                continue;
            }

            let to_light = light.centroid - hit_point;
            let dist2 = to_light.length_squared();
            if dist2 < 1e-6 {
                continue;
            }
            let dir = to_light / dist2.sqrt();
            let cos = n.dot(dir);
            if cos <= 0.0 {
                continue;
            }

            let mut light_ray = FatRay::default();
            light_ray.kind = RayKind::Light;
            light_ray.x = ray.x;
            light_ray.y = ray.y;
            light_ray.bounces = ray.bounces + 1;
            light_ray.slim = SlimRay::new(hit_point + n * SPAWN_OFFSET, dir);
            light_ray.transmittance = ray.transmittance;
            light_ray.target = light.centroid;
            light_ray.emission = color * emission * cos / dist2;

            results.forward(light_ray);
            results.lights_produced += 1;
        }
    }
}

/// Emitting surface: deposits its own radiance directly.
struct EmissiveProgram {
    rgb: [usize; 3],
}

impl ShaderProgram for EmissiveProgram {
    fn indirect(&self, lib: &Library, ray: &FatRay, _hit_point: Vec3, results: &mut WorkResults) {
        let Some(mat) = material_of(lib, ray) else {
            debug_assert!(false, "shaded ray without material");
            return;
        };

        let emission = emission_color(lib, mat);
        for (buffer, channel) in self.rgb.iter().zip([emission.x, emission.y, emission.z]) {
            results.accumulate(*buffer, ray.x, ray.y, channel * ray.transmittance);
        }
    }
}

/// Perfect mirror: respawns the ray along the reflection, attenuated,
/// until the bounce budget runs out. The spawned ray re-enters the
/// pipeline through the dispatcher rather than recursing here.
struct MirrorProgram;

impl ShaderProgram for MirrorProgram {
    fn indirect(&self, lib: &Library, ray: &FatRay, hit_point: Vec3, results: &mut WorkResults) {
        let max_bounces = lib.lookup_config().map_or(0, |c| c.max_bounces);
        if ray.bounces >= max_bounces {
            return;
        }

        let n = ray.hit.geom.n;
        let d = ray.slim.direction;
        let reflected = (d - 2.0 * d.dot(n) * n).normalize();

        let mut child = FatRay::default();
        child.kind = RayKind::Intersect;
        child.x = ray.x;
        child.y = ray.y;
        child.bounces = ray.bounces + 1;
        child.slim = SlimRay::new(hit_point + n * SPAWN_OFFSET, reflected);
        child.transmittance = ray.transmittance * REFLECTIVITY;

        results.forward(child);
        results.intersects_produced += 1;
    }
}

/// Debug AOV: the world-space shading normal mapped into [0, 1].
///
/// Writes rather than accumulates; with supersampling the last sample of
/// a pixel wins, which is what a diagnostic pass wants.
struct NormalProgram {
    rgb: [usize; 3],
}

impl ShaderProgram for NormalProgram {
    fn indirect(&self, _lib: &Library, ray: &FatRay, _hit_point: Vec3, results: &mut WorkResults) {
        let n = ray.hit.geom.n * 0.5 + Vec3::splat(0.5);
        for (buffer, channel) in self.rgb.iter().zip([n.x, n.y, n.z]) {
            results.write(*buffer, ray.x, ray.y, channel);
        }
    }
}

#[cfg(test)]
pub(crate) mod probe {
    //! Instrumented shader used to observe worker concurrency in tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    pub static CURRENT: AtomicU32 = AtomicU32::new(0);
    pub static PEAK: AtomicU32 = AtomicU32::new(0);

    pub fn reset() {
        CURRENT.store(0, Ordering::SeqCst);
        PEAK.store(0, Ordering::SeqCst);
    }

    pub struct ProbeProgram {
        pub rgb: [usize; 3],
    }

    impl ShaderProgram for ProbeProgram {
        fn indirect(&self, _lib: &Library, ray: &FatRay, _hit: Vec3, results: &mut WorkResults) {
            let now = CURRENT.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            CURRENT.fetch_sub(1, Ordering::SeqCst);

            results.accumulate(self.rgb[0], ray.x, ray.y, ray.transmittance);
        }
    }
}
