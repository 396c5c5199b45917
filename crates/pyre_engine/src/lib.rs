//! Pyre Engine - the ray-processing pipeline.
//!
//! A single dispatcher thread feeds primary rays from the camera into a
//! worker pool; workers intersect rays against the scene's two-level BVH
//! and run shader programs at the hits, producing per-job work results;
//! the dispatcher folds those results into the output image and schedules
//! the next ray until the camera is exhausted and the in-flight jobs have
//! drained.

mod bvh;
mod camera;
mod engine;
mod image;
mod library;
mod pool;
mod ray;
mod shader;
mod work;

pub use bvh::{Bvh, FromDirection, LinearNode, TraversalState, Visit};
pub use camera::Camera;
pub use engine::{sync_mesh, Engine, RenderError, RenderOptions};
pub use image::Image;
pub use library::Library;
pub use ray::{FatRay, HitRecord, RayKind};
pub use shader::{Shader, ShaderError, ShaderProgram, TextureProgram, TextureResource};
pub use work::{BufferOp, BufferOpKind, Forward, RenderStats, WorkResults};

/// Re-export common math types from pyre_math
pub use pyre_math::{Aabb, Interval, SlimRay, Vec3};
