//! Pyre Core - scene data for the render pipeline.
//!
//! This crate provides:
//!
//! - **Render configuration**: `Config` (image dimensions, buffers,
//!   antialiasing, output name)
//! - **Scene data types**: `Mesh`, `Material`, `Texture`
//! - **Scene files**: JSON descriptions deserialized into `SceneFile`
//!
//! # Example
//!
//! ```ignore
//! use pyre_core::{Config, SceneFile};
//!
//! let config = Config::load("render.json")?;
//! let scene = SceneFile::load("cornell.json")?;
//! println!("{} meshes at {}x{}", scene.meshes.len(), config.width, config.height);
//! ```

pub mod config;
pub mod material;
pub mod mesh;
pub mod scene;
pub mod texture;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use material::Material;
pub use mesh::{LocalGeometry, Mesh, Vertex};
pub use scene::{SceneError, SceneFile};
pub use texture::{ImageTexture, Texture, TextureError};
