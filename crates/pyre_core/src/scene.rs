//! Scene files.
//!
//! A scene is described in JSON: one camera, plus flat lists of textures,
//! shaders, materials, and meshes that reference each other by name. The
//! engine materializes these descriptions into library resources (resolving
//! the names into ids) through its mesh-sync path; this module only defines
//! the file format and its structural validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use pyre_math::{Mat4, Vec2, Vec3, Vec4};
use serde::Deserialize;
use thiserror::Error;

use crate::mesh::Vertex;

/// Errors that can occur while loading a scene file.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scene parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid scene: {0}")]
    Invalid(String),
}

/// Camera description: a look-at frame plus an optional roll.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraDesc {
    pub eye: [f32; 3],
    pub look: [f32; 3],
    #[serde(default)]
    pub up: Option<[f32; 3]>,
    /// Roll around the gaze vector, in degrees
    #[serde(default)]
    pub rotation: f32,
    /// Screen aspect ratio override (defaults to the config's width/height)
    #[serde(default)]
    pub ratio: Option<f32>,
}

/// Texture description; the three source kinds match what the library
/// stores: procedural code, an image file, or inline samples.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TextureSource {
    Procedural {
        code: String,
    },
    Image {
        path: String,
    },
    Pixels {
        width: u32,
        height: u32,
        pixels: Vec<f32>,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct TextureDesc {
    pub name: String,
    #[serde(flatten)]
    pub source: TextureSource,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShaderDesc {
    pub name: String,
    /// Opaque shader source, handed to the shader bridge
    pub code: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterialDesc {
    pub name: String,
    /// Shader reference by name
    pub shader: String,
    #[serde(default)]
    pub emissive: bool,
    /// Texture slot name -> texture reference by name
    #[serde(default)]
    pub textures: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VertexDesc {
    pub v: [f32; 3],
    pub n: [f32; 3],
    #[serde(default)]
    pub t: [f32; 2],
}

fn identity_rows() -> [[f32; 4]; 4] {
    [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshDesc {
    /// Material reference by name
    pub material: String,
    /// Object-to-world transform as four matrix rows
    #[serde(default = "identity_rows")]
    pub transform: [[f32; 4]; 4],
    pub vertices: Vec<VertexDesc>,
    pub triangles: Vec<[u32; 3]>,
}

impl MeshDesc {
    /// The object-to-world matrix described by the row-major `transform`.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::from_array(self.transform[0]),
            Vec4::from_array(self.transform[1]),
            Vec4::from_array(self.transform[2]),
            Vec4::from_array(self.transform[3]),
        )
        .transpose()
    }

    /// Vertices as mesh data, normals normalized on the way in.
    pub fn vertex_data(&self) -> Vec<Vertex> {
        self.vertices
            .iter()
            .map(|vd| {
                Vertex::new(
                    Vec3::from_array(vd.v),
                    Vec3::from_array(vd.n).normalize_or_zero(),
                    Vec2::from_array(vd.t),
                )
            })
            .collect()
    }
}

/// A parsed scene file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneFile {
    pub camera: CameraDesc,
    #[serde(default)]
    pub textures: Vec<TextureDesc>,
    #[serde(default)]
    pub shaders: Vec<ShaderDesc>,
    #[serde(default)]
    pub materials: Vec<MaterialDesc>,
    #[serde(default)]
    pub meshes: Vec<MeshDesc>,
}

impl SceneFile {
    /// Load and validate a scene from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<SceneFile, SceneError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a scene from a JSON string (used by tests).
    pub fn from_json(text: &str) -> Result<SceneFile, SceneError> {
        let scene: SceneFile = serde_json::from_str(text)?;
        scene.validate()?;
        Ok(scene)
    }

    /// Structural validation: names are unique, references resolve, and
    /// triangle indices are in range. Resource preparation (shader code,
    /// procedural textures) is the engine's job and fails separately.
    fn validate(&self) -> Result<(), SceneError> {
        let mut texture_names = Vec::new();
        for tex in &self.textures {
            if texture_names.contains(&&tex.name) {
                return Err(SceneError::Invalid(format!("duplicate texture '{}'", tex.name)));
            }
            texture_names.push(&tex.name);
        }

        let mut shader_names = Vec::new();
        for shader in &self.shaders {
            if shader_names.contains(&&shader.name) {
                return Err(SceneError::Invalid(format!("duplicate shader '{}'", shader.name)));
            }
            shader_names.push(&shader.name);
        }

        let mut material_names = Vec::new();
        for mat in &self.materials {
            if material_names.contains(&&mat.name) {
                return Err(SceneError::Invalid(format!("duplicate material '{}'", mat.name)));
            }
            material_names.push(&mat.name);

            if !shader_names.contains(&&mat.shader) {
                return Err(SceneError::Invalid(format!(
                    "material '{}' references unknown shader '{}'",
                    mat.name, mat.shader
                )));
            }
            for tex_name in mat.textures.values() {
                if !texture_names.contains(&tex_name) {
                    return Err(SceneError::Invalid(format!(
                        "material '{}' references unknown texture '{}'",
                        mat.name, tex_name
                    )));
                }
            }
        }

        for (i, mesh) in self.meshes.iter().enumerate() {
            if !material_names.contains(&&mesh.material) {
                return Err(SceneError::Invalid(format!(
                    "mesh #{} references unknown material '{}'",
                    i, mesh.material
                )));
            }
            if mesh.vertices.is_empty() || mesh.triangles.is_empty() {
                return Err(SceneError::Invalid(format!("mesh #{i} has no geometry")));
            }
            let nverts = mesh.vertices.len() as u32;
            for tri in &mesh.triangles {
                if tri.iter().any(|&idx| idx >= nverts) {
                    return Err(SceneError::Invalid(format!(
                        "mesh #{} triangle {:?} indexes past {} vertices",
                        i, tri, nverts
                    )));
                }
            }
        }

        Ok(())
    }
}
