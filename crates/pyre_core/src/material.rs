//! Material data.

use std::collections::HashMap;

/// A material binds a shader to a set of named texture slots.
///
/// Which slots a shader reads is the shader's business; the material just
/// carries the bindings by resource id. Shader and texture references are
/// ids into the library, never back-pointers.
#[derive(Clone, Debug)]
pub struct Material {
    /// Resource id of this material
    pub id: u32,

    /// Shader resource id
    pub shader: u32,

    /// Emissive materials turn their meshes into light sources
    pub emissive: bool,

    /// Texture slot name -> texture resource id
    pub textures: HashMap<String, u32>,
}

impl Material {
    pub fn new(id: u32, shader: u32) -> Self {
        Self {
            id,
            shader,
            emissive: false,
            textures: HashMap::new(),
        }
    }

    /// Look up a texture slot, 0 when the slot is unbound.
    pub fn texture(&self, slot: &str) -> u32 {
        self.textures.get(slot).copied().unwrap_or(0)
    }
}
