//! Scalar textures.
//!
//! Pyre's image buffers and texture channels are single float planes, so a
//! texture samples to one scalar. Colored albedos come from binding one
//! texture per channel slot. Textures are either image-backed (loaded from
//! disk through the `image` crate) or procedural (a code string compiled
//! once by the shader bridge before rendering starts).

use std::path::Path;

use thiserror::Error;

/// Errors that can occur during texture loading.
#[derive(Error, Debug)]
pub enum TextureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid texture: {0}")]
    Invalid(String),
}

/// A single-channel float image with bilinear sampling.
#[derive(Clone, Debug)]
pub struct ImageTexture {
    pub width: u32,
    pub height: u32,

    /// Row-major float samples, `width * height` of them
    pub pixels: Vec<f32>,
}

impl ImageTexture {
    /// Create an image texture from raw samples.
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Result<Self, TextureError> {
        if width == 0 || height == 0 || pixels.len() != (width * height) as usize {
            return Err(TextureError::Invalid(format!(
                "expected {}x{} = {} samples, got {}",
                width,
                height,
                width * height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Load a texture from a file, converted to a single luminance channel.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TextureError> {
        let path = path.as_ref();
        let img = image::open(path)?.to_luma32f();
        let (width, height) = img.dimensions();

        log::debug!(
            "Loaded texture {} ({}x{}, {:.1} KB)",
            path.display(),
            width,
            height,
            (width * height * 4) as f32 / 1024.0
        );

        Self::new(width, height, img.into_raw())
    }

    /// Sample the texture at UV coordinates with bilinear filtering.
    ///
    /// UV coordinates wrap; (0, 0) is the bottom-left corner.
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        let u = u.rem_euclid(1.0);
        let v = v.rem_euclid(1.0);

        // Convert to pixel coordinates, V flipped for image row order
        let x = u * (self.width as f32 - 1.0);
        let y = (1.0 - v) * (self.height as f32 - 1.0);

        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let fx = x.fract();
        let fy = y.fract();

        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn get(&self, x: u32, y: u32) -> f32 {
        self.pixels
            .get((y * self.width + x) as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

/// A texture resource as stored in the library.
#[derive(Clone, Debug)]
pub enum Texture {
    /// Procedural texture: an opaque code string, compiled once into a
    /// sampling program by the shader bridge
    Procedural { code: String },

    /// Image-backed texture
    Image(ImageTexture),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_texture_shape_check() {
        assert!(ImageTexture::new(2, 2, vec![0.0; 4]).is_ok());
        assert!(ImageTexture::new(2, 2, vec![0.0; 3]).is_err());
        assert!(ImageTexture::new(0, 2, vec![]).is_err());
    }

    #[test]
    fn test_sample_constant() {
        let tex = ImageTexture::new(2, 2, vec![0.25; 4]).unwrap();
        assert!((tex.sample(0.3, 0.7) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_sample_wraps() {
        let tex = ImageTexture::new(2, 2, vec![0.5; 4]).unwrap();
        assert!((tex.sample(1.3, -0.7) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sample_bilinear_blend() {
        // Left column 0, right column 1: sampling mid-way blends
        let tex = ImageTexture::new(2, 1, vec![0.0, 1.0]).unwrap();
        let mid = tex.sample(0.5, 0.5);
        assert!(mid > 0.1 && mid < 0.9);
    }
}
