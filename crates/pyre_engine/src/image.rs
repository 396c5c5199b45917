//! Multi-buffer float image.
//!
//! The output image is a set of named float planes ("R", "G", "B",
//! arbitrary AOVs) sharing one resolution. Shaders address buffers by
//! dense id, resolved from the name once at preparation time. All pixel
//! operations happen on the dispatcher thread; the final image is written
//! as one multi-channel OpenEXR file with one channel per buffer.

use std::collections::HashMap;
use std::path::Path;

use exr::prelude::{self as exrs, WritableImage};

pub struct Image {
    width: u32,
    height: u32,
    names: Vec<String>,
    buffers: Vec<Vec<f32>>,
    index: HashMap<String, usize>,
}

impl Image {
    /// Create an image with no buffers yet.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            names: Vec::new(),
            buffers: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Add a named buffer, zero-filled, returning its dense id. Adding a
    /// name twice returns the existing buffer.
    pub fn add_buffer(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.buffers.len();
        self.names.push(name.to_string());
        self.buffers
            .push(vec![0.0; (self.width * self.height) as usize]);
        self.index.insert(name.to_string(), id);
        id
    }

    /// Resolve a buffer name to its dense id.
    pub fn buffer_id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Replace the pixel value.
    pub fn write(&mut self, buffer: usize, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        self.buffers[buffer][idx] = value;
    }

    /// Add to the pixel value.
    pub fn accumulate(&mut self, buffer: usize, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        self.buffers[buffer][idx] += value;
    }

    /// Read a pixel value back.
    pub fn value(&self, buffer: usize, x: u32, y: u32) -> f32 {
        self.buffers[buffer][(y * self.width + x) as usize]
    }

    /// Write all buffers to a multi-channel OpenEXR file, one named
    /// channel per buffer.
    pub fn write_exr(&self, path: impl AsRef<Path>) -> Result<(), exr::error::Error> {
        let channels: Vec<exrs::AnyChannel<exrs::FlatSamples>> = self
            .names
            .iter()
            .zip(&self.buffers)
            .map(|(name, data)| {
                exrs::AnyChannel::new(name.as_str(), exrs::FlatSamples::F32(data.clone()))
            })
            .collect();

        let layer = exrs::Layer::new(
            (self.width as usize, self.height as usize),
            exrs::LayerAttributes::default(),
            exrs::Encoding::FAST_LOSSLESS,
            exrs::AnyChannels::sort(channels.into()),
        );

        exrs::Image::from_layer(layer).write().to_file(path)
    }
}
