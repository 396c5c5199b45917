//! Render configuration.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading a config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_antialiasing() -> u32 {
    1
}

fn default_max_bounces() -> u32 {
    4
}

/// Output configuration for a render.
///
/// The `buffers` list names the float channels of the output image; the
/// first three conventionally carry the beauty result ("R", "G", "B" map
/// directly onto EXR channel names).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Named float buffers of the output image
    pub buffers: Vec<String>,

    /// Antialiasing grid factor; A > 1 casts A*A stratified samples per pixel
    #[serde(default = "default_antialiasing")]
    pub antialiasing: u32,

    /// Output name; the final image is written to `<name>.exr`
    pub name: String,

    /// Maximum number of times a ray may be respawned by a shader
    #[serde(default = "default_max_bounces")]
    pub max_bounces: u32,
}

impl Config {
    /// Load and validate a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string (used by tests).
    pub fn from_json(text: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "image dimensions must be nonzero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.buffers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one image buffer is required".to_string(),
            ));
        }
        for (i, name) in self.buffers.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::Invalid("buffer names must be nonempty".to_string()));
            }
            if self.buffers[..i].contains(name) {
                return Err(ConfigError::Invalid(format!("duplicate buffer name '{name}'")));
            }
        }
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("output name must be nonempty".to_string()));
        }
        Ok(())
    }

    /// Default aspect ratio implied by the image dimensions.
    pub fn ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}
