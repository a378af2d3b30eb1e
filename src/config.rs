use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::frame::PixelFormat;

/// Highest framerate the generic format proposal advertises
pub const MAX_FPS: u32 = 1000;

/// A pixel format the caller can import, with the modifiers it supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFormat {
    /// SPA video format id
    pub format: u32,
    /// Memory layout modifiers, most preferred first
    #[serde(default)]
    pub modifiers: Vec<u64>,
}

impl CandidateFormat {
    pub fn new(format: PixelFormat, modifiers: Vec<u64>) -> Self {
        Self {
            format: format.as_spa(),
            modifiers,
        }
    }

    /// The modifier offered as the preferred choice during negotiation
    pub fn preferred_modifier(&self) -> Option<u64> {
        self.modifiers.first().copied()
    }
}

/// Configuration for a PipeWire stream capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeWireConfig {
    /// Stream and service thread name
    pub name: String,
    /// PipeWire node to connect to
    pub node_id: u32,
    /// Preferred frames per second
    pub fps: u32,
    /// GPU-importable formats, in priority order
    pub formats: Vec<CandidateFormat>,
    /// Capacity of the event channel between the service thread and the caller
    pub queue_depth: usize,
}

impl Default for PipeWireConfig {
    fn default() -> Self {
        Self {
            name: "deskcap".to_string(),
            node_id: 0,
            fps: 60,
            formats: Vec::new(),
            queue_depth: 4,
        }
    }
}

impl PipeWireConfig {
    /// Whether any candidate asks for GPU-importable buffers
    pub fn wants_dmabuf(&self) -> bool {
        self.formats.iter().any(|f| !f.modifiers.is_empty())
    }
}

/// Pixels cut from each edge of the captured screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CropMargins {
    pub top: i32,
    pub left: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Configuration for an X11 shared-memory capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XshmConfig {
    /// Index of the monitor (RandR/Xinerama) or X screen to capture
    pub screen: u32,
    /// X display name, `None` uses `$DISPLAY`
    pub display: Option<String>,
    /// Edge crop applied to the raw screen geometry
    pub crop: CropMargins,
    /// Rate the caller intends to poll at, reported in frame descriptors
    pub fps: u32,
}

impl Default for XshmConfig {
    fn default() -> Self {
        Self {
            screen: 0,
            display: None,
            crop: CropMargins::default(),
            fps: 60,
        }
    }
}

/// Backend selection plus its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CaptureConfig {
    PipeWire(PipeWireConfig),
    Xshm(XshmConfig),
}

/// Validation error for capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn validate_fps(fps: u32) -> Result<(), ConfigError> {
    if fps == 0 || fps > MAX_FPS {
        return Err(ConfigError::new(
            "fps",
            format!("FPS must be between 1 and {}", MAX_FPS),
        ));
    }
    Ok(())
}

impl PipeWireConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::new("name", "Stream name cannot be empty"));
        }

        validate_fps(self.fps)?;

        if self.queue_depth == 0 {
            return Err(ConfigError::new(
                "queue_depth",
                "Queue depth must be at least 1",
            ));
        }

        for (i, candidate) in self.formats.iter().enumerate() {
            let mut seen = HashSet::new();
            if !candidate.modifiers.iter().all(|m| seen.insert(*m)) {
                return Err(ConfigError::new(
                    &format!("formats[{}].modifiers", i),
                    "Modifier list contains duplicates",
                ));
            }
        }

        Ok(())
    }
}

impl XshmConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_fps(self.fps)?;

        let crop = &self.crop;
        for (field, value) in [
            ("crop.top", crop.top),
            ("crop.left", crop.left),
            ("crop.right", crop.right),
            ("crop.bottom", crop.bottom),
        ] {
            if value < 0 {
                return Err(ConfigError::new(field, "Crop margin cannot be negative"));
            }
        }

        Ok(())
    }
}

impl CaptureConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::PipeWire(config) => config.validate(),
            Self::Xshm(config) => config.validate(),
        }
    }

    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::new("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
