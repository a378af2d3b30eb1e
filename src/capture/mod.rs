// Capture backend abstraction
//
// This module defines the contract shared by the capture backends and picks
// the right one for the running desktop session.

pub mod pipewire;
pub mod xshm;

#[cfg(feature = "portal")]
pub mod portal;

#[cfg(test)]
pub mod fake;

use crate::config::CaptureConfig;
use crate::frame::OwnedFrame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors that can occur during capture operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CaptureBackendError {
    /// Could not reach the PipeWire daemon or the X server
    ConnectionFailed(String),
    /// A required protocol extension is not available
    MissingExtension(String),
    /// Service thread, context, core or stream could not be created
    StreamSetup(String),
    /// Format negotiation or param building failed
    Negotiation(String),
    /// Shared-memory segment could not be created or attached
    SegmentAttach(String),
    /// Screen geometry query failed or produced an unusable size
    Geometry(String),
    /// Portal communication error
    PortalError(String),
    /// User denied permission or cancelled selection
    PermissionDenied(String),
    /// Backend not available on this platform or build
    NotSupported(String),
    /// Configuration rejected before any native call was made
    InvalidConfig(String),
    /// Internal error
    Internal(String),
}

impl fmt::Display for CaptureBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            Self::MissingExtension(msg) => write!(f, "Missing extension: {}", msg),
            Self::StreamSetup(msg) => write!(f, "Stream setup failed: {}", msg),
            Self::Negotiation(msg) => write!(f, "Format negotiation failed: {}", msg),
            Self::SegmentAttach(msg) => write!(f, "Shared memory attach failed: {}", msg),
            Self::Geometry(msg) => write!(f, "Geometry error: {}", msg),
            Self::PortalError(msg) => write!(f, "Portal error: {}", msg),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Self::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureBackendError {}

/// Common lifecycle of a desktop capture backend
///
/// Both backends follow create → start → receive → pause/resume → stop.
/// `receive` never blocks: it returns the newest frame available, or `None`.
pub trait DesktopCapture {
    /// Human readable backend name, used in logs
    fn name(&self) -> &str;

    /// Open the native session (if needed) and begin capturing
    fn start(&mut self) -> Result<(), CaptureBackendError>;

    /// Take the most recent frame, if one is ready
    fn receive(&mut self) -> Option<OwnedFrame>;

    /// Suspend frame delivery without tearing the session down
    fn pause(&mut self) -> Result<(), CaptureBackendError>;

    /// Resume frame delivery after `pause`
    fn resume(&mut self) -> Result<(), CaptureBackendError>;

    /// Tear the native session down. Calling it twice is harmless.
    fn stop(&mut self);

    /// Whether `start` succeeded and `stop` has not been called since
    fn is_running(&self) -> bool;
}

/// Kind of desktop session the process is running in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Wayland compositor, capture through PipeWire
    Wayland,
    /// X server, capture through MIT-SHM
    X11,
}

impl SessionKind {
    /// Detect the session kind from `WAYLAND_DISPLAY` / `DISPLAY`
    pub fn detect() -> Option<Self> {
        let wayland = std::env::var("WAYLAND_DISPLAY").ok();
        let x11 = std::env::var("DISPLAY").ok();
        Self::from_env(wayland.as_deref(), x11.as_deref())
    }

    /// Wayland wins when both are set (XWayland exports `DISPLAY` too)
    pub fn from_env(wayland_display: Option<&str>, x11_display: Option<&str>) -> Option<Self> {
        let set = |v: Option<&str>| v.map(|s| !s.is_empty()).unwrap_or(false);
        if set(wayland_display) {
            Some(Self::Wayland)
        } else if set(x11_display) {
            Some(Self::X11)
        } else {
            None
        }
    }
}

/// Build the backend described by `config`
///
/// The configuration is validated first; the returned backend is not started.
pub fn open(config: &CaptureConfig) -> Result<Box<dyn DesktopCapture>, CaptureBackendError> {
    config
        .validate()
        .map_err(|e| CaptureBackendError::InvalidConfig(e.to_string()))?;

    match config {
        #[cfg(feature = "pipewire")]
        CaptureConfig::PipeWire(pw) => Ok(Box::new(pipewire::PipeWireCapture::new(pw.clone()))),
        #[cfg(feature = "xshm")]
        CaptureConfig::Xshm(x) => Ok(Box::new(xshm::X11Capture::new(x.clone()))),
        #[allow(unreachable_patterns)]
        _ => Err(CaptureBackendError::NotSupported(
            "Backend was not compiled into this build".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wayland_preferred_over_x11() {
        assert_eq!(
            SessionKind::from_env(Some("wayland-0"), Some(":0")),
            Some(SessionKind::Wayland)
        );
    }

    #[test]
    fn test_x11_only() {
        assert_eq!(SessionKind::from_env(None, Some(":1")), Some(SessionKind::X11));
    }

    #[test]
    fn test_empty_variables_are_ignored() {
        assert_eq!(SessionKind::from_env(Some(""), Some("")), None);
        assert_eq!(SessionKind::from_env(None, None), None);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = CaptureConfig::Xshm(crate::config::XshmConfig {
            fps: 0,
            ..Default::default()
        });
        let result = open(&config);
        assert!(matches!(result, Err(CaptureBackendError::InvalidConfig(_))));
    }

    #[test]
    fn test_error_display() {
        let err = CaptureBackendError::MissingExtension("MIT-SHM".to_string());
        assert_eq!(err.to_string(), "Missing extension: MIT-SHM");
    }
}
