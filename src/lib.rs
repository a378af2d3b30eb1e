//! Desktop capture backends for Linux
//!
//! Two ways to get pixels off a Linux desktop:
//!
//! - [`capture::pipewire`]: a push-based PipeWire stream connected to a
//!   compositor node (typically handed out by the ScreenCast portal), with
//!   dma-buf modifier negotiation and a generic memory fallback.
//! - [`capture::xshm`]: a pull-based X11 capture through the MIT-SHM
//!   extension, with RandR/Xinerama monitor geometry and edge cropping.
//!
//! Both implement [`capture::DesktopCapture`]; [`capture::open`] builds the
//! one described by a [`config::CaptureConfig`].

pub mod capture;
pub mod config;
pub mod events;
pub mod frame;
pub mod state;

pub use capture::{open, CaptureBackendError, DesktopCapture, SessionKind};
pub use config::{CaptureConfig, ConfigError, PipeWireConfig, XshmConfig};
pub use events::{CaptureEvent, StateChangedEvent, StreamStatus};
pub use frame::{FormatDescriptor, FrameBuffer, OwnedFrame, PixelFormat};
pub use state::{StateMachine, StreamState, TransitionError};
