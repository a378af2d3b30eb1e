use tracing::{debug, info, trace};

use super::display::XDisplay;
use super::geometry::{GeometryChange, Point};
use super::session::XshmSession;
use crate::capture::{CaptureBackendError, DesktopCapture};
use crate::config::XshmConfig;
use crate::frame::{FormatDescriptor, FrameData, Framerate, OwnedFrame, PixelFormat};

/// X11 screen capture polled by the caller
pub struct XshmCapture<D: XDisplay> {
    config: XshmConfig,
    session: Option<XshmSession<D>>,
    running: bool,
    paused: bool,
    /// Last pointer position that was successfully queried
    mouse: Option<Point>,
}

#[cfg(feature = "xshm")]
pub type X11Capture = XshmCapture<super::x11::X11Display>;

impl<D: XDisplay> XshmCapture<D> {
    pub fn new(config: XshmConfig) -> Self {
        Self {
            config,
            session: None,
            running: false,
            paused: false,
            mouse: None,
        }
    }

    pub fn session(&self) -> Option<&XshmSession<D>> {
        self.session.as_ref()
    }

    /// Re-query screen geometry, reattaching the segment if the size changed
    pub fn refresh_geometry(&mut self) -> Result<GeometryChange, CaptureBackendError> {
        let session = self.active_session()?;

        let change = session.update_geometry()?;
        if change == GeometryChange::Changed && session.is_capturing() {
            debug!("Screen size changed, reattaching segment");
            session.capture_start()?;
        }
        Ok(change)
    }

    fn active_session(&mut self) -> Result<&mut XshmSession<D>, CaptureBackendError> {
        let running = self.running;
        self.session.as_mut().filter(|_| running).ok_or_else(|| {
            CaptureBackendError::Internal("X11 capture is not running".to_string())
        })
    }

    /// Pointer position relative to the captured area, `None` when outside
    pub fn mouse_pos_local(&self) -> Option<Point> {
        let session = self.session.as_ref()?;
        session.geometry().to_local(self.mouse?)
    }

    fn refresh_mouse(&mut self) {
        if let Some(pos) = self.session.as_ref().and_then(|s| s.mouse_pos_global()) {
            self.mouse = Some(pos);
        }
    }
}

impl<D: XDisplay> std::fmt::Debug for XshmCapture<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XshmCapture")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("running", &self.running)
            .field("paused", &self.paused)
            .finish()
    }
}

impl<D: XDisplay> DesktopCapture for XshmCapture<D> {
    fn name(&self) -> &str {
        "xshm"
    }

    fn start(&mut self) -> Result<(), CaptureBackendError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => XshmSession::create(&self.config)?,
        };
        let session = self.session.insert(session);

        // A failed attach keeps the connection for the next attempt
        if !session.is_capturing() {
            session.capture_start()?;
        }
        self.running = true;
        self.paused = false;
        info!("X11 capture started on screen {}", self.config.screen);
        Ok(())
    }

    fn receive(&mut self) -> Option<OwnedFrame> {
        if !self.running || self.paused {
            return None;
        }
        self.refresh_mouse();

        let fps = self.config.fps;
        let session = self.session.as_mut()?;
        let (width, height) = session.size();
        let expected = session.geometry().frame_len();

        let frame = session.capture_frame();
        if frame.is_empty() || frame.len() != expected {
            trace!("Discarding {} byte frame, expected {}", frame.len(), expected);
            return None;
        }

        Some(OwnedFrame {
            format: FormatDescriptor {
                format: PixelFormat::Bgrx.as_spa(),
                width: width as u32,
                height: height as u32,
                framerate: Framerate::per_second(fps),
                modifier: None,
            },
            data: FrameData::Memory {
                bytes: frame.as_bytes().to_vec(),
                stride: width as usize * 4,
            },
        })
    }

    fn pause(&mut self) -> Result<(), CaptureBackendError> {
        let session = self.active_session()?;
        session.capture_end();
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), CaptureBackendError> {
        let session = self.active_session()?;
        session.capture_start()?;
        self.paused = false;
        Ok(())
    }

    fn stop(&mut self) {
        if self.session.take().is_some() {
            info!("X11 capture stopped");
        }
        self.running = false;
        self.paused = false;
        self.mouse = None;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
