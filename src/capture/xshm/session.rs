use tracing::{debug, error, info, warn};

use super::display::{SegmentMemory, XDisplay};
use super::geometry::{AdjustedGeometry, GeometryChange, GeometryTracker, Point, ScreenStrategy};
use crate::capture::CaptureBackendError;
use crate::config::XshmConfig;
use crate::frame::FrameBuffer;

/// Number of capturable screens on the default display
///
/// 0 only when the display cannot be opened.
pub fn count_screens<D: XDisplay>() -> i32 {
    count_screens_on::<D>(None)
}

/// Number of capturable screens on `display`
pub fn count_screens_on<D: XDisplay>(display: Option<&str>) -> i32 {
    let conn = match D::connect(display) {
        Ok(conn) => conn,
        Err(e) => {
            error!("{}", e);
            return 0;
        }
    };

    let counted = if conn.randr_active() {
        conn.randr_screen_count()
    } else if conn.xinerama_active() {
        conn.xinerama_screen_count()
    } else {
        Ok(1)
    };

    match counted {
        Ok(count) => count.max(1),
        Err(e) => {
            warn!("Screen count failed, assuming one: {}", e);
            1
        }
    }
}

/// A pull-based capture of one X screen through MIT-SHM
pub struct XshmSession<D: XDisplay> {
    display: D,
    display_name: Option<String>,
    screen: u32,
    strategy: ScreenStrategy,
    root: u32,
    geometry: GeometryTracker,
    segment: Option<D::Segment>,
}

impl<D: XDisplay> std::fmt::Debug for XshmSession<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XshmSession")
            .field("display", &self.display_name)
            .field("screen", &self.screen)
            .field("strategy", &self.strategy)
            .field("geometry", &self.geometry.adjusted())
            .field("capturing", &self.segment.is_some())
            .finish()
    }
}

impl<D: XDisplay> XshmSession<D> {
    /// Connect and prepare to capture `config.screen`
    ///
    /// A failed initial geometry query is logged, not returned: the session
    /// comes back with a zero size and `update_geometry` can be retried.
    pub fn create(config: &XshmConfig) -> Result<Self, CaptureBackendError> {
        let display = D::connect(config.display.as_deref())?;

        if !display.has_shm() {
            error!("X server lacks the MIT-SHM extension");
            return Err(CaptureBackendError::MissingExtension("MIT-SHM".to_string()));
        }

        let randr = display.randr_active();
        let xinerama = display.xinerama_active();
        if !randr {
            debug!("RandR not available");
        }
        if !xinerama {
            debug!("Xinerama not active");
        }
        let strategy = ScreenStrategy::select(randr, xinerama);

        let mut session = Self {
            display,
            display_name: config.display.clone(),
            screen: config.screen,
            strategy,
            root: 0,
            geometry: GeometryTracker::new(config.crop),
            segment: None,
        };

        if let Err(e) = session.update_geometry() {
            warn!("Initial geometry query failed: {}", e);
        }

        info!(
            "X11 capture of screen {} via {:?}: {}x{} @ {},{}",
            session.screen,
            session.strategy,
            session.geometry.adjusted().width,
            session.geometry.adjusted().height,
            session.geometry.adjusted().x,
            session.geometry.adjusted().y
        );

        Ok(session)
    }

    pub fn strategy(&self) -> ScreenStrategy {
        self.strategy
    }

    pub fn geometry(&self) -> AdjustedGeometry {
        self.geometry.adjusted()
    }

    /// Adjusted capture size (width, height)
    pub fn size(&self) -> (i32, i32) {
        let geometry = self.geometry.adjusted();
        (geometry.width, geometry.height)
    }

    /// Adjusted capture origin in root coordinates
    pub fn position(&self) -> Point {
        self.geometry.adjusted().origin()
    }

    pub fn is_capturing(&self) -> bool {
        self.segment.is_some()
    }

    /// Re-query the screen and recompute the cropped geometry
    pub fn update_geometry(&mut self) -> Result<GeometryChange, CaptureBackendError> {
        let screen = self.display.screen_geometry(self.strategy, self.screen)?;
        let change = self.geometry.update(screen.raw)?;
        self.root = screen.root;
        Ok(change)
    }

    /// Attach a segment sized for the current geometry
    ///
    /// An already attached segment is replaced, so this also resizes after a
    /// geometry change. On failure the session stays usable.
    pub fn capture_start(&mut self) -> Result<(), CaptureBackendError> {
        let len = self.geometry.adjusted().frame_len();
        if len == 0 {
            return Err(CaptureBackendError::SegmentAttach(
                "No geometry to capture".to_string(),
            ));
        }

        self.capture_end();
        let segment = self.display.attach_segment(len).map_err(|e| {
            error!("Failed to attach shm segment: {}", e);
            e
        })?;
        self.segment = Some(segment);
        Ok(())
    }

    /// Detach the segment; `capture_start` may be called again
    pub fn capture_end(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.display.detach_segment(segment);
        }
    }

    /// Grab the current screen contents
    ///
    /// Empty when no segment is attached or the server did not reply.
    pub fn capture_frame(&mut self) -> FrameBuffer<'_> {
        let Some(segment) = self.segment.as_ref() else {
            return FrameBuffer::empty();
        };

        let area = self.geometry.adjusted();
        match self.display.get_image(self.root, &area, segment) {
            Some(size) => {
                let bytes = segment.as_bytes();
                FrameBuffer::new(&bytes[..size.min(bytes.len())])
            }
            None => FrameBuffer::empty(),
        }
    }

    /// Pointer position in root coordinates, `None` if the query failed
    pub fn mouse_pos_global(&self) -> Option<Point> {
        self.display.query_pointer(self.root)
    }
}

impl<D: XDisplay> Drop for XshmSession<D> {
    fn drop(&mut self) {
        self.capture_end();
    }
}
