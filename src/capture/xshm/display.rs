use super::geometry::{AdjustedGeometry, Point, RawGeometry, ScreenStrategy};
use crate::capture::CaptureBackendError;

/// Shared memory the X server writes captured images into
pub trait SegmentMemory {
    fn as_bytes(&self) -> &[u8];
}

/// Geometry of one screen plus the root window to read it from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub raw: RawGeometry,
    pub root: u32,
}

/// The X server requests the shared-memory backend relies on
pub trait XDisplay: Sized {
    type Segment: SegmentMemory;

    /// Open a connection; `None` uses `$DISPLAY`
    fn connect(display: Option<&str>) -> Result<Self, CaptureBackendError>;

    fn has_shm(&self) -> bool;

    fn randr_active(&self) -> bool;

    fn xinerama_active(&self) -> bool;

    /// Connected RandR outputs that drive a CRTC
    fn randr_screen_count(&self) -> Result<i32, CaptureBackendError>;

    fn xinerama_screen_count(&self) -> Result<i32, CaptureBackendError>;

    fn screen_geometry(
        &self,
        strategy: ScreenStrategy,
        screen: u32,
    ) -> Result<ScreenGeometry, CaptureBackendError>;

    /// Create a segment of `len` bytes and attach it to the server
    fn attach_segment(&self, len: usize) -> Result<Self::Segment, CaptureBackendError>;

    fn detach_segment(&self, segment: Self::Segment);

    /// Copy `area` of `root` into `segment`; returns the reply's image size
    fn get_image(&self, root: u32, area: &AdjustedGeometry, segment: &Self::Segment)
        -> Option<usize>;

    fn query_pointer(&self, root: u32) -> Option<Point>;
}
