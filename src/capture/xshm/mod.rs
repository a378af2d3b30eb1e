// X11 capture backend using MIT-SHM
//
// Screens are located through RandR, Xinerama or the core protocol, cropped,
// and read into a shared-memory segment on demand.

mod backend;
mod display;
mod geometry;
mod session;

#[cfg(feature = "xshm")]
mod x11;

pub use backend::XshmCapture;
pub use display::{ScreenGeometry, SegmentMemory, XDisplay};
pub use geometry::{
    geometry_code, AdjustedGeometry, GeometryChange, GeometryTracker, Point, RawGeometry,
    ScreenStrategy,
};
pub use session::{count_screens, count_screens_on, XshmSession};

#[cfg(feature = "xshm")]
pub use backend::X11Capture;
#[cfg(feature = "xshm")]
pub use x11::{ShmSegment, X11Display};
