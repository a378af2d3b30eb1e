// Screen geometry and crop arithmetic for X11 capture

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::CaptureBackendError;
use crate::config::CropMargins;

/// A position in root-window coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Screen rectangle as reported by the X server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawGeometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Screen rectangle after crop margins were applied; what gets captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdjustedGeometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl AdjustedGeometry {
    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Bytes of one 32-bit Z-pixmap frame at this size
    pub fn frame_len(&self) -> usize {
        if self.width <= 0 || self.height <= 0 {
            return 0;
        }
        self.width as usize * self.height as usize * 4
    }

    /// Origin and size as X protocol fields, `None` when out of range
    pub fn to_wire(&self) -> Option<(i16, i16, u16, u16)> {
        Some((
            i16::try_from(self.x).ok()?,
            i16::try_from(self.y).ok()?,
            u16::try_from(self.width).ok()?,
            u16::try_from(self.height).ok()?,
        ))
    }

    /// Translate a root position into this rectangle, `None` when outside
    pub fn to_local(&self, global: Point) -> Option<Point> {
        let local = Point::new(global.x.checked_sub(self.x)?, global.y.checked_sub(self.y)?);
        let inside = (0..self.width).contains(&local.x) && (0..self.height).contains(&local.y);
        inside.then_some(local)
    }
}

impl CropMargins {
    /// Shrink `raw` by the margins, moving the origin by the left/top crop
    ///
    /// `None` when a coordinate leaves the `i32` range.
    pub fn apply(&self, raw: &RawGeometry) -> Option<AdjustedGeometry> {
        let (left, top) = (i64::from(self.left), i64::from(self.top));
        let narrow = |v: i64| i32::try_from(v).ok();
        Some(AdjustedGeometry {
            x: narrow(i64::from(raw.x) + left)?,
            y: narrow(i64::from(raw.y) + top)?,
            width: narrow(i64::from(raw.width) - left - i64::from(self.right))?,
            height: narrow(i64::from(raw.height) - top - i64::from(self.bottom))?,
        })
    }
}

/// Outcome of a geometry refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryChange {
    /// Adjusted size is the same as before
    Unchanged,
    /// Adjusted size differs; frame buffers must be resized
    Changed,
}

impl GeometryChange {
    pub fn code(self) -> i32 {
        match self {
            Self::Unchanged => 0,
            Self::Changed => 1,
        }
    }
}

/// Collapse a refresh result to 1 (changed), 0 (unchanged) or -1 (error)
pub fn geometry_code(result: &Result<GeometryChange, CaptureBackendError>) -> i32 {
    match result {
        Ok(change) => change.code(),
        Err(_) => -1,
    }
}

/// How screens are enumerated on this display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenStrategy {
    /// One screen per connected RandR output
    RandR,
    /// One screen per Xinerama head
    Xinerama,
    /// Classic X screens, origin always 0,0
    Single,
}

impl ScreenStrategy {
    pub fn select(randr_active: bool, xinerama_active: bool) -> Self {
        if randr_active {
            Self::RandR
        } else if xinerama_active {
            Self::Xinerama
        } else {
            Self::Single
        }
    }
}

/// Keeps the last adjusted geometry to detect size changes
#[derive(Debug, Clone, Default)]
pub struct GeometryTracker {
    crop: CropMargins,
    raw: RawGeometry,
    adjusted: AdjustedGeometry,
}

impl GeometryTracker {
    pub fn new(crop: CropMargins) -> Self {
        Self {
            crop,
            ..Default::default()
        }
    }

    pub fn raw(&self) -> RawGeometry {
        self.raw
    }

    pub fn adjusted(&self) -> AdjustedGeometry {
        self.adjusted
    }

    /// Apply fresh raw geometry
    ///
    /// A zero raw size or a crop that leaves nothing is an error and keeps the
    /// previous geometry.
    pub fn update(&mut self, raw: RawGeometry) -> Result<GeometryChange, CaptureBackendError> {
        if raw.width <= 0 || raw.height <= 0 {
            return Err(CaptureBackendError::Geometry(format!(
                "Screen reported empty size {}x{}",
                raw.width, raw.height
            )));
        }

        let adjusted = self.crop.apply(&raw).ok_or_else(|| {
            CaptureBackendError::Geometry(format!(
                "Crop {:?} overflows on {}x{} @ {},{} screen",
                self.crop, raw.width, raw.height, raw.x, raw.y
            ))
        })?;
        if adjusted.width <= 0 || adjusted.height <= 0 {
            return Err(CaptureBackendError::Geometry(format!(
                "Crop leaves no area on {}x{} screen",
                raw.width, raw.height
            )));
        }

        debug!(
            "Geometry {}x{} @ {},{} (capturing {}x{} @ {},{})",
            raw.width, raw.height, raw.x, raw.y, adjusted.width, adjusted.height, adjusted.x, adjusted.y
        );

        let previous = self.adjusted;
        self.raw = raw;
        self.adjusted = adjusted;

        if previous.width == adjusted.width && previous.height == adjusted.height {
            Ok(GeometryChange::Unchanged)
        } else {
            Ok(GeometryChange::Changed)
        }
    }
}
