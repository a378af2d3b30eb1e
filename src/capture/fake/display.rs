// Scriptable X display
//
// Tests configure a FakeDisplay, `install` it, and the next `connect` on the
// same thread hands out a clone sharing the scripted state.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::capture::xshm::{
    AdjustedGeometry, Point, RawGeometry, ScreenGeometry, ScreenStrategy, SegmentMemory, XDisplay,
};
use crate::capture::CaptureBackendError;

thread_local! {
    static NEXT_DISPLAY: RefCell<Option<FakeDisplay>> = const { RefCell::new(None) };
}

#[derive(Debug)]
struct Script {
    shm: bool,
    randr: bool,
    xinerama: bool,
    screens: Vec<RawGeometry>,
    geometry_fails: bool,
    count_fails: bool,
    attach_fails: bool,
    image_fails: bool,
    /// Reply size override; defaults to the requested area
    image_size: Option<usize>,
    pointer: Option<Point>,
    last_strategy: Option<ScreenStrategy>,
    last_area: Option<AdjustedGeometry>,
    fill: u8,
}

/// X display double with scriptable extensions, screens and failures
#[derive(Debug, Clone)]
pub struct FakeDisplay {
    script: Arc<Mutex<Script>>,
    attach_count: Arc<AtomicU32>,
    detach_count: Arc<AtomicU32>,
    connect_count: Arc<AtomicU32>,
}

/// In-process stand-in for a shared-memory segment
#[derive(Debug)]
pub struct FakeSegment {
    bytes: Vec<u8>,
}

impl SegmentMemory for FakeSegment {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for FakeDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDisplay {
    /// One 1920x1080 screen, MIT-SHM present, no RandR or Xinerama
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                shm: true,
                randr: false,
                xinerama: false,
                screens: vec![RawGeometry {
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                }],
                geometry_fails: false,
                count_fails: false,
                attach_fails: false,
                image_fails: false,
                image_size: None,
                pointer: None,
                last_strategy: None,
                last_area: None,
                fill: 0x7f,
            })),
            attach_count: Arc::new(AtomicU32::new(0)),
            detach_count: Arc::new(AtomicU32::new(0)),
            connect_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn without_shm(self) -> Self {
        self.script.lock().unwrap().shm = false;
        self
    }

    pub fn with_randr(self) -> Self {
        self.script.lock().unwrap().randr = true;
        self
    }

    pub fn with_xinerama(self) -> Self {
        self.script.lock().unwrap().xinerama = true;
        self
    }

    pub fn with_screens(self, screens: Vec<RawGeometry>) -> Self {
        self.set_screens(screens);
        self
    }

    /// Make the next `XDisplay::connect` on this thread return this display
    pub fn install(&self) {
        NEXT_DISPLAY.with(|next| *next.borrow_mut() = Some(self.clone()));
    }

    pub fn set_screens(&self, screens: Vec<RawGeometry>) {
        self.script.lock().unwrap().screens = screens;
    }

    pub fn set_geometry_fails(&self, fails: bool) {
        self.script.lock().unwrap().geometry_fails = fails;
    }

    pub fn set_count_fails(&self, fails: bool) {
        self.script.lock().unwrap().count_fails = fails;
    }

    pub fn set_attach_fails(&self, fails: bool) {
        self.script.lock().unwrap().attach_fails = fails;
    }

    pub fn set_image_fails(&self, fails: bool) {
        self.script.lock().unwrap().image_fails = fails;
    }

    pub fn set_image_size(&self, size: Option<usize>) {
        self.script.lock().unwrap().image_size = size;
    }

    pub fn set_pointer(&self, pointer: Option<Point>) {
        self.script.lock().unwrap().pointer = pointer;
    }

    /// Strategy used by the latest geometry query
    pub fn last_strategy(&self) -> Option<ScreenStrategy> {
        self.script.lock().unwrap().last_strategy
    }

    /// Area requested by the latest image grab
    pub fn last_area(&self) -> Option<AdjustedGeometry> {
        self.script.lock().unwrap().last_area
    }

    pub fn attach_count(&self) -> u32 {
        self.attach_count.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> u32 {
        self.detach_count.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Segments attached and not yet detached
    pub fn live_segments(&self) -> u32 {
        self.attach_count() - self.detach_count()
    }
}

impl XDisplay for FakeDisplay {
    type Segment = FakeSegment;

    fn connect(_display: Option<&str>) -> Result<Self, CaptureBackendError> {
        let display = NEXT_DISPLAY.with(|next| next.borrow_mut().take()).ok_or_else(|| {
            CaptureBackendError::ConnectionFailed("Unable to open X display".to_string())
        })?;
        display.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(display)
    }

    fn has_shm(&self) -> bool {
        self.script.lock().unwrap().shm
    }

    fn randr_active(&self) -> bool {
        self.script.lock().unwrap().randr
    }

    fn xinerama_active(&self) -> bool {
        self.script.lock().unwrap().xinerama
    }

    fn randr_screen_count(&self) -> Result<i32, CaptureBackendError> {
        let script = self.script.lock().unwrap();
        if script.count_fails {
            return Err(CaptureBackendError::Geometry("RandR query failed".to_string()));
        }
        Ok(script.screens.len() as i32)
    }

    fn xinerama_screen_count(&self) -> Result<i32, CaptureBackendError> {
        let script = self.script.lock().unwrap();
        if script.count_fails {
            return Err(CaptureBackendError::Geometry("Xinerama query failed".to_string()));
        }
        Ok(script.screens.len() as i32)
    }

    fn screen_geometry(
        &self,
        strategy: ScreenStrategy,
        screen: u32,
    ) -> Result<ScreenGeometry, CaptureBackendError> {
        let mut script = self.script.lock().unwrap();
        script.last_strategy = Some(strategy);
        if script.geometry_fails {
            return Err(CaptureBackendError::Geometry("Query failed".to_string()));
        }
        let raw = *script
            .screens
            .get(screen as usize)
            .ok_or_else(|| CaptureBackendError::Geometry(format!("No screen {}", screen)))?;
        let root = match strategy {
            ScreenStrategy::Single => 1 + screen,
            _ => 1,
        };
        Ok(ScreenGeometry { raw, root })
    }

    fn attach_segment(&self, len: usize) -> Result<FakeSegment, CaptureBackendError> {
        let script = self.script.lock().unwrap();
        if script.attach_fails {
            return Err(CaptureBackendError::SegmentAttach(
                "shmget failed".to_string(),
            ));
        }
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSegment {
            bytes: vec![script.fill; len],
        })
    }

    fn detach_segment(&self, _segment: FakeSegment) {
        self.detach_count.fetch_add(1, Ordering::SeqCst);
    }

    fn get_image(&self, _root: u32, area: &AdjustedGeometry, _segment: &FakeSegment) -> Option<usize> {
        let mut script = self.script.lock().unwrap();
        script.last_area = Some(*area);
        if script.image_fails {
            return None;
        }
        Some(script.image_size.unwrap_or_else(|| area.frame_len()))
    }

    fn query_pointer(&self, _root: u32) -> Option<Point> {
        self.script.lock().unwrap().pointer
    }
}
