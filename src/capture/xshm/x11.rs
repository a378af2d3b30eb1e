// X server access over x11rb with SysV shared memory segments

use std::fmt;
use std::ptr::NonNull;

use tracing::{debug, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xinerama::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};
use x11rb::rust_connection::RustConnection;

use super::display::{ScreenGeometry, SegmentMemory, XDisplay};
use super::geometry::{AdjustedGeometry, Point, RawGeometry, ScreenStrategy};
use crate::capture::CaptureBackendError;

fn geometry_error(context: &str, e: impl fmt::Display) -> CaptureBackendError {
    CaptureBackendError::Geometry(format!("{}: {}", context, e))
}

/// A live connection to an X server
pub struct X11Display {
    conn: RustConnection,
    default_screen: usize,
}

impl fmt::Debug for X11Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X11Display")
            .field("default_screen", &self.default_screen)
            .finish()
    }
}

/// A SysV segment mapped here and attached to the X server
#[derive(Debug)]
pub struct ShmSegment {
    seg: shm::Seg,
    addr: NonNull<u8>,
    len: usize,
}

impl SegmentMemory for ShmSegment {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: addr maps len bytes until shmdt in detach_segment, which
        // consumes the segment
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

/// Unmap and mark for removal; the kernel frees it once nobody is attached
fn release_shm(shmid: libc::c_int, addr: *mut libc::c_void) {
    // SAFETY: addr came from shmat on shmid and is not used afterwards
    unsafe {
        if !addr.is_null() {
            libc::shmdt(addr);
        }
        libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
    }
}

impl X11Display {
    fn has_extension(&self, name: &'static str) -> bool {
        matches!(self.conn.extension_information(name), Ok(Some(_)))
    }

    fn root(&self, screen: usize) -> Option<u32> {
        self.conn.setup().roots.get(screen).map(|s| s.root)
    }

    fn default_root(&self) -> Result<u32, CaptureBackendError> {
        self.root(self.default_screen)
            .ok_or_else(|| CaptureBackendError::Geometry("Display has no screens".to_string()))
    }

    /// CRTC geometry of every connected output, in output order
    fn randr_monitors(&self) -> Result<Vec<RawGeometry>, CaptureBackendError> {
        let root = self.default_root()?;
        let resources = self
            .conn
            .randr_get_screen_resources_current(root)
            .map_err(|e| geometry_error("RandR screen resources", e))?
            .reply()
            .map_err(|e| geometry_error("RandR screen resources", e))?;

        let mut monitors = Vec::new();
        for output in resources.outputs {
            let info = self
                .conn
                .randr_get_output_info(output, resources.config_timestamp)
                .map_err(|e| geometry_error("RandR output info", e))?
                .reply()
                .map_err(|e| geometry_error("RandR output info", e))?;

            if info.crtc == 0 || info.connection != randr::Connection::CONNECTED {
                continue;
            }

            let crtc = self
                .conn
                .randr_get_crtc_info(info.crtc, resources.config_timestamp)
                .map_err(|e| geometry_error("RandR CRTC info", e))?
                .reply()
                .map_err(|e| geometry_error("RandR CRTC info", e))?;

            monitors.push(RawGeometry {
                x: crtc.x.into(),
                y: crtc.y.into(),
                width: crtc.width.into(),
                height: crtc.height.into(),
            });
        }

        Ok(monitors)
    }

    fn xinerama_heads(&self) -> Result<Vec<RawGeometry>, CaptureBackendError> {
        let reply = self
            .conn
            .xinerama_query_screens()
            .map_err(|e| geometry_error("Xinerama query", e))?
            .reply()
            .map_err(|e| geometry_error("Xinerama query", e))?;

        Ok(reply
            .screen_info
            .iter()
            .map(|head| RawGeometry {
                x: head.x_org.into(),
                y: head.y_org.into(),
                width: head.width.into(),
                height: head.height.into(),
            })
            .collect())
    }
}

impl XDisplay for X11Display {
    type Segment = ShmSegment;

    fn connect(display: Option<&str>) -> Result<Self, CaptureBackendError> {
        let (conn, default_screen) = RustConnection::connect(display).map_err(|e| {
            CaptureBackendError::ConnectionFailed(format!("Unable to open X display: {}", e))
        })?;
        let display_name = display;
        debug!("Connected to X display {:?}, screen {}", display_name, default_screen);
        Ok(Self {
            conn,
            default_screen,
        })
    }

    fn has_shm(&self) -> bool {
        self.has_extension(shm::X11_EXTENSION_NAME)
    }

    fn randr_active(&self) -> bool {
        self.has_extension(randr::X11_EXTENSION_NAME)
    }

    fn xinerama_active(&self) -> bool {
        if !self.has_extension(xinerama::X11_EXTENSION_NAME) {
            return false;
        }
        self.conn
            .xinerama_is_active()
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .map(|reply| reply.state != 0)
            .unwrap_or(false)
    }

    fn randr_screen_count(&self) -> Result<i32, CaptureBackendError> {
        Ok(self.randr_monitors()?.len() as i32)
    }

    fn xinerama_screen_count(&self) -> Result<i32, CaptureBackendError> {
        Ok(self.xinerama_heads()?.len() as i32)
    }

    fn screen_geometry(
        &self,
        strategy: ScreenStrategy,
        screen: u32,
    ) -> Result<ScreenGeometry, CaptureBackendError> {
        let index = screen as usize;
        let out_of_range = || CaptureBackendError::Geometry(format!("No screen {}", screen));

        match strategy {
            ScreenStrategy::RandR => {
                let raw = *self.randr_monitors()?.get(index).ok_or_else(out_of_range)?;
                Ok(ScreenGeometry {
                    raw,
                    root: self.default_root()?,
                })
            }
            ScreenStrategy::Xinerama => {
                let raw = *self.xinerama_heads()?.get(index).ok_or_else(out_of_range)?;
                Ok(ScreenGeometry {
                    raw,
                    root: self.default_root()?,
                })
            }
            ScreenStrategy::Single => {
                let info = self.conn.setup().roots.get(index).ok_or_else(out_of_range)?;
                Ok(ScreenGeometry {
                    raw: RawGeometry {
                        x: 0,
                        y: 0,
                        width: info.width_in_pixels.into(),
                        height: info.height_in_pixels.into(),
                    },
                    root: info.root,
                })
            }
        }
    }

    fn attach_segment(&self, len: usize) -> Result<ShmSegment, CaptureBackendError> {
        let attach_error = |msg: String| CaptureBackendError::SegmentAttach(msg);

        // SAFETY: plain SysV calls; every failure path below releases what
        // was created before it
        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if shmid < 0 {
            return Err(attach_error(format!(
                "shmget of {} bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }

        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        let Some(mapped) = NonNull::new(addr as *mut u8).filter(|_| addr as isize != -1) else {
            let e = std::io::Error::last_os_error();
            release_shm(shmid, std::ptr::null_mut());
            return Err(attach_error(format!("shmat failed: {}", e)));
        };

        let attached = self.conn.generate_id().map_err(|e| e.to_string()).and_then(|seg| {
            self.conn
                .shm_attach(seg, shmid as u32, false)
                .map_err(|e| e.to_string())?
                .check()
                .map_err(|e| e.to_string())?;
            Ok(seg)
        });

        let seg = match attached {
            Ok(seg) => seg,
            Err(e) => {
                release_shm(shmid, addr);
                return Err(attach_error(format!("X server refused segment: {}", e)));
            }
        };

        // The server holds its own attachment now; the id can go
        unsafe {
            libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
        }

        debug!("Attached {} byte shm segment {}", len, seg);
        Ok(ShmSegment {
            seg,
            addr: mapped,
            len,
        })
    }

    fn detach_segment(&self, segment: ShmSegment) {
        match self.conn.shm_detach(segment.seg) {
            Ok(cookie) => {
                if let Err(e) = cookie.check() {
                    warn!("Failed to detach shm segment {}: {}", segment.seg, e);
                }
            }
            Err(e) => warn!("Failed to detach shm segment {}: {}", segment.seg, e),
        }
        // SAFETY: the segment is consumed, so no slice into it survives
        unsafe {
            libc::shmdt(segment.addr.as_ptr() as *const libc::c_void);
        }
    }

    fn get_image(&self, root: u32, area: &AdjustedGeometry, segment: &ShmSegment) -> Option<usize> {
        let Some((x, y, width, height)) = area.to_wire() else {
            warn!("Capture area {:?} does not fit the X protocol", area);
            return None;
        };
        let reply = self
            .conn
            .shm_get_image(
                root,
                x,
                y,
                width,
                height,
                !0,
                ImageFormat::Z_PIXMAP.into(),
                segment.seg,
                0,
            )
            .ok()?
            .reply()
            .ok()?;
        Some(reply.size as usize)
    }

    fn query_pointer(&self, root: u32) -> Option<Point> {
        let reply = self.conn.query_pointer(root).ok()?.reply().ok()?;
        Some(Point::new(reply.root_x.into(), reply.root_y.into()))
    }
}
