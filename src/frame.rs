// Frame and format types shared by both capture backends

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// 32-bit packed pixel formats understood by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgbx,
    Bgrx,
    Rgba,
    Bgra,
}

impl PixelFormat {
    /// Formats offered by the generic negotiation proposal, in order
    pub const FALLBACK: [PixelFormat; 4] = [Self::Rgba, Self::Bgra, Self::Rgbx, Self::Bgrx];

    /// Map an SPA video format id
    pub fn from_spa(raw: u32) -> Option<Self> {
        match raw {
            7 => Some(Self::Rgbx),
            8 => Some(Self::Bgrx),
            11 => Some(Self::Rgba),
            12 => Some(Self::Bgra),
            _ => None,
        }
    }

    /// SPA video format id
    pub fn as_spa(self) -> u32 {
        match self {
            Self::Rgbx => 7,
            Self::Bgrx => 8,
            Self::Rgba => 11,
            Self::Bgra => 12,
        }
    }

    /// DRM fourcc with the same memory layout
    pub fn as_drm_fourcc(self) -> u32 {
        match self {
            Self::Rgbx => fourcc(b'X', b'B', b'2', b'4'),
            Self::Bgrx => fourcc(b'X', b'R', b'2', b'4'),
            Self::Rgba => fourcc(b'A', b'B', b'2', b'4'),
            Self::Bgra => fourcc(b'A', b'R', b'2', b'4'),
        }
    }

    pub fn from_drm_fourcc(code: u32) -> Option<Self> {
        Self::FALLBACK
            .into_iter()
            .find(|f| f.as_drm_fourcc() == code)
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Rgba | Self::Bgra)
    }

    /// Red and blue swapped relative to RGBA byte order
    fn is_bgr(self) -> bool {
        matches!(self, Self::Bgrx | Self::Bgra)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgbx => "RGBx",
            Self::Bgrx => "BGRx",
            Self::Rgba => "RGBA",
            Self::Bgra => "BGRA",
        };
        f.write_str(name)
    }
}

/// SPA buffer data types a stream may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Plain process memory
    MemPtr,
    /// Memory backed by a memfd
    MemFd,
    /// GPU-importable dma-buf
    DmaBuf,
}

impl BufferKind {
    pub fn from_spa(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::MemPtr),
            2 => Some(Self::MemFd),
            3 => Some(Self::DmaBuf),
            _ => None,
        }
    }

    pub fn as_spa(self) -> u32 {
        match self {
            Self::MemPtr => 1,
            Self::MemFd => 2,
            Self::DmaBuf => 3,
        }
    }

    /// Bit used for this kind in the buffers `dataType` param
    pub fn mask(self) -> u32 {
        1 << self.as_spa()
    }
}

/// Video framerate as a fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub denom: u32,
}

impl Framerate {
    pub fn per_second(fps: u32) -> Self {
        Self { num: fps, denom: 1 }
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

/// Negotiated video format of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// SPA video format id
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    /// Memory layout modifier, present when a GPU layout was negotiated
    pub modifier: Option<u64>,
}

impl FormatDescriptor {
    /// The packed format, when it is one of the four this crate knows
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_spa(self.format)
    }

    /// Bytes per row of a tightly packed frame
    pub fn packed_stride(&self) -> usize {
        self.width as usize * 4
    }
}

/// A frame borrowed from memory owned by a capture session
///
/// An empty buffer means "nothing captured", which is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBuffer<'a> {
    data: &'a [u8],
}

impl<'a> FrameBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn empty() -> Self {
        Self { data: &[] }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One plane of a dma-buf frame
#[derive(Debug)]
pub struct DmaBufPlane {
    /// Duplicated file descriptor, owned by this frame
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: i32,
}

/// Pixel storage of an owned frame
#[derive(Debug)]
pub enum FrameData {
    /// Copied pixel rows
    Memory { bytes: Vec<u8>, stride: usize },
    /// GPU buffer planes, imported by the caller
    DmaBuf { planes: Vec<DmaBufPlane> },
}

/// A frame that outlives the capture callback or the next capture call
#[derive(Debug)]
pub struct OwnedFrame {
    pub format: FormatDescriptor,
    pub data: FrameData,
}

impl OwnedFrame {
    /// Copy a memory frame into an RGBA image
    ///
    /// Returns `None` for dma-buf frames, unknown formats, or buffers shorter
    /// than the advertised geometry.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        let FrameData::Memory { bytes, stride } = &self.data else {
            return None;
        };
        let pixel_format = self.format.pixel_format()?;
        let (width, height) = (self.format.width as usize, self.format.height as usize);
        let row_len = width * 4;
        if *stride < row_len || bytes.len() < stride * height.saturating_sub(1) + row_len {
            return None;
        }

        let mut out = Vec::with_capacity(row_len * height);
        for row in bytes.chunks(*stride).take(height) {
            for px in row[..row_len].chunks_exact(4) {
                let (r, b) = if pixel_format.is_bgr() {
                    (px[2], px[0])
                } else {
                    (px[0], px[2])
                };
                let a = if pixel_format.has_alpha() { px[3] } else { 0xff };
                out.extend_from_slice(&[r, px[1], b, a]);
            }
        }

        RgbaImage::from_raw(self.format.width, self.format.height, out)
    }
}
