// Frame delivery from the PipeWire service thread
//
// Everything here runs on the service thread. A sink must not block: the
// stream cannot reuse the buffer until the sink returns.

use std::io;
use std::os::fd::BorrowedFd;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::events::{CaptureEvent, StateChangedEvent, StreamStatus};
use crate::frame::{BufferKind, DmaBufPlane, FormatDescriptor, FrameData, OwnedFrame};

/// One data plane of a buffer the stream lent out
#[derive(Debug)]
pub struct RawPlane<'a> {
    pub kind: Option<BufferKind>,
    /// Backing fd for memfd and dma-buf planes
    pub fd: Option<BorrowedFd<'a>>,
    pub offset: u32,
    pub stride: i32,
    /// Valid payload bytes
    pub size: u32,
    /// Mapped memory, when the plane is mappable
    pub data: Option<&'a [u8]>,
}

impl<'a> RawPlane<'a> {
    /// The payload bytes of a mapped plane
    pub fn payload(&self) -> Option<&'a [u8]> {
        let data = self.data?;
        let start = self.offset as usize;
        let end = start.checked_add(self.size as usize)?;
        data.get(start..end)
    }
}

/// A frame borrowed from the stream for the duration of one callback
#[derive(Debug)]
pub struct RawFrame<'a> {
    pub format: &'a FormatDescriptor,
    pub planes: Vec<RawPlane<'a>>,
}

impl RawFrame<'_> {
    pub fn kind(&self) -> Option<BufferKind> {
        self.planes.first().and_then(|p| p.kind)
    }

    /// Copy (or fd-duplicate) the frame so it can leave the callback
    pub fn to_owned_frame(&self) -> io::Result<OwnedFrame> {
        let data = match self.kind() {
            Some(BufferKind::DmaBuf) => {
                let planes = self
                    .planes
                    .iter()
                    .map(|plane| {
                        let fd = plane.fd.ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, "dma-buf plane without fd")
                        })?;
                        Ok(DmaBufPlane {
                            fd: fd.try_clone_to_owned()?,
                            offset: plane.offset,
                            stride: plane.stride,
                        })
                    })
                    .collect::<io::Result<Vec<_>>>()?;
                FrameData::DmaBuf { planes }
            }
            _ => {
                let plane = self.planes.first().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "buffer without planes")
                })?;
                let bytes = plane.payload().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "plane is not mapped")
                })?;
                let stride = match usize::try_from(plane.stride) {
                    Ok(stride) if stride > 0 => stride,
                    _ => self.format.packed_stride(),
                };
                FrameData::Memory {
                    bytes: bytes.to_vec(),
                    stride,
                }
            }
        };

        Ok(OwnedFrame {
            format: *self.format,
            data,
        })
    }
}

/// Receiver of stream callbacks, running on the service thread
pub trait FrameSink: Send + 'static {
    /// A non-empty frame is ready
    fn on_frame(&mut self, frame: &RawFrame<'_>);

    /// A usable format was negotiated
    fn on_format(&mut self, _format: &FormatDescriptor) {}

    /// The session moved to another state
    fn on_state_changed(&mut self, _event: StateChangedEvent) {}
}

impl<F> FrameSink for F
where
    F: FnMut(&RawFrame<'_>) + Send + 'static,
{
    fn on_frame(&mut self, frame: &RawFrame<'_>) {
        self(frame)
    }
}

/// Sink that forwards everything to the application over a bounded channel
///
/// Frames are copied out of the stream. When the application falls behind
/// and the channel is full, new events are dropped rather than blocking the
/// service thread. The latest state and format are also published on a
/// watch channel, which never loses them.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<CaptureEvent>,
    status: watch::Sender<StreamStatus>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CaptureEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (status, _) = watch::channel(StreamStatus::default());
        (
            Self {
                tx,
                status,
                dropped: 0,
            },
            rx,
        )
    }

    /// Frames discarded because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Latest state and format, independent of the event channel
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    fn forward(&mut self, event: CaptureEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if event.is_frame() {
                    self.dropped += 1;
                    trace!("Event channel full, dropped frame ({} total)", self.dropped);
                } else {
                    debug!("Event channel full, {:?} only published as status", event);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event receiver gone, discarding event");
            }
        }
    }
}

impl FrameSink for ChannelSink {
    fn on_frame(&mut self, frame: &RawFrame<'_>) {
        match frame.to_owned_frame() {
            Ok(owned) => self.forward(CaptureEvent::Frame(owned)),
            Err(e) => warn!("Failed to copy frame: {}", e),
        }
    }

    fn on_format(&mut self, format: &FormatDescriptor) {
        self.status.send_modify(|status| status.format = Some(*format));
        self.forward(CaptureEvent::FormatChanged(*format));
    }

    fn on_state_changed(&mut self, event: StateChangedEvent) {
        self.status.send_modify(|status| status.state = event.state);
        self.forward(CaptureEvent::StateChanged(event));
    }
}
