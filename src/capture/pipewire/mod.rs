// PipeWire capture backend
//
// Connects to a compositor-provided PipeWire node, negotiates a raw video
// format (GPU-importable when the caller supplies modifiers) and hands the
// newest frame of every process cycle to a FrameSink.

mod format;
#[cfg(any(feature = "pipewire", test))]
pub(crate) mod queue;
mod sink;

#[cfg(feature = "pipewire")]
mod backend;
#[cfg(feature = "pipewire")]
mod session;

pub use format::{
    accepted_buffer_kinds, build_proposals, dmabuf_negotiation_supported, format_name,
    parse_version, FormatProposal, FramerateRange, ModifierChoice, Rectangle, SizeRange,
    DMABUF_MIN_VERSION,
};
pub use sink::{ChannelSink, FrameSink, RawFrame, RawPlane};

#[cfg(feature = "pipewire")]
pub use backend::PipeWireCapture;
#[cfg(feature = "pipewire")]
pub use format::library_version;
#[cfg(feature = "pipewire")]
pub use session::PipeWireSession;

#[cfg(test)]
mod tests;
