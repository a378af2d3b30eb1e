use crate::frame::{FormatDescriptor, OwnedFrame};
use crate::state::StreamState;
use serde::{Deserialize, Serialize};

/// Emitted when a stream session changes state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub state: StreamState,
    pub previous: StreamState,
}

/// Latest known state and format of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub format: Option<FormatDescriptor>,
}

/// Messages sent from the PipeWire service thread to the application
#[derive(Debug)]
pub enum CaptureEvent {
    StateChanged(StateChangedEvent),
    /// A new video format was negotiated
    FormatChanged(FormatDescriptor),
    Frame(OwnedFrame),
}

impl CaptureEvent {
    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}
