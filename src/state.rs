use serde::{Deserialize, Serialize};

/// Lifecycle states of a stream capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Session object exists, nothing native created yet
    #[default]
    Uninitialized,
    /// Service thread is creating the connection and the stream
    Connecting,
    /// Stream connected, waiting for a usable video format
    AwaitingFormat,
    /// Frames are being delivered
    Streaming,
    /// Delivery suspended by the caller
    Paused,
    /// Native resources released; terminal
    Destroyed,
}

/// State transition error
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionError {
    pub from: StreamState,
    pub to: StreamState,
    pub message: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid transition from {:?} to {:?}: {}",
            self.from, self.to, self.message
        )
    }
}

impl std::error::Error for TransitionError {}

/// State machine for a stream capture session
#[derive(Debug, Default)]
pub struct StateMachine {
    state: StreamState,
    /// A format was negotiated at least once
    has_format: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn has_format(&self) -> bool {
        self.has_format
    }

    /// Validate and perform state transition
    fn transition(&mut self, to: StreamState) -> Result<StreamState, TransitionError> {
        use StreamState::*;

        let from = self.state;

        let valid = match (from, to) {
            (Uninitialized, Connecting) => true,

            // Setup finished, or failed and cleaned up
            (Connecting, AwaitingFormat) => true,
            (Connecting, Destroyed) => true,

            (AwaitingFormat, Streaming) => true,
            (AwaitingFormat, Paused) => true,

            (Streaming, Paused) => true,
            (Streaming, AwaitingFormat) => true, // format lost, renegotiating

            (Paused, Streaming) => true,
            (Paused, AwaitingFormat) => true,

            // Destroy is allowed from anywhere except the terminal state itself
            (_, Destroyed) if from != Destroyed => true,

            // Same state is always valid (no-op), except once destroyed
            (a, b) if a == b && a != Destroyed => true,

            _ => false,
        };

        if valid {
            self.state = to;
            Ok(to)
        } else {
            Err(TransitionError {
                from,
                to,
                message: format!("Cannot transition from {:?} to {:?}", from, to),
            })
        }
    }

    /// Begin connecting (Uninitialized → Connecting)
    pub fn begin_connect(&mut self) -> Result<StreamState, TransitionError> {
        self.transition(StreamState::Connecting)
    }

    /// Listener registered and stream connected (Connecting → AwaitingFormat)
    pub fn connected(&mut self) -> Result<StreamState, TransitionError> {
        self.transition(StreamState::AwaitingFormat)
    }

    /// A usable format arrived
    ///
    /// Moves AwaitingFormat → Streaming; a renegotiation while paused keeps
    /// the session paused.
    pub fn format_negotiated(&mut self) -> Result<StreamState, TransitionError> {
        self.has_format = true;
        match self.state {
            StreamState::Paused => Ok(StreamState::Paused),
            _ => self.transition(StreamState::Streaming),
        }
    }

    /// The negotiated format was withdrawn (Streaming → AwaitingFormat)
    pub fn format_cleared(&mut self) -> Result<StreamState, TransitionError> {
        self.has_format = false;
        match self.state {
            StreamState::Paused => Ok(StreamState::Paused),
            _ => self.transition(StreamState::AwaitingFormat),
        }
    }

    /// Pause delivery (AwaitingFormat/Streaming → Paused)
    pub fn pause(&mut self) -> Result<StreamState, TransitionError> {
        self.transition(StreamState::Paused)
    }

    /// Resume delivery (Paused → Streaming, or AwaitingFormat without a format)
    pub fn resume(&mut self) -> Result<StreamState, TransitionError> {
        if self.has_format {
            self.transition(StreamState::Streaming)
        } else {
            self.transition(StreamState::AwaitingFormat)
        }
    }

    /// Release everything (any → Destroyed)
    pub fn destroy(&mut self) -> Result<StreamState, TransitionError> {
        self.transition(StreamState::Destroyed)
    }
}
