use std::os::fd::{AsRawFd, OwnedFd};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::format::{dmabuf_negotiation_supported, library_version};
use super::session::PipeWireSession;
use super::sink::ChannelSink;
use crate::capture::{CaptureBackendError, DesktopCapture};
use crate::config::PipeWireConfig;
use crate::events::{CaptureEvent, StreamStatus};
use crate::frame::{FormatDescriptor, OwnedFrame};
use crate::state::StreamState;

/// Compositor capture through a PipeWire stream
///
/// Frames are copied out on the service thread and queued on a bounded
/// channel; `receive` hands out the newest one.
pub struct PipeWireCapture {
    config: PipeWireConfig,
    /// Remote handed out by the screencast portal, duplicated on every start
    remote_fd: Option<OwnedFd>,
    session: Option<PipeWireSession>,
    events: Option<mpsc::Receiver<CaptureEvent>>,
    /// Published by the service thread; survives a full event channel
    status: Option<watch::Receiver<StreamStatus>>,
    /// Status kept after the session is gone
    last_status: StreamStatus,
}

impl PipeWireCapture {
    pub fn new(config: PipeWireConfig) -> Self {
        Self {
            config,
            remote_fd: None,
            session: None,
            events: None,
            status: None,
            last_status: StreamStatus::default(),
        }
    }

    /// Connect through a portal remote instead of the default daemon socket
    pub fn with_remote_fd(mut self, fd: OwnedFd) -> Self {
        self.remote_fd = Some(fd);
        self
    }

    pub fn config(&self) -> &PipeWireConfig {
        &self.config
    }

    /// Most recently negotiated format
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.status().format
    }

    /// Session state as last reported by the service thread
    pub fn state(&self) -> StreamState {
        self.status().state
    }

    fn status(&self) -> StreamStatus {
        match &self.status {
            Some(rx) => *rx.borrow(),
            None => self.last_status,
        }
    }

    /// Config actually handed to the session
    ///
    /// Modifier candidates are dropped when the running libpipewire cannot
    /// negotiate them.
    fn effective_config(&self) -> PipeWireConfig {
        let mut config = self.config.clone();
        if config.wants_dmabuf() {
            let version = library_version();
            if !dmabuf_negotiation_supported(&version) {
                warn!(
                    "libpipewire {} cannot negotiate dma-buf modifiers, using memory buffers",
                    version
                );
                for candidate in &mut config.formats {
                    candidate.modifiers.clear();
                }
            }
        }
        config
    }

    /// Wait for the next event from the service thread
    ///
    /// Returns `None` once the capture is stopped or the session is gone.
    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.events.as_mut()?.recv().await
    }
}

impl std::fmt::Debug for PipeWireCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWireCapture")
            .field("node_id", &self.config.node_id)
            .field("remote_fd", &self.remote_fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("session", &self.session)
            .field("status", &self.status())
            .finish()
    }
}

impl DesktopCapture for PipeWireCapture {
    fn name(&self) -> &str {
        "pipewire"
    }

    fn start(&mut self) -> Result<(), CaptureBackendError> {
        if self.session.is_some() {
            debug!("PipeWire capture already running");
            return Ok(());
        }

        let config = self.effective_config();
        let remote_fd = self
            .remote_fd
            .as_ref()
            .map(|fd| fd.try_clone())
            .transpose()
            .map_err(|e| {
                CaptureBackendError::ConnectionFailed(format!("Failed to duplicate remote fd: {}", e))
            })?;

        let (sink, events) = ChannelSink::new(config.queue_depth);
        let status = sink.status();
        let session = PipeWireSession::initialize(&config, remote_fd, sink)?;

        info!("PipeWire capture started on node {}", config.node_id);
        self.events = Some(events);
        self.status = Some(status);
        self.session = Some(session);
        Ok(())
    }

    fn receive(&mut self) -> Option<OwnedFrame> {
        let mut latest = None;
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            if let CaptureEvent::Frame(frame) = event {
                latest = Some(frame);
            }
        }
        latest
    }

    fn pause(&mut self) -> Result<(), CaptureBackendError> {
        let session = self.session.as_ref().ok_or_else(|| {
            CaptureBackendError::Internal("PipeWire capture is not running".to_string())
        })?;
        session.set_active(false)
    }

    fn resume(&mut self) -> Result<(), CaptureBackendError> {
        let session = self.session.as_ref().ok_or_else(|| {
            CaptureBackendError::Internal("PipeWire capture is not running".to_string())
        })?;
        session.set_active(true)
    }

    fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.destroy();
            self.last_status = StreamStatus {
                state: session.state(),
                format: self.format(),
            };
            info!("PipeWire capture stopped");
        }
        self.events = None;
        self.status = None;
    }

    fn is_running(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for PipeWireCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
