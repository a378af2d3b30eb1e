// Screen source selection through xdg-desktop-portal
//
// The ScreenCast portal asks the user which monitor or window to share and
// hands back PipeWire node ids plus a remote fd scoped to that selection.

use std::os::fd::{AsRawFd, OwnedFd};

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::{PersistMode, Session};
use ashpd::enumflags2::BitFlags;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::capture::pipewire::PipeWireCapture;
use crate::capture::CaptureBackendError;
use crate::config::PipeWireConfig;

/// What the user may pick in the portal dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortalSource {
    #[default]
    Monitor,
    Window,
    /// Monitors and windows
    Any,
}

/// Options for the portal selection dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalOptions {
    pub source: PortalSource,
    /// Allow selecting more than one source
    pub multiple: bool,
    /// Draw the pointer into the frames
    pub embed_cursor: bool,
    /// Ask the portal for a token that skips the dialog next time
    pub persist: bool,
    /// Token from a previous selection
    pub restore_token: Option<String>,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            source: PortalSource::Monitor,
            multiple: false,
            embed_cursor: true,
            persist: true,
            restore_token: None,
        }
    }
}

/// One shared source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalStream {
    pub node_id: u32,
    pub size: Option<(i32, i32)>,
    pub position: Option<(i32, i32)>,
}

/// The user's selection, kept alive as long as this value lives
pub struct PortalSelection {
    /// Leaked for 'static; the session borrows it
    _screencast: &'static Screencast<'static>,
    /// Closing the session ends the screencast
    _session: Session<'static, Screencast<'static>>,
    streams: Vec<PortalStream>,
    restore_token: Option<String>,
    remote_fd: OwnedFd,
}

impl std::fmt::Debug for PortalSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSelection")
            .field("streams", &self.streams)
            .field("restore_token", &self.restore_token.is_some())
            .field("remote_fd", &self.remote_fd.as_raw_fd())
            .finish()
    }
}

impl PortalSelection {
    pub fn streams(&self) -> &[PortalStream] {
        &self.streams
    }

    /// Token to pass as `restore_token` next time
    pub fn restore_token(&self) -> Option<&str> {
        self.restore_token.as_deref()
    }

    pub fn remote_fd(&self) -> &OwnedFd {
        &self.remote_fd
    }

    /// Build a capture for stream `index` over the portal's remote
    ///
    /// `config.node_id` is replaced with the stream's node.
    pub fn capture(
        &self,
        index: usize,
        mut config: PipeWireConfig,
    ) -> Result<PipeWireCapture, CaptureBackendError> {
        let stream = self.streams.get(index).ok_or_else(|| {
            CaptureBackendError::Internal(format!("No portal stream {}", index))
        })?;
        config.node_id = stream.node_id;

        let fd = self.remote_fd.try_clone().map_err(|e| {
            CaptureBackendError::PortalError(format!("Failed to duplicate PipeWire fd: {}", e))
        })?;
        Ok(PipeWireCapture::new(config).with_remote_fd(fd))
    }
}

fn source_types(source: PortalSource) -> BitFlags<SourceType> {
    match source {
        PortalSource::Monitor => SourceType::Monitor.into(),
        PortalSource::Window => SourceType::Window.into(),
        PortalSource::Any => SourceType::Monitor | SourceType::Window,
    }
}

/// Map a portal failure, treating cancellation as a denied permission
fn portal_error(action: &str, e: ashpd::Error) -> CaptureBackendError {
    let message = e.to_string();
    if message.contains("cancelled") || message.contains("denied") {
        CaptureBackendError::PermissionDenied(format!("User cancelled {}", action))
    } else {
        CaptureBackendError::PortalError(format!("Failed to {}: {}", action, message))
    }
}

/// Show the portal dialog (or reuse a restore token) and open the remote
pub async fn select_sources(options: &PortalOptions) -> Result<PortalSelection, CaptureBackendError> {
    info!("Requesting screen selection via portal");

    // Session borrows from the proxy, so the proxy is leaked for 'static
    let screencast: &'static Screencast<'static> = Box::leak(Box::new(
        Screencast::new().await.map_err(|e| {
            CaptureBackendError::PortalError(format!(
                "Failed to connect to screencast portal: {}",
                e
            ))
        })?,
    ));

    let session = screencast.create_session().await.map_err(|e| {
        CaptureBackendError::PortalError(format!("Failed to create session: {}", e))
    })?;
    debug!("Portal session created");

    let cursor_mode = if options.embed_cursor {
        CursorMode::Embedded
    } else {
        CursorMode::Hidden
    };
    let persist_mode = if options.persist {
        PersistMode::ExplicitlyRevoked
    } else {
        PersistMode::DoNot
    };

    screencast
        .select_sources(
            &session,
            cursor_mode,
            source_types(options.source),
            options.multiple,
            options.restore_token.as_deref(),
            persist_mode,
        )
        .await
        .map_err(|e| portal_error("select sources", e))?;
    debug!("Source selection completed");

    let response = screencast
        .start(&session, None)
        .await
        .map_err(|e| portal_error("start screencast", e))?
        .response()
        .map_err(|e| {
            error!("Failed to get screencast response: {}", e);
            portal_error("start screencast", e)
        })?;

    let streams: Vec<PortalStream> = response
        .streams()
        .iter()
        .map(|stream| PortalStream {
            node_id: stream.pipe_wire_node_id(),
            size: stream.size(),
            position: stream.position(),
        })
        .collect();

    if streams.is_empty() {
        return Err(CaptureBackendError::PortalError(
            "No streams returned from portal".to_string(),
        ));
    }
    for stream in &streams {
        info!(
            "Portal stream on node {}, size {:?} at {:?}",
            stream.node_id, stream.size, stream.position
        );
    }

    let restore_token = response.restore_token().map(str::to_owned);

    let remote_fd = screencast
        .open_pipe_wire_remote(&session)
        .await
        .map_err(|e| {
            CaptureBackendError::PortalError(format!("Failed to open PipeWire remote: {}", e))
        })?;
    debug!("Got PipeWire fd {}", remote_fd.as_raw_fd());

    Ok(PortalSelection {
        _screencast: screencast,
        _session: session,
        streams,
        restore_token,
        remote_fd,
    })
}
