// PipeWire stream session
//
// All PipeWire objects live on a dedicated service thread. The caller only
// holds a command channel, the join handle and the shared state machine.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use pipewire as pw;
use pw::context::Context;
use pw::main_loop::MainLoop;
use pw::properties::properties;
use pw::spa;
use pw::spa::param::ParamType;
use pw::spa::pod::Pod;
use pw::stream::{Stream, StreamFlags, StreamRef};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::format::{
    accepted_buffer_kinds, as_pod, buffers_bytes, build_proposals, format_name,
    parse_negotiated, proposal_bytes,
};
use super::queue::{process_latest, BufferQueue, QueuedFrame};
use super::sink::{FrameSink, RawFrame, RawPlane};
use crate::capture::CaptureBackendError;
use crate::config::{CandidateFormat, PipeWireConfig};
use crate::events::StateChangedEvent;
use crate::frame::{BufferKind, FormatDescriptor};
use crate::state::{StateMachine, StreamState, TransitionError};

/// Requests from the caller to the service thread
#[derive(Debug)]
enum Command {
    SetActive(bool),
    Terminate,
}

fn lock_state(state: &Mutex<StateMachine>) -> MutexGuard<'_, StateMachine> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A capture stream connected to one PipeWire node
pub struct PipeWireSession {
    id: Uuid,
    name: String,
    commands: Option<pw::channel::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<Mutex<StateMachine>>,
}

impl std::fmt::Debug for PipeWireSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWireSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything the service thread needs to build the stream
struct ServiceSetup<S> {
    id: Uuid,
    name: String,
    node_id: u32,
    fps: u32,
    formats: Vec<CandidateFormat>,
    remote_fd: Option<OwnedFd>,
    sink: S,
    state: Arc<Mutex<StateMachine>>,
}

impl PipeWireSession {
    /// Start the service thread, connect and offer formats to `config.node_id`
    ///
    /// `remote_fd` is the PipeWire remote handed out by the screencast portal;
    /// without it the default daemon socket is used. Returns once the stream
    /// is connected (or failed to be); the sink starts receiving callbacks
    /// after that, on the service thread.
    pub fn initialize<S: FrameSink>(
        config: &PipeWireConfig,
        remote_fd: Option<OwnedFd>,
        sink: S,
    ) -> Result<Self, CaptureBackendError> {
        pw::init();

        let id = Uuid::new_v4();
        let state = Arc::new(Mutex::new(StateMachine::new()));
        let (command_tx, command_rx) = pw::channel::channel::<Command>();
        let (ready_tx, ready_rx) = sync_channel(1);

        info!(
            "PipeWire session {}: connecting to node {} at {} fps ({} candidate formats)",
            id,
            config.node_id,
            config.fps,
            config.formats.len()
        );

        let setup = ServiceSetup {
            id,
            name: config.name.clone(),
            node_id: config.node_id,
            fps: config.fps,
            formats: config.formats.clone(),
            remote_fd,
            sink,
            state: Arc::clone(&state),
        };

        let thread = thread::Builder::new()
            .name(format!("pw-{}", config.name))
            .spawn(move || run_service(setup, command_rx, ready_tx))
            .map_err(|e| {
                CaptureBackendError::StreamSetup(format!("Failed to spawn service thread: {}", e))
            })?;

        let setup_result = ready_rx.recv().unwrap_or_else(|_| {
            Err(CaptureBackendError::StreamSetup(
                "Service thread exited during setup".to_string(),
            ))
        });

        match setup_result {
            Ok(()) => Ok(Self {
                id,
                name: config.name.clone(),
                commands: Some(command_tx),
                thread: Some(thread),
                state,
            }),
            Err(e) => {
                error!("PipeWire session {}: setup failed: {}", id, e);
                if thread.join().is_err() {
                    error!("PipeWire session {}: service thread panicked", id);
                }
                Err(e)
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> StreamState {
        lock_state(&self.state).state()
    }

    /// Pause (`false`) or resume (`true`) frame delivery
    pub fn set_active(&self, active: bool) -> Result<(), CaptureBackendError> {
        let commands = self.commands.as_ref().ok_or_else(|| {
            CaptureBackendError::Internal("Session already destroyed".to_string())
        })?;
        commands.send(Command::SetActive(active)).map_err(|_| {
            CaptureBackendError::Internal("PipeWire service thread is gone".to_string())
        })
    }

    /// Stop the service thread and wait for it to release the stream
    ///
    /// Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(commands) = self.commands.take() {
            // A closed channel means the loop already ended
            let _ = commands.send(Command::Terminate);
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("PipeWire session {}: service thread panicked", self.id);
            }
            // Covers a thread that died before recording the final state
            let mut sm = lock_state(&self.state);
            if sm.state() != StreamState::Destroyed {
                let _ = sm.destroy();
            }
            info!("PipeWire session {} destroyed", self.id);
        }
    }
}

impl Drop for PipeWireSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Stream-side state shared by the listener callbacks
struct Handler<S> {
    id: Uuid,
    sink: S,
    format: Option<FormatDescriptor>,
    dmabuf_requested: bool,
    state: Arc<Mutex<StateMachine>>,
}

impl<S: FrameSink> Handler<S> {
    fn transition(&mut self, change: fn(&mut StateMachine) -> Result<StreamState, TransitionError>) {
        let event = {
            let mut sm = lock_state(&self.state);
            let previous = sm.state();
            match change(&mut sm) {
                Ok(state) if state != previous => Some(StateChangedEvent { state, previous }),
                Ok(_) => None,
                Err(e) => {
                    warn!("PipeWire session {}: {}", self.id, e);
                    None
                }
            }
        };

        if let Some(event) = event {
            debug!(
                "PipeWire session {}: {:?} -> {:?}",
                self.id, event.previous, event.state
            );
            self.sink.on_state_changed(event);
        }
    }

    /// Record a negotiated format; returns the buffer types to accept
    fn on_format(&mut self, param: &Pod) -> Option<u32> {
        let Some(format) = parse_negotiated(param) else {
            warn!(
                "PipeWire session {}: ignoring format that is not raw video",
                self.id
            );
            return None;
        };

        info!(
            "PipeWire session {}: got video format {} {}x{} @ {} modifier {:?}",
            self.id,
            format_name(format.format),
            format.width,
            format.height,
            format.framerate,
            format.modifier
        );

        self.format = Some(format);
        self.transition(StateMachine::format_negotiated);
        self.sink.on_format(&format);

        Some(accepted_buffer_kinds(&format, self.dmabuf_requested))
    }

    fn on_format_cleared(&mut self) {
        if self.format.take().is_some() {
            debug!("PipeWire session {}: format cleared", self.id);
            self.transition(StateMachine::format_cleared);
        }
    }

    fn on_process(&mut self, stream: &StreamRef) {
        let format = self.format;
        let sink = &mut self.sink;
        let mut queue = StreamQueue { stream };

        process_latest(&mut queue, |buffer| match format.as_ref() {
            Some(format) => sink.on_frame(&raw_frame(format, buffer)),
            None => trace!("Frame before format negotiation, recycling"),
        });
    }
}

/// Adapter giving the drain logic access to a live stream
struct StreamQueue<'s> {
    stream: &'s StreamRef,
}

impl<'s> BufferQueue for StreamQueue<'s> {
    type Buffer = pw::buffer::Buffer<'s>;

    fn dequeue(&mut self) -> Option<Self::Buffer> {
        self.stream.dequeue_buffer()
    }

    fn requeue(&mut self, buffer: Self::Buffer) {
        // Buffer hands itself back to the stream on drop
        drop(buffer);
    }
}

impl QueuedFrame for pw::buffer::Buffer<'_> {
    fn has_data(&mut self) -> bool {
        self.datas_mut()
            .first_mut()
            .map(|d| d.data().is_some())
            .unwrap_or(false)
    }

    fn payload_size(&mut self) -> u32 {
        self.datas_mut()
            .first()
            .map(|d| d.chunk().size())
            .unwrap_or(0)
    }
}

fn raw_frame<'b>(format: &'b FormatDescriptor, buffer: &'b mut pw::buffer::Buffer<'_>) -> RawFrame<'b> {
    let planes = buffer
        .datas_mut()
        .iter_mut()
        .map(|data| {
            let (type_, fd) = {
                let raw = data.as_raw();
                (raw.type_, raw.fd)
            };
            let kind = BufferKind::from_spa(type_);
            let fd = match kind {
                Some(BufferKind::MemFd | BufferKind::DmaBuf) if fd >= 0 => {
                    // SAFETY: the fd stays open while the buffer is dequeued,
                    // which outlives the borrow of `buffer`
                    Some(unsafe { BorrowedFd::borrow_raw(fd as RawFd) })
                }
                _ => None,
            };
            let chunk = data.chunk();
            let (offset, stride, size) = (chunk.offset(), chunk.stride(), chunk.size());
            let data = data.data().map(|bytes| &*bytes);

            RawPlane {
                kind,
                fd,
                offset,
                stride,
                size,
                data,
            }
        })
        .collect();

    RawFrame { format, planes }
}

fn run_service<S: FrameSink>(
    setup: ServiceSetup<S>,
    commands: pw::channel::Receiver<Command>,
    ready: SyncSender<Result<(), CaptureBackendError>>,
) {
    let id = setup.id;
    let handler = Rc::new(RefCell::new(Handler {
        id,
        sink: setup.sink,
        format: None,
        dmabuf_requested: setup.formats.iter().any(|f| !f.modifiers.is_empty()),
        state: setup.state,
    }));
    handler.borrow_mut().transition(StateMachine::begin_connect);

    let stream_setup = StreamSetup {
        id,
        name: setup.name,
        node_id: setup.node_id,
        fps: setup.fps,
        formats: setup.formats,
        remote_fd: setup.remote_fd,
    };

    if let Err(e) = serve(stream_setup, &handler, commands, &ready) {
        // Everything `serve` created has been dropped by now
        let _ = ready.send(Err(e));
    }

    handler.borrow_mut().transition(StateMachine::destroy);
    debug!("PipeWire session {}: service thread exiting", id);
}

struct StreamSetup {
    id: Uuid,
    name: String,
    node_id: u32,
    fps: u32,
    formats: Vec<CandidateFormat>,
    remote_fd: Option<OwnedFd>,
}

/// Build the stream, run the loop until terminated, tear down in order
fn serve<S: FrameSink>(
    setup: StreamSetup,
    handler: &Rc<RefCell<Handler<S>>>,
    commands: pw::channel::Receiver<Command>,
    ready: &SyncSender<Result<(), CaptureBackendError>>,
) -> Result<(), CaptureBackendError> {
    let id = setup.id;

    let main_loop = MainLoop::new(None).map_err(|e| {
        CaptureBackendError::StreamSetup(format!("Failed to create main loop: {}", e))
    })?;

    let context = Context::new(&main_loop).map_err(|e| {
        CaptureBackendError::StreamSetup(format!("Failed to create context: {}", e))
    })?;

    let core = match setup.remote_fd {
        Some(fd) => context.connect_fd(fd, None),
        None => context.connect(None),
    }
    .map_err(|e| CaptureBackendError::ConnectionFailed(format!("Failed to connect: {}", e)))?;

    let stream = Rc::new(
        Stream::new(
            &core,
            &setup.name,
            properties! {
                *pw::keys::MEDIA_TYPE => "Video",
                *pw::keys::MEDIA_CATEGORY => "Capture",
                *pw::keys::MEDIA_ROLE => "Screen",
            },
        )
        .map_err(|e| CaptureBackendError::StreamSetup(format!("Failed to create stream: {}", e)))?,
    );

    let listener = stream
        .add_local_listener::<()>()
        .state_changed(move |_, _, old, new| match new {
            pw::stream::StreamState::Error(msg) => {
                error!("PipeWire session {}: stream error: {}", id, msg)
            }
            new => debug!("PipeWire session {}: stream {:?} -> {:?}", id, old, new),
        })
        .param_changed({
            let handler = Rc::clone(handler);
            move |stream, _, param_id, param| {
                if param_id != ParamType::Format.as_raw() {
                    return;
                }
                let Some(param) = param else {
                    handler.borrow_mut().on_format_cleared();
                    return;
                };

                // Borrow released before update_params, which may re-enter callbacks
                let accepted = handler.borrow_mut().on_format(param);
                if let Some(mask) = accepted {
                    if let Err(e) = update_buffer_types(stream, mask) {
                        warn!("PipeWire session {}: {}", id, e);
                    }
                }
            }
        })
        .process({
            let handler = Rc::clone(handler);
            move |stream, _| handler.borrow_mut().on_process(stream)
        })
        .register()
        .map_err(|e| {
            CaptureBackendError::StreamSetup(format!("Failed to register listener: {}", e))
        })?;

    let proposals = build_proposals(setup.fps, &setup.formats);
    let serialized = proposals
        .iter()
        .map(proposal_bytes)
        .collect::<Result<Vec<_>, _>>()?;
    let mut params = serialized
        .iter()
        .map(|bytes| as_pod(bytes))
        .collect::<Result<Vec<&Pod>, _>>()?;

    debug!(
        "PipeWire session {}: offering {} format proposals",
        id,
        params.len()
    );

    stream
        .connect(
            spa::utils::Direction::Input,
            Some(setup.node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|e| CaptureBackendError::StreamSetup(format!("Failed to connect stream: {}", e)))?;

    let attached = commands.attach(main_loop.loop_(), {
        let main_loop = main_loop.clone();
        let stream = Rc::clone(&stream);
        let handler = Rc::clone(handler);
        move |command| match command {
            Command::SetActive(active) => {
                // No handler borrow held: set_active can emit state_changed
                if let Err(e) = stream.set_active(active) {
                    warn!("PipeWire session {}: set_active({}) failed: {}", id, active, e);
                    return;
                }
                let change = if active {
                    StateMachine::resume
                } else {
                    StateMachine::pause
                };
                handler.borrow_mut().transition(change);
            }
            Command::Terminate => main_loop.quit(),
        }
    });

    handler.borrow_mut().transition(StateMachine::connected);
    let _ = ready.send(Ok(()));

    main_loop.run();

    debug!("PipeWire session {}: tearing down stream", id);
    drop(attached);
    if let Err(e) = stream.disconnect() {
        debug!("PipeWire session {}: disconnect failed: {}", id, e);
    }
    drop(listener);
    drop(stream);
    drop(core);
    drop(context);
    drop(main_loop);

    Ok(())
}

fn update_buffer_types(stream: &StreamRef, mask: u32) -> Result<(), CaptureBackendError> {
    let bytes = buffers_bytes(mask)?;
    let pod = as_pod(&bytes)?;
    stream.update_params(&mut [pod]).map_err(|e| {
        CaptureBackendError::Negotiation(format!("Failed to update buffer params: {}", e))
    })
}
