//! Live session handover between processes
//!
//! The bootstrap side ([`transfer`]) sends a detached client socket over a
//! Unix socket with `SCM_RIGHTS`, followed by the session state as JSON, and
//! waits for the worker's acknowledgement. The worker side
//! ([`HandoverDaemon`]) adopts the socket through the protocol layer,
//! restarts the pipeline where the bootstrap left off and serves the client.
//!
//! # Wire format
//!
//! ```text
//! bootstrap → worker   u32 BE length + SCM_RIGHTS(fd) | JSON HandoverState
//! worker → bootstrap   u32 BE length | JSON HandoverAck
//! ```
//!
//! The client never sees the switch: the bootstrap flushes every encoded
//! update before detaching, unread client bytes travel in the state, and
//! the worker continues the update sequence with a full frame.

use std::collections::HashMap;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::protocol::{ConnectionContext, DetachedConnection, ProtocolError};
use crate::server::{ConnectionId, ServerRuntime, Session, SessionCommand, SessionSettings};

/// Version of the handover state format
pub const HANDOVER_VERSION: u16 = 1;

/// Largest state or ack document accepted
const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

/// How long either side waits for the other
const IO_TIMEOUT: Duration = Duration::from_secs(10);

const HEADER_LEN: usize = 4;

/// Handover errors
#[derive(Debug, thiserror::Error)]
pub enum HandoverError {
    /// The connection's transport cannot be moved (TLS)
    #[error("connection transport cannot be handed over")]
    TransportNotDetachable,

    /// Detaching the connection failed
    #[error("failed to detach connection: {0}")]
    Detach(#[source] ProtocolError),

    /// Socket failure
    #[error("handover I/O error: {0}")]
    Io(#[from] io::Error),

    /// Descriptor passing failure
    #[error("descriptor passing failed: {0}")]
    Nix(#[from] nix::Error),

    /// State (de)serialization failure
    #[error("invalid handover state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The worker refused the session
    #[error("handover rejected: {0}")]
    Rejected(String),

    /// No descriptor arrived with the state
    #[error("no socket descriptor received")]
    NoDescriptor,

    /// State format mismatch
    #[error("handover version {found} not supported (expected {expected})")]
    VersionMismatch {
        /// Version this build speaks
        expected: u16,
        /// Version received
        found: u16,
    },

    /// Document length over the limit
    #[error("handover document of {0} bytes is too large")]
    TooLarge(usize),

    /// The session ended before the handover completed
    #[error("session closed")]
    SessionClosed,

    /// Daemon already started
    #[error("handover daemon already running")]
    AlreadyRunning,

    /// Daemon not started
    #[error("handover daemon not running")]
    NotRunning,
}

/// Everything the worker needs to continue a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverState {
    /// Format version
    pub version: u16,
    /// Connection state including unread client bytes
    pub connection: ConnectionContext,
    /// Geometry, encoding and next sequence
    pub session: SessionSettings,
}

#[derive(Debug, Serialize, Deserialize)]
struct HandoverAck {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Send a detached connection to the daemon at `socket`
///
/// On failure the connection is handed back so the caller can resume it.
pub async fn transfer(
    socket: &Path,
    detached: DetachedConnection,
    session: SessionSettings,
) -> Result<(), (DetachedConnection, HandoverError)> {
    let stream = match detached.stream.try_clone() {
        Ok(stream) => stream,
        Err(e) => return Err((detached, e.into())),
    };
    let state = HandoverState {
        version: HANDOVER_VERSION,
        connection: detached.state.clone(),
        session,
    };
    let socket = socket.to_path_buf();

    let joined = tokio::task::spawn_blocking(move || send_state(&socket, stream.as_raw_fd(), &state)).await;
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((detached, e)),
        Err(e) => Err((detached, io::Error::new(io::ErrorKind::Other, e.to_string()).into())),
    }
}

fn send_state(socket: &Path, fd: RawFd, state: &HandoverState) -> Result<(), HandoverError> {
    let mut control = StdUnixStream::connect(socket)?;
    control.set_read_timeout(Some(IO_TIMEOUT))?;
    control.set_write_timeout(Some(IO_TIMEOUT))?;

    let payload = serde_json::to_vec(state)?;
    if payload.len() > MAX_DOCUMENT_LEN {
        return Err(HandoverError::TooLarge(payload.len()));
    }
    let header = (payload.len() as u32).to_be_bytes();

    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&header)];
    let sent = sendmsg::<()>(control.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    control.write_all(&header[sent..])?;
    control.write_all(&payload)?;
    debug!(
        "Sent handover state to {:?} ({} bytes, {} pending input bytes)",
        socket,
        payload.len(),
        state.connection.pending_input.len()
    );

    let ack: HandoverAck = serde_json::from_slice(&read_document(&mut control)?)?;
    if ack.accepted {
        Ok(())
    } else {
        Err(HandoverError::Rejected(
            ack.reason.unwrap_or_else(|| "no reason given".to_string()),
        ))
    }
}

fn receive_state(control: &mut StdUnixStream) -> Result<(std::net::TcpStream, HandoverState), HandoverError> {
    let mut header = [0u8; HEADER_LEN];
    let (received, fds) = {
        let mut iov = [IoSliceMut::new(&mut header)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            control.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }
        (msg.bytes, fds)
    };

    #[allow(unsafe_code)]
    // SAFETY: descriptors delivered by SCM_RIGHTS are fresh and owned by us.
    let mut fds: Vec<OwnedFd> = fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
    if fds.is_empty() {
        return Err(HandoverError::NoDescriptor);
    }
    if fds.len() > 1 {
        warn!("Ignoring {} extra descriptors", fds.len() - 1);
    }
    let fd = fds.swap_remove(0);

    if received == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    control.read_exact(&mut header[received..])?;
    let payload = read_body(control, u32::from_be_bytes(header) as usize)?;
    let state: HandoverState = serde_json::from_slice(&payload)?;

    if state.version != HANDOVER_VERSION {
        return Err(HandoverError::VersionMismatch {
            expected: HANDOVER_VERSION,
            found: state.version,
        });
    }

    Ok((std::net::TcpStream::from(fd), state))
}

fn send_ack(control: &mut StdUnixStream, result: &Result<(), String>) -> Result<(), HandoverError> {
    let ack = match result {
        Ok(()) => HandoverAck {
            accepted: true,
            reason: None,
        },
        Err(reason) => HandoverAck {
            accepted: false,
            reason: Some(reason.clone()),
        },
    };
    let payload = serde_json::to_vec(&ack)?;
    control.write_all(&(payload.len() as u32).to_be_bytes())?;
    control.write_all(&payload)?;
    control.flush()?;
    Ok(())
}

fn read_document(stream: &mut StdUnixStream) -> Result<Vec<u8>, HandoverError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    read_body(stream, u32::from_be_bytes(header) as usize)
}

fn read_body(stream: &mut StdUnixStream, len: usize) -> Result<Vec<u8>, HandoverError> {
    if len > MAX_DOCUMENT_LEN {
        return Err(HandoverError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

struct DaemonShared {
    runtime: Arc<ServerRuntime>,
    sessions: Mutex<HashMap<ConnectionId, mpsc::Sender<SessionCommand>>>,
}

struct DaemonRunning {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

/// Worker side: adopts handed-over sessions and serves them
pub struct HandoverDaemon {
    shared: Arc<DaemonShared>,
    socket_path: PathBuf,
    running: Mutex<Option<DaemonRunning>>,
}

impl HandoverDaemon {
    /// Create a stopped daemon on the configured handover socket
    pub fn new(runtime: Arc<ServerRuntime>) -> Self {
        let socket_path = runtime.config().handover.socket_path.clone();
        Self {
            shared: Arc::new(DaemonShared {
                runtime,
                sessions: Mutex::new(HashMap::new()),
            }),
            socket_path,
            running: Mutex::new(None),
        }
    }

    /// Socket the daemon listens on
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sessions currently served
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Bind the handover socket and start accepting sessions
    pub async fn start(&self) -> Result<(), HandoverError> {
        if self.running.lock().is_some() {
            return Err(HandoverError::AlreadyRunning);
        }

        remove_stale_socket(&self.socket_path)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(HandoverError::AlreadyRunning);
        }
        let accept_task = self.shared.runtime.handle().spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
            tracker.clone(),
        ));
        *running = Some(DaemonRunning {
            shutdown,
            tracker,
            accept_task,
        });

        info!("Handover daemon listening on {:?}", self.socket_path);
        Ok(())
    }

    /// Stop accepting, end every adopted session and remove the socket
    pub async fn stop(&self) -> Result<(), HandoverError> {
        let running = self.running.lock().take().ok_or(HandoverError::NotRunning)?;

        running.shutdown.cancel();
        for control in self.shared.sessions.lock().values() {
            let _ = control.try_send(SessionCommand::Stop);
        }
        if let Err(e) = running.accept_task.await {
            error!("Handover accept loop failed: {}", e);
        }
        running.tracker.close();
        running.tracker.wait().await;

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", self.socket_path, e);
            }
        }
        info!("Handover daemon stopped");
        Ok(())
    }
}

impl std::fmt::Debug for HandoverDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoverDaemon")
            .field("socket_path", &self.socket_path)
            .field("sessions", &self.session_count())
            .finish()
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), HandoverError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale handover socket {:?}", path);
            std::fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )
        .into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<DaemonShared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Failed to accept handover: {}", e);
                    continue;
                }
            },
        };

        let task_shared = Arc::clone(&shared);
        let shutdown = shutdown.clone();
        tracker.spawn_on(
            async move {
                if let Err(e) = adopt_session(task_shared, stream, shutdown).await {
                    warn!("Handover not completed: {}", e);
                }
            },
            shared.runtime.handle(),
        );
    }

    debug!("Handover accept loop exited");
}

async fn adopt_session(
    shared: Arc<DaemonShared>,
    stream: UnixStream,
    shutdown: CancellationToken,
) -> Result<(), HandoverError> {
    let mut control = stream.into_std()?;
    control.set_nonblocking(false)?;
    control.set_read_timeout(Some(IO_TIMEOUT))?;
    control.set_write_timeout(Some(IO_TIMEOUT))?;

    let (mut control, received) = tokio::task::spawn_blocking(move || {
        let received = receive_state(&mut control);
        (control, received)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let started = match received {
        Ok((tcp, state)) => start_adopted(&shared.runtime, tcp, state).await,
        Err(e) => Err(e),
    };

    let session = match started {
        Ok(session) => session,
        Err(e) => {
            let reason = e.to_string();
            tokio::task::spawn_blocking(move || send_ack(&mut control, &Err(reason)))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))??;
            return Err(e);
        }
    };

    let acked = tokio::task::spawn_blocking(move || send_ack(&mut control, &Ok(())))
        .await
        .map_err(|e| HandoverError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
        .and_then(|sent| sent);
    if let Err(e) = acked {
        // The bootstrap resumes on its own when it sees no ack.
        session.shutdown().await;
        return Err(e);
    }

    let id = shared.runtime.next_connection_id();
    let (control_tx, commands) = mpsc::channel(4);
    shared.sessions.lock().insert(id, control_tx.clone());
    if shutdown.is_cancelled() {
        let _ = control_tx.try_send(SessionCommand::Stop);
    }

    info!("Adopted session {} for '{}'", id, session.username());
    let end = session.run(commands).await;
    shared.sessions.lock().remove(&id);
    info!("Adopted session ended: {}", end.reason);
    Ok(())
}

async fn start_adopted(
    runtime: &Arc<ServerRuntime>,
    tcp: std::net::TcpStream,
    state: HandoverState,
) -> Result<Session, HandoverError> {
    debug!(
        "Adopting connection for '{}' at {}x{} (next sequence {})",
        state.connection.username,
        state.session.width,
        state.session.height,
        state.session.next_sequence
    );
    let connection = runtime
        .protocol()
        .adopt(tcp, state.connection)
        .map_err(HandoverError::Detach)?;
    Session::start(Arc::clone(runtime), connection, state.session)
        .await
        .map_err(|e| HandoverError::Rejected(e.to_string()))
}
