//! TCP listener and per-connection lifecycle

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::session::{Session, SessionCommand, SessionSettings};
use super::{CloseReason, ConnectionId, ConnectionState, ListenerEvent, ServerError, ServerRuntime};
use crate::handover::HandoverError;
use crate::protocol::{RdpConnection, Transport};
use crate::security::NlaCredential;

const EVENT_CAPACITY: usize = 256;
const CONTROL_CAPACITY: usize = 4;

struct ListenerShared {
    runtime: Arc<ServerRuntime>,
    events: broadcast::Sender<ListenerEvent>,
    sessions: Mutex<HashMap<ConnectionId, mpsc::Sender<SessionCommand>>>,
    active: AtomicUsize,
}

impl ListenerShared {
    fn emit(&self, event: ListenerEvent) {
        debug!("Listener event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn set_state(&self, id: ConnectionId, state: ConnectionState) {
        self.emit(ListenerEvent::StateChanged { id, state });
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

/// Accepts clients, authenticates them and runs their sessions
pub struct RdpListener {
    shared: Arc<ListenerShared>,
    running: Mutex<Option<Running>>,
}

impl RdpListener {
    /// Create a stopped listener
    pub fn new(runtime: Arc<ServerRuntime>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(ListenerShared {
                runtime,
                events,
                sessions: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.shared.events.subscribe()
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.running.lock().is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let runtime = &self.shared.runtime;
        let config = runtime.config();
        let addr = config
            .listen_addr()
            .map_err(|e| ServerError::Config(format!("{:#}", e)))?;

        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║          X11 RDP Server Starting                           ║");
        info!("╚════════════════════════════════════════════════════════════╝");
        info!("  Listen Address: {}", addr);
        info!("  Max Connections: {}", config.server.max_connections);
        info!("  TLS: {}", if runtime.tls().is_some() { "enabled" } else { "disabled" });
        info!("  Protocol: {}", runtime.protocol().name());
        info!("  Desktop: {}", runtime.desktop().name());
        info!("  Encoding: {}", config.encoding.mode);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let accept_task = runtime.handle().spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
            tracker.clone(),
        ));
        *running = Some(Running {
            local_addr,
            shutdown,
            tracker,
            accept_task,
        });

        info!("Listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, end every session and wait for all connection tasks
    pub async fn stop(&self) -> Result<(), ServerError> {
        let running = self.running.lock().take().ok_or(ServerError::NotRunning)?;

        info!("Stopping listener on {}", running.local_addr);
        running.shutdown.cancel();
        for control in self.shared.sessions.lock().values() {
            let _ = control.try_send(SessionCommand::Stop);
        }

        if let Err(e) = running.accept_task.await {
            error!("Accept loop failed: {}", e);
        }
        running.tracker.close();
        running.tracker.wait().await;

        info!("Listener stopped");
        Ok(())
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Connections currently serving a session
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.shared.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Connections in any state other than idle
    pub fn connection_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Move a live session to the handover daemon listening on `socket`
    ///
    /// On failure the session keeps serving on this listener.
    pub async fn hand_over(&self, id: ConnectionId, socket: &Path) -> Result<(), ServerError> {
        let control = self
            .shared
            .sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ServerError::UnknownConnection(id))?;

        let (reply, outcome) = oneshot::channel();
        control
            .send(SessionCommand::HandOver {
                target: socket.to_path_buf(),
                reply,
            })
            .await
            .map_err(|_| HandoverError::SessionClosed)?;

        outcome.await.map_err(|_| HandoverError::SessionClosed)??;
        info!("Connection {} handed over to {:?}", id, socket);
        Ok(())
    }

    /// Hand over every serving session, one at a time
    pub async fn hand_over_all(&self, socket: &Path) -> Vec<(ConnectionId, Result<(), ServerError>)> {
        let mut results = Vec::new();
        for id in self.active_connections() {
            let result = self.hand_over(id, socket).await;
            if let Err(e) = &result {
                warn!("Handover of connection {} failed: {}", id, e);
            }
            results.push((id, result));
        }
        results
    }
}

impl std::fmt::Debug for RdpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpListener")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ListenerShared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let max_connections = shared.runtime.config().server.max_connections;

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let id = shared.runtime.next_connection_id();
        info!("Incoming connection {} from {}", id, peer);

        if shared.active.load(Ordering::SeqCst) >= max_connections {
            warn!("Rejecting connection from {} - connection limit reached", peer);
            shared.emit(ListenerEvent::Closed {
                id,
                reason: CloseReason::ConnectionLimit,
            });
            continue;
        }
        shared.active.fetch_add(1, Ordering::SeqCst);

        let task_shared = Arc::clone(&shared);
        let shutdown = shutdown.clone();
        tracker.spawn_on(
            async move {
                let reason = handle_connection(&task_shared, id, stream, peer, shutdown).await;
                task_shared.set_state(id, ConnectionState::Closing);
                if reason.is_orderly() {
                    info!("Connection {} closed: {}", id, reason);
                } else {
                    warn!("Connection {} closed: {}", id, reason);
                }
                task_shared.emit(ListenerEvent::Closed { id, reason });
                task_shared.set_state(id, ConnectionState::Idle);
                task_shared.active.fetch_sub(1, Ordering::SeqCst);
            },
            shared.runtime.handle(),
        );
    }

    debug!("Accept loop exited");
}

async fn handle_connection(
    shared: &Arc<ListenerShared>,
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) -> CloseReason {
    let runtime = &shared.runtime;
    shared.set_state(id, ConnectionState::Accepting);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let credential = match runtime
        .provisioner()
        .generate_with_hash(runtime.username(), runtime.nt_hash())
    {
        Ok(credential) => credential,
        Err(e) => {
            error!("Failed to provision credential for {}: {}", peer, e);
            return CloseReason::Internal(e.to_string());
        }
    };
    let credential_path = credential.path().to_path_buf();
    shared.emit(ListenerEvent::CredentialIssued {
        id,
        path: credential_path.clone(),
    });

    shared.set_state(id, ConnectionState::Authenticating);
    let handshake = tokio::select! {
        result = tokio::time::timeout(
            runtime.config().handshake_timeout(),
            authenticate(runtime, stream, peer, &credential),
        ) => match result {
            Ok(result) => result,
            Err(_) => Err(CloseReason::Transport("handshake timed out".into())),
        },
        _ = shutdown.cancelled() => Err(CloseReason::Shutdown),
    };

    match runtime.provisioner().free(credential) {
        Ok(()) => shared.emit(ListenerEvent::CredentialFreed {
            id,
            path: credential_path,
        }),
        Err(e) => error!("Failed to remove credential {:?}: {}", credential_path, e),
    }

    let connection = match handshake {
        Ok(connection) => connection,
        Err(reason) => return reason,
    };

    let username = connection.username().to_string();
    let settings = SessionSettings::from_config(runtime.config(), connection.requested_size());
    let session = match Session::start(Arc::clone(runtime), connection, settings).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session for '{}': {}", username, e);
            return CloseReason::Internal(e.to_string());
        }
    };

    let (control, commands) = mpsc::channel(CONTROL_CAPACITY);
    shared.sessions.lock().insert(id, control.clone());
    if shutdown.is_cancelled() {
        let _ = control.try_send(SessionCommand::Stop);
    }

    let started = session.settings();
    shared.set_state(id, ConnectionState::Serving);
    shared.emit(ListenerEvent::SessionStarted {
        id,
        username,
        peer: Some(peer),
        width: started.width,
        height: started.height,
    });

    let end = session.run(commands).await;
    shared.sessions.lock().remove(&id);
    debug!("Connection {} session stats: {:?}", id, end.stats);
    end.reason
}

async fn authenticate(
    runtime: &ServerRuntime,
    stream: TcpStream,
    peer: SocketAddr,
    credential: &NlaCredential,
) -> Result<Box<dyn RdpConnection>, CloseReason> {
    let transport = match runtime.tls() {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| CloseReason::Transport(format!("TLS handshake failed: {}", e)))?;
            debug!("TLS established with {}", peer);
            Transport::Tls(Box::new(tls))
        }
        None => Transport::Plain(stream),
    };

    runtime
        .protocol()
        .accept(transport, peer, credential)
        .await
        .map_err(CloseReason::from)
}
