//! Server orchestration
//!
//! # Architecture
//!
//! ```text
//! RdpListener (TCP accept loop)
//!   └─> per connection task
//!         ├─> NlaCredentialProvisioner   ephemeral SAM record
//!         ├─> TLS (optional) + ProtocolLayer::accept
//!         └─> Session
//!               ├─> CaptureManager  ─> FrameQueue ─> EncodingManager (pump thread)
//!               ├─> InputDispatcher <─ client input
//!               └─> RdpConnection   <─> client
//! ```
//!
//! Every connection walks the same state machine and reports it through
//! [`ListenerEvent`]s:
//!
//! ```text
//! Idle → Accepting → Authenticating → Serving → Closing → Idle
//!                          └──────────────────────┘ (any failure)
//! ```

mod listener;
mod runtime;
mod session;

pub use listener::RdpListener;
pub use runtime::{ServerRuntime, ServerRuntimeBuilder};
pub use session::{Session, SessionCommand, SessionEnd, SessionError, SessionSettings};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::handover::HandoverError;
use crate::protocol::{HandshakeError, ProtocolError};
use crate::security::CredentialError;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// Credential directory or record failure
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Could not bind the listening socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address requested
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// No tokio runtime to spawn on
    #[error("no tokio runtime available")]
    NoRuntime,

    /// `start` called twice
    #[error("already running")]
    AlreadyRunning,

    /// Operation needs a started server
    #[error("not running")]
    NotRunning,

    /// No connection with that id
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Session handover failed
    #[error(transparent)]
    Handover(#[from] HandoverError),
}

/// Connection number, unique within one [`ServerRuntime`]
///
/// Allocated by [`ServerRuntime::next_connection_id`] for listener
/// connections and adopted sessions alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not (or no longer) associated with a client
    Idle,
    /// TCP accepted, credential being provisioned
    Accepting,
    /// TLS and authentication in progress
    Authenticating,
    /// Session running
    Serving,
    /// Tearing down
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Accepting => "accepting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Serving => "serving",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client hung up
    ClientDisconnected,
    /// The client failed authentication
    Authentication(String),
    /// Socket, TLS or timeout failure
    Transport(String),
    /// The client broke the protocol
    Protocol(String),
    /// Local failure (resources, credential files, encoder)
    Internal(String),
    /// `max_connections` reached
    ConnectionLimit,
    /// The session moved to another process
    HandedOver,
    /// The server is stopping
    Shutdown,
}

impl CloseReason {
    /// Whether the close was the client's or an operator's choice
    pub fn is_orderly(&self) -> bool {
        matches!(
            self,
            CloseReason::ClientDisconnected | CloseReason::HandedOver | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnected => write!(f, "client disconnected"),
            CloseReason::Authentication(msg) => write!(f, "authentication failed: {}", msg),
            CloseReason::Transport(msg) => write!(f, "transport error: {}", msg),
            CloseReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            CloseReason::Internal(msg) => write!(f, "internal error: {}", msg),
            CloseReason::ConnectionLimit => write!(f, "connection limit reached"),
            CloseReason::HandedOver => write!(f, "handed over"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

impl From<HandshakeError> for CloseReason {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Authentication(msg) => CloseReason::Authentication(msg),
            HandshakeError::Transport(io) => CloseReason::Transport(io.to_string()),
            HandshakeError::Protocol(msg) => CloseReason::Protocol(msg),
            HandshakeError::Internal(msg) => CloseReason::Internal(msg),
        }
    }
}

impl From<&ProtocolError> for CloseReason {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Io(_) | ProtocolError::Closed => CloseReason::Transport(e.to_string()),
            ProtocolError::Codec(_) | ProtocolError::Unexpected(_) => {
                CloseReason::Protocol(e.to_string())
            }
            ProtocolError::Rejected | ProtocolError::NotDetachable(_) => {
                CloseReason::Internal(e.to_string())
            }
        }
    }
}

/// Observable listener activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A connection changed state
    StateChanged {
        /// Connection
        id: ConnectionId,
        /// New state
        state: ConnectionState,
    },
    /// A SAM record was written for a connection attempt
    CredentialIssued {
        /// Connection
        id: ConnectionId,
        /// Record path
        path: PathBuf,
    },
    /// The SAM record was removed
    CredentialFreed {
        /// Connection
        id: ConnectionId,
        /// Record path
        path: PathBuf,
    },
    /// A session is serving a client
    SessionStarted {
        /// Connection
        id: ConnectionId,
        /// Authenticated user
        username: String,
        /// Client address
        peer: Option<SocketAddr>,
        /// Session geometry
        width: u32,
        /// Session geometry
        height: u32,
    },
    /// A connection finished
    Closed {
        /// Connection
        id: ConnectionId,
        /// Why
        reason: CloseReason,
    },
}
