//! Protocol layer seam
//!
//! The listener and sessions never parse wire data themselves. They talk to
//! a [`ProtocolLayer`], which runs the connection handshake (including
//! authentication against a provisioned [`NlaCredential`]) and yields an
//! [`RdpConnection`] carrying client events in and encoded updates out.
//!
//! [`FramedProtocol`] is the built-in implementation: length-delimited
//! bincode messages over TCP or TLS with an NT hash challenge/response.
//! [`FramedClient`] is its client side.

mod client;
mod framed;
pub mod messages;

pub use client::FramedClient;
pub use framed::{FramedConnection, FramedProtocol};

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::encoder::EncodedUpdate;
use crate::input::InputEvent;
use crate::security::NlaCredential;

/// Protocol version spoken by [`FramedProtocol`]
pub const PROTOCOL_VERSION: u16 = 1;

/// Errors on an established connection
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Socket failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A message could not be encoded or decoded
    #[error("malformed message: {0}")]
    Codec(#[from] bincode::Error),

    /// The peer sent something out of sequence
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    Closed,

    /// The server refused the credentials (client side)
    #[error("authentication rejected")]
    Rejected,

    /// The transport cannot be handed to another process
    #[error("connection cannot be detached: {0}")]
    NotDetachable(&'static str),
}

/// Handshake failures, split by who is to blame
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The client failed authentication
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Socket or TLS failure
    #[error("transport failure during handshake: {0}")]
    Transport(#[source] io::Error),

    /// The client violated the handshake sequence
    #[error("protocol violation during handshake: {0}")]
    Protocol(String),

    /// Local failure while serving the handshake
    #[error("internal error during handshake: {0}")]
    Internal(String),
}

impl From<ProtocolError> for HandshakeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => HandshakeError::Transport(io),
            ProtocolError::Closed => HandshakeError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            )),
            other => HandshakeError::Protocol(other.to_string()),
        }
    }
}

impl From<bincode::Error> for HandshakeError {
    fn from(e: bincode::Error) -> Self {
        HandshakeError::Internal(e.to_string())
    }
}

/// Something the client asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Keyboard or pointer input
    Input(InputEvent),
    /// Resend the whole desktop
    RefreshRequest,
    /// Change the session geometry
    Resize {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },
}

/// Session state that survives a handover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    /// Authenticated user
    pub username: String,
    /// Client address
    pub peer: Option<SocketAddr>,
    /// Geometry the client asked for at connect
    pub requested_size: (u32, u32),
    /// Client bytes read from the socket but not yet parsed
    pub pending_input: Vec<u8>,
}

/// A connection taken off its transport for transfer
#[derive(Debug)]
pub struct DetachedConnection {
    /// The raw socket (blocking mode unspecified)
    pub stream: std::net::TcpStream,
    /// Everything needed to rebuild the connection
    pub state: ConnectionContext,
}

/// An authenticated client connection
#[async_trait]
pub trait RdpConnection: Send {
    /// Authenticated user
    fn username(&self) -> &str;

    /// Client address
    fn peer(&self) -> Option<SocketAddr>;

    /// Geometry the client asked for at connect
    fn requested_size(&self) -> (u32, u32);

    /// Next client event; `None` on orderly disconnect
    ///
    /// Cancel safe: dropping the future loses no data.
    async fn next_event(&mut self) -> Result<Option<ClientEvent>, ProtocolError>;

    /// Send one screen update and flush it
    async fn send_update(&mut self, update: &EncodedUpdate) -> Result<(), ProtocolError>;

    /// Whether [`detach`](Self::detach) can succeed
    fn can_detach(&self) -> bool;

    /// Take the socket and unparsed bytes out of the connection
    ///
    /// On error the connection is handed back unchanged.
    fn detach(self: Box<Self>) -> Result<DetachedConnection, (Box<dyn RdpConnection>, ProtocolError)>;
}

/// Wire protocol implementation
#[async_trait]
pub trait ProtocolLayer: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Run the handshake on a fresh transport
    ///
    /// The client must prove knowledge of the hash stored in `credential`.
    async fn accept(
        &self,
        transport: Transport,
        peer: SocketAddr,
        credential: &NlaCredential,
    ) -> Result<Box<dyn RdpConnection>, HandshakeError>;

    /// Rebuild a connection from a detached socket and its state
    fn adopt(
        &self,
        stream: std::net::TcpStream,
        state: ConnectionContext,
    ) -> Result<Box<dyn RdpConnection>, ProtocolError>;
}

/// A client socket, optionally wrapped in TLS
pub enum Transport {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Whether the stream is TLS wrapped
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            Transport::Tls(_) => f.write_str("Transport::Tls"),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
