//! Built-in protocol: framed bincode messages with challenge/response auth

use std::net::SocketAddr;
use std::os::fd::AsFd;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use super::messages::{self, ClientMessage, MessageCodec, ServerMessage};
use super::{
    ClientEvent, ConnectionContext, DetachedConnection, HandshakeError, ProtocolError,
    ProtocolLayer, RdpConnection, Transport, PROTOCOL_VERSION,
};
use crate::encoder::EncodedUpdate;
use crate::security::{read_record, CredentialError, NlaCredential};

type MessageStream = Framed<Transport, MessageCodec>;

async fn recv<T: DeserializeOwned>(framed: &mut MessageStream) -> Result<Option<T>, ProtocolError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(Some(messages::decode(&frame)?)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

async fn send(framed: &mut MessageStream, payload: Bytes) -> Result<(), ProtocolError> {
    framed.send(payload).await?;
    Ok(())
}

/// [`ProtocolLayer`] speaking the framed message protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedProtocol;

impl FramedProtocol {
    /// Create the protocol layer
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolLayer for FramedProtocol {
    fn name(&self) -> &str {
        "framed"
    }

    async fn accept(
        &self,
        transport: Transport,
        peer: SocketAddr,
        credential: &NlaCredential,
    ) -> Result<Box<dyn RdpConnection>, HandshakeError> {
        let mut framed = Framed::new(transport, MessageCodec::handshake());

        let Some(ClientMessage::Hello {
            version,
            username,
            width,
            height,
        }) = recv::<ClientMessage>(&mut framed).await?
        else {
            return Err(HandshakeError::Protocol("expected Hello".into()));
        };

        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Protocol(format!(
                "unsupported protocol version {} (server speaks {})",
                version, PROTOCOL_VERSION
            )));
        }
        debug!("Hello from {} as '{}' ({}x{})", peer, username, width, height);

        let nonce = messages::new_nonce();
        send(
            &mut framed,
            messages::encode(&ServerMessage::Challenge {
                nonce: nonce.clone(),
            })?,
        )
        .await?;

        let Some(ClientMessage::AuthResponse { proof }) = recv::<ClientMessage>(&mut framed).await?
        else {
            return Err(HandshakeError::Protocol("expected AuthResponse".into()));
        };

        let accepted = match read_record(credential.path(), &username) {
            Ok(hash) => messages::verify_proof(&hash, &nonce, &username, &proof),
            Err(CredentialError::MalformedRecord(_)) => false,
            Err(e) => return Err(HandshakeError::Internal(e.to_string())),
        };

        send(
            &mut framed,
            messages::encode(&ServerMessage::AuthResult { accepted })?,
        )
        .await?;

        if !accepted {
            warn!("Authentication failed for '{}' from {}", username, peer);
            return Err(HandshakeError::Authentication(format!(
                "invalid credentials for '{}'",
                username
            )));
        }

        info!("'{}' authenticated from {}", credential.username(), peer);
        framed.codec_mut().set_max_len(messages::MAX_FRAME_LEN);
        Ok(Box::new(FramedConnection {
            framed,
            username: credential.username().to_string(),
            peer: Some(peer),
            requested_size: (width, height),
        }))
    }

    fn adopt(
        &self,
        stream: std::net::TcpStream,
        state: ConnectionContext,
    ) -> Result<Box<dyn RdpConnection>, ProtocolError> {
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;

        let mut parts = FramedParts::new::<Bytes>(Transport::Plain(stream), MessageCodec::new());
        parts.read_buf = BytesMut::from(state.pending_input.as_slice());

        debug!(
            "Adopted connection for '{}' ({} buffered bytes)",
            state.username,
            state.pending_input.len()
        );

        Ok(Box::new(FramedConnection {
            framed: Framed::from_parts(parts),
            username: state.username,
            peer: state.peer,
            requested_size: state.requested_size,
        }))
    }
}

/// An authenticated framed-protocol connection
pub struct FramedConnection {
    framed: MessageStream,
    username: String,
    peer: Option<SocketAddr>,
    requested_size: (u32, u32),
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("transport", self.framed.get_ref())
            .finish()
    }
}

#[async_trait]
impl RdpConnection for FramedConnection {
    fn username(&self) -> &str {
        &self.username
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn requested_size(&self) -> (u32, u32) {
        self.requested_size
    }

    async fn next_event(&mut self) -> Result<Option<ClientEvent>, ProtocolError> {
        let Some(message) = recv::<ClientMessage>(&mut self.framed).await? else {
            return Ok(None);
        };

        match message {
            ClientMessage::Input(event) => Ok(Some(ClientEvent::Input(event))),
            ClientMessage::Refresh => Ok(Some(ClientEvent::RefreshRequest)),
            ClientMessage::Resize { width, height } => {
                Ok(Some(ClientEvent::Resize { width, height }))
            }
            ClientMessage::Disconnect => Ok(None),
            ClientMessage::Hello { .. } | ClientMessage::AuthResponse { .. } => {
                Err(ProtocolError::Unexpected("handshake message on established connection"))
            }
        }
    }

    async fn send_update(&mut self, update: &EncodedUpdate) -> Result<(), ProtocolError> {
        for payload in messages::encode_update(update)? {
            self.framed.feed(payload).await?;
        }
        self.framed.flush().await?;
        Ok(())
    }

    fn can_detach(&self) -> bool {
        !self.framed.get_ref().is_tls()
    }

    fn detach(
        self: Box<Self>,
    ) -> Result<DetachedConnection, (Box<dyn RdpConnection>, ProtocolError)> {
        let cloned = match self.framed.get_ref() {
            Transport::Plain(stream) => stream
                .as_fd()
                .try_clone_to_owned()
                .map_err(ProtocolError::from),
            Transport::Tls(_) => Err(ProtocolError::NotDetachable(
                "TLS session state cannot be transferred",
            )),
        };
        let fd = match cloned {
            Ok(fd) => fd,
            Err(e) => {
                let connection: Box<dyn RdpConnection> = self;
                return Err((connection, e));
            }
        };

        let FramedConnection {
            framed,
            username,
            peer,
            requested_size,
        } = *self;
        let parts = framed.into_parts();
        let pending_input = parts.read_buf.to_vec();

        Ok(DetachedConnection {
            stream: std::net::TcpStream::from(fd),
            state: ConnectionContext {
                username,
                peer,
                requested_size,
                pending_input,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputEvent;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn frame(message: &ClientMessage) -> Vec<u8> {
        let payload = messages::encode(message).unwrap();
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&payload);
        out
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn context(pending_input: Vec<u8>) -> ConnectionContext {
        ConnectionContext {
            username: "rdp".to_string(),
            peer: None,
            requested_size: (800, 600),
            pending_input,
        }
    }

    #[tokio::test]
    async fn test_buffered_input_survives_detach_and_adopt() {
        let (mut client, server) = socket_pair().await;
        let first = frame(&ClientMessage::Input(InputEvent::pointer_move(10, 20)));
        let second = frame(&ClientMessage::Input(InputEvent::pointer_move(30, 40)));

        let mut pending = first.clone();
        pending.extend_from_slice(&second[..3]);

        let protocol = FramedProtocol::new();
        let mut connection = protocol
            .adopt(server.into_std().unwrap(), context(pending))
            .unwrap();
        assert_eq!(connection.username(), "rdp");
        assert_eq!(connection.requested_size(), (800, 600));
        assert_eq!(
            connection.next_event().await.unwrap(),
            Some(ClientEvent::Input(InputEvent::pointer_move(10, 20)))
        );

        // Only the partial header is left and it must not be consumed
        assert!(connection.can_detach());
        let detached = connection
            .detach()
            .unwrap_or_else(|(_, e)| panic!("detach failed: {e:?}"));
        assert_eq!(detached.state.pending_input, second[..3].to_vec());

        client.write_all(&second[3..]).await.unwrap();
        let mut connection = protocol.adopt(detached.stream, detached.state).unwrap();
        assert_eq!(
            connection.next_event().await.unwrap(),
            Some(ClientEvent::Input(InputEvent::pointer_move(30, 40)))
        );
    }

    #[tokio::test]
    async fn test_client_messages_map_to_events() {
        let (mut client, server) = socket_pair().await;
        let protocol = FramedProtocol::new();
        let mut connection = protocol
            .adopt(server.into_std().unwrap(), context(Vec::new()))
            .unwrap();

        let mut bytes = frame(&ClientMessage::Refresh);
        bytes.extend(frame(&ClientMessage::Resize {
            width: 1024,
            height: 768,
        }));
        bytes.extend(frame(&ClientMessage::Disconnect));
        client.write_all(&bytes).await.unwrap();

        assert_eq!(
            connection.next_event().await.unwrap(),
            Some(ClientEvent::RefreshRequest)
        );
        assert_eq!(
            connection.next_event().await.unwrap(),
            Some(ClientEvent::Resize {
                width: 1024,
                height: 768
            })
        );
        assert_eq!(connection.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handshake_message_after_auth_is_rejected() {
        let (mut client, server) = socket_pair().await;
        let mut connection = FramedProtocol::new()
            .adopt(server.into_std().unwrap(), context(Vec::new()))
            .unwrap();

        client
            .write_all(&frame(&ClientMessage::AuthResponse { proof: vec![0; 32] }))
            .await
            .unwrap();
        assert!(matches!(
            connection.next_event().await,
            Err(ProtocolError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_before_auth_is_refused() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let credential = crate::security::NlaCredentialProvisioner::new(temp_dir.path())
            .unwrap()
            .generate_from_password("rdp", "secret")
            .unwrap();

        let (mut client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        // Claims a 1 MiB Hello and never sends it
        client
            .write_all(&((1024 * 1024) as u32).to_be_bytes())
            .await
            .unwrap();

        let result = FramedProtocol::new()
            .accept(Transport::Plain(server), peer, &credential)
            .await;
        assert!(matches!(result, Err(HandshakeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_authenticated_client_receives_update() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let credential = crate::security::NlaCredentialProvisioner::new(temp_dir.path())
            .unwrap()
            .generate_from_password("rdp", "secret")
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut connection = FramedProtocol::new()
                .accept(Transport::Plain(stream), peer, &credential)
                .await
                .unwrap();
            let update = EncodedUpdate {
                sequence: 4,
                width: 2,
                height: 1,
                mode: crate::encoder::EncodingMode::Raw,
                kind: crate::encoder::UpdateKind::Full,
                rects: vec![crate::encoder::EncodedRect {
                    x: 0,
                    y: 0,
                    width: 2,
                    height: 1,
                    data: vec![7; 8],
                }],
            };
            connection.send_update(&update).await.unwrap();
            update
        });

        let hash = crate::security::hash_password("secret");
        let mut client = crate::protocol::FramedClient::connect(addr, "rdp", &hash, 0, 0)
            .await
            .unwrap();
        let received = client.next_update().await.unwrap().unwrap();
        assert_eq!(received, server.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_ends_events() {
        let (client, server) = socket_pair().await;
        let mut connection = FramedProtocol::new()
            .adopt(server.into_std().unwrap(), context(Vec::new()))
            .unwrap();
        drop(client);
        assert_eq!(connection.next_event().await.unwrap(), None);
    }
}
