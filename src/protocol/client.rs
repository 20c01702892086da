//! Client side of the framed protocol
//!
//! Used by the integration tests and by tools that drive a server without a
//! full RDP client. Plain TCP only.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::messages::{self, ClientMessage, MessageCodec, ServerMessage, UpdateAssembler};
use super::{ProtocolError, PROTOCOL_VERSION};
use crate::encoder::EncodedUpdate;
use crate::input::InputEvent;
use crate::security::NtHash;

/// Connected and authenticated client
pub struct FramedClient {
    framed: Framed<TcpStream, MessageCodec>,
    assembler: UpdateAssembler,
}

impl FramedClient {
    /// Connect and authenticate with an NT hash
    ///
    /// `width`/`height` of 0 ask for the server default.
    pub async fn connect(
        addr: SocketAddr,
        username: &str,
        nt_hash: &NtHash,
        width: u32,
        height: u32,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            framed: Framed::new(stream, MessageCodec::new()),
            assembler: UpdateAssembler::default(),
        };

        client
            .send(&ClientMessage::Hello {
                version: PROTOCOL_VERSION,
                username: username.to_string(),
                width,
                height,
            })
            .await?;

        let ServerMessage::Challenge { nonce } = client.recv().await? else {
            return Err(ProtocolError::Unexpected("expected Challenge"));
        };

        let proof = messages::compute_proof(nt_hash, &nonce, username);
        client.send(&ClientMessage::AuthResponse { proof }).await?;

        match client.recv().await? {
            ServerMessage::AuthResult { accepted: true } => {
                debug!("Authenticated to {} as '{}'", addr, username);
                Ok(client)
            }
            ServerMessage::AuthResult { accepted: false } => Err(ProtocolError::Rejected),
            _ => Err(ProtocolError::Unexpected("expected AuthResult")),
        }
    }

    /// Send one input event
    pub async fn send_input(&mut self, event: InputEvent) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Input(event)).await
    }

    /// Queue several input events and flush them in one write
    pub async fn send_input_batch(&mut self, events: &[InputEvent]) -> Result<(), ProtocolError> {
        for event in events {
            let payload = messages::encode(&ClientMessage::Input(*event))?;
            self.framed.feed(payload).await?;
        }
        self.framed.flush().await?;
        Ok(())
    }

    /// Ask for a full update
    pub async fn request_refresh(&mut self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Refresh).await
    }

    /// Ask for a new session geometry
    pub async fn request_resize(&mut self, width: u32, height: u32) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Resize { width, height }).await
    }

    /// Next screen update; `None` once the server closed the connection
    ///
    /// Split updates are reassembled before they are returned.
    pub async fn next_update(&mut self) -> Result<Option<EncodedUpdate>, ProtocolError> {
        loop {
            let message = match self.framed.next().await {
                Some(Ok(frame)) => messages::decode::<ServerMessage>(&frame)?,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            };
            if let Some(update) = self.assembler.push(message)? {
                return Ok(Some(update));
            }
        }
    }

    /// Say goodbye and close the socket
    pub async fn disconnect(mut self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Disconnect).await?;
        self.framed.close().await?;
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let payload: Bytes = messages::encode(message)?;
        self.framed.send(payload).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerMessage, ProtocolError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(messages::decode(&frame)?),
            Some(Err(e)) => Err(e.into()),
            None => Err(ProtocolError::Closed),
        }
    }
}

impl std::fmt::Debug for FramedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedClient")
            .field("peer", &self.framed.get_ref().peer_addr().ok())
            .finish()
    }
}
