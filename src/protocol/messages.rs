//! Wire messages of the framed protocol
//!
//! Every message is one frame: a 4-byte big-endian payload length followed
//! by a bincode-encoded [`ClientMessage`] or [`ServerMessage`].
//! [`MessageCodec`] only consumes complete frames, so the read buffer of a
//! connection always starts at a message boundary.
//!
//! ```text
//! client                                server
//!   │── Hello { version, user, w, h } ──>│
//!   │<──────── Challenge { nonce } ──────│
//!   │── AuthResponse { proof } ─────────>│   proof = HMAC-SHA256(nt_hash, nonce ‖ user)
//!   │<──────── AuthResult { accepted } ──│
//!   │── Input / Refresh / Resize ───────>│
//!   │<──────── Update ───────────────────│
//! ```
//!
//! An update too large for one frame is sent as a run of `UpdatePart`
//! messages closed by an `Update`, all with the same sequence number. RAW
//! rects that alone exceed a frame are cut into row bands.

use std::io;

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;
use crate::encoder::{EncodedRect, EncodedUpdate, EncodingMode, UpdateKind};
use crate::frame::BYTES_PER_PIXEL;
use crate::input::InputEvent;
use crate::security::NtHash;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest frame accepted before the handshake completes
pub const HANDSHAKE_FRAME_LEN: usize = 4 * 1024;

/// Frame header: payload length
const HEADER_LEN: usize = 4;

/// Rect data carried by one update frame
const PART_BUDGET: usize = MAX_FRAME_LEN - 64 * 1024;

/// Upper bound of the encoded rect fields besides its data
const RECT_OVERHEAD: usize = 32;

/// Challenge nonce length in bytes
pub const NONCE_LEN: usize = 32;

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Opens the handshake
    Hello {
        /// Protocol version
        version: u16,
        /// User to authenticate as
        username: String,
        /// Desired desktop width (0 = server default)
        width: u32,
        /// Desired desktop height (0 = server default)
        height: u32,
    },
    /// Answer to [`ServerMessage::Challenge`]
    AuthResponse {
        /// HMAC proof
        proof: Vec<u8>,
    },
    /// Keyboard or pointer input
    Input(InputEvent),
    /// Ask for a full update
    Refresh,
    /// Ask for a new geometry
    Resize {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
    /// Orderly close
    Disconnect,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Authentication challenge
    Challenge {
        /// Random nonce
        nonce: Vec<u8>,
    },
    /// Handshake outcome
    AuthResult {
        /// Whether the proof matched
        accepted: bool,
    },
    /// Screen update, or the last piece of a split one
    Update(EncodedUpdate),
    /// Leading piece of a split update
    UpdatePart(EncodedUpdate),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

/// Serialize a message into one frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, bincode::Error> {
    options().serialize(message).map(Bytes::from)
}

/// Deserialize one frame payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, bincode::Error> {
    options().deserialize(payload)
}

/// Borrowing mirror of [`ServerMessage`]; variant order must match
#[derive(Serialize)]
enum ServerMessageRef<'a> {
    #[allow(dead_code)]
    Challenge { nonce: &'a [u8] },
    #[allow(dead_code)]
    AuthResult { accepted: bool },
    Update(UpdateRef<'a>),
    UpdatePart(UpdateRef<'a>),
}

/// Borrowing mirror of [`EncodedUpdate`]
#[derive(Serialize)]
struct UpdateRef<'a> {
    sequence: u64,
    width: u32,
    height: u32,
    mode: EncodingMode,
    kind: UpdateKind,
    rects: Vec<RectRef<'a>>,
}

/// Borrowing mirror of [`EncodedRect`]
#[derive(Serialize)]
struct RectRef<'a> {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    data: &'a [u8],
}

impl<'a> RectRef<'a> {
    fn whole(rect: &'a EncodedRect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            data: &rect.data,
        }
    }
}

fn size_limit() -> bincode::Error {
    Box::new(bincode::ErrorKind::SizeLimit)
}

/// Cut a rect that does not fit one frame into row bands
fn split_rect(rect: &EncodedRect, mode: EncodingMode) -> Result<Vec<RectRef<'_>>, bincode::Error> {
    if rect.data.len() + RECT_OVERHEAD <= PART_BUDGET {
        return Ok(vec![RectRef::whole(rect)]);
    }

    // Only RAW data has a fixed row layout
    let row_len = rect.width as usize * BYTES_PER_PIXEL as usize;
    if mode != EncodingMode::Raw
        || row_len == 0
        || row_len + RECT_OVERHEAD > PART_BUDGET
        || rect.data.len() != row_len * rect.height as usize
    {
        return Err(size_limit());
    }

    let band_rows = (PART_BUDGET - RECT_OVERHEAD) / row_len;
    Ok(rect
        .data
        .chunks(band_rows * row_len)
        .enumerate()
        .map(|(index, band)| RectRef {
            x: rect.x,
            y: rect.y + (index * band_rows) as u32,
            width: rect.width,
            height: (band.len() / row_len) as u32,
            data: band,
        })
        .collect())
}

/// Serialize an update without cloning its payload
///
/// Returns one frame payload per part; the last one is the closing
/// [`ServerMessage::Update`].
pub fn encode_update(update: &EncodedUpdate) -> Result<Vec<Bytes>, bincode::Error> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;

    for rect in &update.rects {
        for piece in split_rect(rect, update.mode)? {
            let cost = piece.data.len() + RECT_OVERHEAD;
            if !current.is_empty() && used + cost > PART_BUDGET {
                parts.push(std::mem::take(&mut current));
                used = 0;
            }
            used += cost;
            current.push(piece);
        }
    }
    parts.push(current);

    let last = parts.len() - 1;
    parts
        .into_iter()
        .enumerate()
        .map(|(index, rects)| {
            let body = UpdateRef {
                sequence: update.sequence,
                width: update.width,
                height: update.height,
                mode: update.mode,
                kind: update.kind,
                rects,
            };
            if index == last {
                encode(&ServerMessageRef::Update(body))
            } else {
                encode(&ServerMessageRef::UpdatePart(body))
            }
        })
        .collect()
}

/// Joins `UpdatePart` messages with the `Update` that closes them
#[derive(Debug, Default)]
pub struct UpdateAssembler {
    pending: Option<EncodedUpdate>,
}

impl UpdateAssembler {
    /// Feed one server message; yields the update once it is complete
    pub fn push(&mut self, message: ServerMessage) -> Result<Option<EncodedUpdate>, ProtocolError> {
        let (part, closing) = match message {
            ServerMessage::Update(update) => (update, true),
            ServerMessage::UpdatePart(update) => (update, false),
            _ => return Err(ProtocolError::Unexpected("expected Update")),
        };

        let merged = match self.pending.take() {
            Some(mut pending) => {
                if pending.sequence != part.sequence {
                    return Err(ProtocolError::Unexpected("update part out of sequence"));
                }
                pending.rects.extend(part.rects);
                pending
            }
            None => part,
        };

        if closing {
            Ok(Some(merged))
        } else {
            self.pending = Some(merged);
            Ok(None)
        }
    }
}

/// Length-prefixed frames that are consumed only once complete
///
/// The decoder rejects frames above its current limit before buffering
/// them. Outgoing frames are always allowed up to [`MAX_FRAME_LEN`].
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_len: usize,
}

impl MessageCodec {
    /// Codec accepting frames up to [`MAX_FRAME_LEN`]
    pub fn new() -> Self {
        Self {
            max_len: MAX_FRAME_LEN,
        }
    }

    /// Codec for an unauthenticated peer
    pub fn handshake() -> Self {
        Self {
            max_len: HANDSHAKE_FRAME_LEN,
        }
    }

    /// Raise or lower the incoming frame limit, capped at [`MAX_FRAME_LEN`]
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len.min(MAX_FRAME_LEN);
    }

    /// Current incoming frame limit
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds {}", self.max_len),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", item.len()),
            ));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn mac(nt_hash: &NtHash, nonce: &[u8], username: &str) -> Option<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(nt_hash.as_bytes()).ok()?;
    mac.update(nonce);
    mac.update(username.as_bytes());
    Some(mac)
}

/// Proof a client sends for `nonce`
pub fn compute_proof(nt_hash: &NtHash, nonce: &[u8], username: &str) -> Vec<u8> {
    mac(nt_hash, nonce, username)
        .map(|mac| mac.finalize().into_bytes().to_vec())
        .unwrap_or_default()
}

/// Constant-time check of a client proof
pub fn verify_proof(nt_hash: &NtHash, nonce: &[u8], username: &str, proof: &[u8]) -> bool {
    mac(nt_hash, nonce, username).is_some_and(|mac| mac.verify_slice(proof).is_ok())
}

/// Fresh random challenge nonce
pub fn new_nonce() -> Vec<u8> {
    use rand::RngCore;
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
