//! Frame encoding
//!
//! The [`EncodingManager`] turns captured [`Frame`]s into [`EncodedUpdate`]s
//! for the protocol layer. It decides between a full and a differential
//! update using the [`DamageDetector`], and produces either raw BGRA
//! rectangles or RFX tiles compressed by a pluggable [`TileCodec`].
//!
//! # Data Flow
//!
//! ```text
//! FrameQueue ──wait──> pump thread ──encode──> EncodedUpdate ──mpsc──> session task
//!     ^                     │
//!     └────── recycle ──────┘
//! ```
//!
//! The first frame after `start`, after `set_options` and after
//! `invalidate` is always a full update.

mod codec;

pub use codec::{
    decode_lz4_tile, pack_region, tile_grid, Lz4TileCodec, TileCodec, RFX_TILE_SIZE,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::damage::{merge_regions, Damage, DamageConfig, DamageDetector, DamageRegion};
use crate::frame::{Frame, FrameQueue, QueueWait};

/// How long the pump blocks on the queue before re-checking its stop flag
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Encoding errors
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// `start` called while running
    #[error("encoder is already running")]
    AlreadyRunning,

    /// Operation requires a running encoder
    #[error("encoder is not running")]
    NotRunning,

    /// Frame geometry differs from the configured options
    #[error("frame is {frame_width}x{frame_height} but encoder expects {width}x{height}")]
    GeometryMismatch {
        /// Frame width
        frame_width: u32,
        /// Frame height
        frame_height: u32,
        /// Configured width
        width: u32,
        /// Configured height
        height: u32,
    },

    /// The tile codec failed
    #[error("tile codec error: {0}")]
    Codec(String),

    /// The pump thread could not be spawned
    #[error("failed to spawn encode thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Bitmap encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    /// Uncompressed BGRA rectangles
    Raw,
    /// 64×64 tiles through the tile codec
    Rfx,
}

impl std::fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingMode::Raw => write!(f, "raw"),
            EncodingMode::Rfx => write!(f, "rfx"),
        }
    }
}

/// Encoder configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingOptions {
    /// Desktop width in pixels
    pub width: u32,
    /// Desktop height in pixels
    pub height: u32,
    /// Bitmap encoding
    pub mode: EncodingMode,
    /// Send only changed areas when possible
    pub enable_frame_diff: bool,
}

impl EncodingOptions {
    /// Options for a desktop of the given size
    pub fn new(width: u32, height: u32, mode: EncodingMode, enable_frame_diff: bool) -> Self {
        Self {
            width,
            height,
            mode,
            enable_frame_diff,
        }
    }
}

/// Whether an update replaces the whole desktop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Every pixel is included
    Full,
    /// Only changed areas are included
    Diff,
}

/// One encoded rectangle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRect {
    /// Left edge in pixels
    pub x: u32,
    /// Top edge in pixels
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Packed BGRA (RAW) or codec output (RFX)
    pub data: Vec<u8>,
}

/// A screen update ready for the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedUpdate {
    /// Monotonic per-session sequence number
    pub sequence: u64,
    /// Desktop width the update applies to
    pub width: u32,
    /// Desktop height the update applies to
    pub height: u32,
    /// Encoding of every rect
    pub mode: EncodingMode,
    /// Full or differential
    pub kind: UpdateKind,
    /// Encoded rectangles
    pub rects: Vec<EncodedRect>,
}

impl EncodedUpdate {
    /// Total payload bytes
    pub fn payload_len(&self) -> usize {
        self.rects.iter().map(|r| r.data.len()).sum()
    }
}

/// Codec and diff state for one run of the encoder
struct FrameEncoder {
    options: EncodingOptions,
    detector: DamageDetector,
    codec: Arc<dyn TileCodec>,
}

impl FrameEncoder {
    fn new(options: EncodingOptions, codec: Arc<dyn TileCodec>, raw_tile_size: u32) -> Self {
        let tile_size = match options.mode {
            EncodingMode::Rfx => RFX_TILE_SIZE,
            EncodingMode::Raw => raw_tile_size,
        };
        Self {
            options,
            detector: DamageDetector::new(DamageConfig {
                tile_size,
                ..DamageConfig::default()
            }),
            codec,
        }
    }

    fn encode(&mut self, frame: &Frame) -> Result<Option<(UpdateKind, Vec<EncodedRect>)>, EncodeError> {
        let options = self.options;
        if frame.width() != options.width || frame.height() != options.height {
            return Err(EncodeError::GeometryMismatch {
                frame_width: frame.width(),
                frame_height: frame.height(),
                width: options.width,
                height: options.height,
            });
        }

        let damage = if options.enable_frame_diff {
            self.detector.detect(frame)
        } else {
            Damage::Full
        };

        let (kind, regions) = match damage {
            Damage::Unchanged => return Ok(None),
            Damage::Full => (UpdateKind::Full, self.full_regions(frame)),
            Damage::Partial(tiles) => {
                let regions = match options.mode {
                    EncodingMode::Raw => {
                        merge_regions(tiles, self.detector.config().merge_distance)
                    }
                    EncodingMode::Rfx => tiles,
                };
                (UpdateKind::Diff, regions)
            }
        };

        let rects = regions
            .iter()
            .map(|region| self.encode_region(frame, region))
            .collect::<Result<Vec<_>, _>>();

        match rects {
            Ok(rects) => Ok(Some((kind, rects))),
            Err(e) => {
                // The detector already holds this frame as its baseline
                self.detector.invalidate();
                Err(e)
            }
        }
    }

    fn full_regions(&self, frame: &Frame) -> Vec<DamageRegion> {
        match self.options.mode {
            EncodingMode::Raw => vec![DamageRegion::full_frame(frame.width(), frame.height())],
            EncodingMode::Rfx => tile_grid(frame.width(), frame.height()),
        }
    }

    fn encode_region(&self, frame: &Frame, region: &DamageRegion) -> Result<EncodedRect, EncodeError> {
        let pixels = pack_region(frame, region);
        let data = match self.options.mode {
            EncodingMode::Raw => pixels,
            EncodingMode::Rfx => self.codec.encode_tile(&pixels, region.width, region.height)?,
        };
        Ok(EncodedRect {
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            data,
        })
    }
}

struct EncoderState {
    options: EncodingOptions,
    raw_tile_size: u32,
    encoder: Option<FrameEncoder>,
}

struct EncoderShared {
    state: Mutex<EncoderState>,
    next_sequence: AtomicU64,
    codec: Arc<dyn TileCodec>,
}

impl EncoderShared {
    fn encode(&self, frame: &Frame) -> Result<Option<EncodedUpdate>, EncodeError> {
        let mut state = self.state.lock();
        let options = state.options;
        let encoder = state.encoder.as_mut().ok_or(EncodeError::NotRunning)?;

        let Some((kind, rects)) = encoder.encode(frame)? else {
            return Ok(None);
        };

        Ok(Some(EncodedUpdate {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            width: options.width,
            height: options.height,
            mode: options.mode,
            kind,
            rects,
        }))
    }
}

struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Encoder lifecycle, options and the optional pump thread
pub struct EncodingManager {
    shared: Arc<EncoderShared>,
    pump: Mutex<Option<PumpHandle>>,
}

impl EncodingManager {
    /// Create a stopped manager using the default tile codec
    pub fn new(options: EncodingOptions) -> Self {
        Self::with_codec(options, Arc::new(Lz4TileCodec))
    }

    /// Create a stopped manager with a specific tile codec
    pub fn with_codec(options: EncodingOptions, codec: Arc<dyn TileCodec>) -> Self {
        Self {
            shared: Arc::new(EncoderShared {
                state: Mutex::new(EncoderState {
                    options,
                    raw_tile_size: DamageConfig::default().tile_size,
                    encoder: None,
                }),
                next_sequence: AtomicU64::new(0),
                codec,
            }),
            pump: Mutex::new(None),
        }
    }

    /// Allocate codec and diff state
    pub fn start(&self) -> Result<(), EncodeError> {
        let mut state = self.shared.state.lock();
        if state.encoder.is_some() {
            return Err(EncodeError::AlreadyRunning);
        }
        let options = state.options;
        state.encoder = Some(FrameEncoder::new(
            options,
            Arc::clone(&self.shared.codec),
            state.raw_tile_size,
        ));
        info!(
            "Encoder started: {}x{} {} (frame diff {}, codec {})",
            options.width,
            options.height,
            options.mode,
            if options.enable_frame_diff { "on" } else { "off" },
            self.shared.codec.name()
        );
        Ok(())
    }

    /// Stop the pump (if any) and drop codec and diff state
    ///
    /// A pump blocked on a full update channel only exits once the receiver
    /// drains or closes it.
    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.stop.store(true, Ordering::SeqCst);
            if pump.thread.join().is_err() {
                error!("Encode thread panicked");
            }
        }

        if self.shared.state.lock().encoder.take().is_some() {
            info!(
                "Encoder stopped (next sequence {})",
                self.shared.next_sequence.load(Ordering::SeqCst)
            );
        }
    }

    /// Whether the encoder is running
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().encoder.is_some()
    }

    /// Encode one frame; `None` when nothing changed
    pub fn encode(&self, frame: &Frame) -> Result<Option<EncodedUpdate>, EncodeError> {
        self.shared.encode(frame)
    }

    /// Current options
    pub fn options(&self) -> EncodingOptions {
        self.shared.state.lock().options
    }

    /// Replace the options; the next frame is encoded in full
    pub fn set_options(&self, options: EncodingOptions) {
        let mut state = self.shared.state.lock();
        state.options = options;
        let raw_tile_size = state.raw_tile_size;
        if let Some(encoder) = state.encoder.as_mut() {
            *encoder = FrameEncoder::new(options, Arc::clone(&self.shared.codec), raw_tile_size);
        }
        debug!(
            "Encoder options set: {}x{} {}",
            options.width, options.height, options.mode
        );
    }

    /// Damage tile size used for raw diffs; takes effect on the next start
    pub fn set_raw_tile_size(&self, tile_size: u32) {
        self.shared.state.lock().raw_tile_size = tile_size.max(1);
    }

    /// Force the next frame to be encoded in full
    pub fn invalidate(&self) {
        if let Some(encoder) = self.shared.state.lock().encoder.as_mut() {
            encoder.detector.invalidate();
        }
    }

    /// Sequence number the next update will carry
    pub fn next_sequence(&self) -> u64 {
        self.shared.next_sequence.load(Ordering::SeqCst)
    }

    /// Continue numbering from `sequence` (session handover)
    pub fn set_next_sequence(&self, sequence: u64) {
        self.shared.next_sequence.store(sequence, Ordering::SeqCst);
    }

    /// Spawn the encode thread draining `queue` into `sink`
    ///
    /// The thread exits when the queue stops, the encoder stops or the sink
    /// is closed. Consumed frames are recycled into the queue.
    pub fn spawn_pump(
        &self,
        queue: Arc<FrameQueue>,
        sink: mpsc::Sender<EncodedUpdate>,
    ) -> Result<(), EncodeError> {
        if !self.is_running() {
            return Err(EncodeError::NotRunning);
        }

        let mut pump = self.pump.lock();
        if let Some(existing) = pump.as_ref() {
            if !existing.thread.is_finished() {
                return Err(EncodeError::AlreadyRunning);
            }
        }
        if let Some(finished) = pump.take() {
            let _ = finished.thread.join();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("frame-encode".into())
                .spawn(move || run_pump(shared, queue, sink, stop))
                .map_err(EncodeError::Thread)?
        };

        *pump = Some(PumpHandle { stop, thread });
        Ok(())
    }
}

impl Drop for EncodingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pump(
    shared: Arc<EncoderShared>,
    queue: Arc<FrameQueue>,
    sink: mpsc::Sender<EncodedUpdate>,
    stop: Arc<AtomicBool>,
) {
    debug!("Encode pump started");

    while !stop.load(Ordering::SeqCst) {
        let frame = match queue.wait(PUMP_POLL_INTERVAL) {
            QueueWait::Frame(frame) => frame,
            QueueWait::NoData => continue,
            QueueWait::Stopped => break,
        };

        let result = shared.encode(&frame);
        queue.recycle(frame);

        match result {
            Ok(Some(update)) => {
                trace!(
                    "Encoded update #{} ({:?}, {} rects, {} bytes)",
                    update.sequence,
                    update.kind,
                    update.rects.len(),
                    update.payload_len()
                );
                if sink.blocking_send(update).is_err() {
                    debug!("Update channel closed");
                    break;
                }
            }
            Ok(None) => {}
            Err(EncodeError::NotRunning) => break,
            Err(e @ EncodeError::GeometryMismatch { .. }) => debug!("Skipping frame: {}", e),
            Err(e) => warn!("Frame encode failed: {}", e),
        }
    }

    debug!("Encode pump exited");
}
