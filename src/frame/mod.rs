//! Captured desktop frames
//!
//! A [`Frame`] is an owned BGRA pixel buffer plus the metadata the encoder
//! needs to interpret it (geometry, row stride, capture timestamp). Frames are
//! exclusively owned by whichever pipeline stage currently holds them and are
//! moved, never shared, between the capture thread and the encode thread via
//! the [`FrameQueue`].
//!
//! # Buffer reuse
//!
//! ```text
//! capture thread ──push──> FrameQueue ──wait──> encode thread
//!        ^                                           │
//!        └────────────── take_recycled <── recycle ──┘
//! ```
//!
//! Reconfiguring a frame to the size it already has keeps its allocation, so
//! in steady state the pipeline allocates nothing per frame.

mod queue;

pub use queue::{FrameQueue, QueueStats, QueueWait};

use std::fmt;
use std::time::Instant;

/// Bytes per pixel for the BGRA/BGRX layout used throughout the pipeline
pub const BYTES_PER_PIXEL: u32 = 4;

/// Frame buffer errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer could not be allocated
    #[error("failed to allocate {size} bytes for frame buffer")]
    Allocation {
        /// Requested size in bytes
        size: usize,
    },

    /// The row stride cannot hold a full row of pixels
    #[error("stride {stride} is too small for a row of {width} pixels")]
    InvalidStride {
        /// Frame width in pixels
        width: u32,
        /// Offending stride in bytes
        stride: u32,
    },

    /// The geometry does not fit in the address space
    #[error("frame geometry {width}x{height} (stride {stride}) overflows")]
    Overflow {
        /// Frame width in pixels
        width: u32,
        /// Frame height in pixels
        height: u32,
        /// Row stride in bytes
        stride: u32,
    },
}

/// Owned pixel buffer with capture metadata
pub struct Frame {
    width: u32,
    height: u32,
    stride: u32,
    timestamp: Instant,
    data: Vec<u8>,
}

impl Frame {
    /// Create an empty frame (0×0, no storage)
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            stride: 0,
            timestamp: Instant::now(),
            data: Vec::new(),
        }
    }

    /// Create a tightly packed frame filled with a single BGRA colour
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Result<Self, FrameError> {
        let mut frame = Self::new();
        let stride = width
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or(FrameError::Overflow {
                width,
                height,
                stride: u32::MAX,
            })?;
        frame.configure(width, height, stride, Instant::now())?;
        frame.fill(bgra);
        Ok(frame)
    }

    /// Record metadata and size storage to exactly `stride * height` bytes
    ///
    /// Storage is kept when the size does not change; otherwise the previous
    /// contents are discarded.
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        timestamp: Instant,
    ) -> Result<(), FrameError> {
        let min_stride = width
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or(FrameError::Overflow {
                width,
                height,
                stride,
            })?;
        if stride < min_stride {
            return Err(FrameError::InvalidStride { width, stride });
        }

        let size = (stride as usize)
            .checked_mul(height as usize)
            .ok_or(FrameError::Overflow {
                width,
                height,
                stride,
            })?;

        self.ensure_capacity(size)?;
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.timestamp = timestamp;
        Ok(())
    }

    /// Guarantee the buffer is exactly `size` bytes and return it for writing
    ///
    /// A size different from the current one reallocates and zero-fills.
    pub fn ensure_capacity(&mut self, size: usize) -> Result<&mut [u8], FrameError> {
        if self.data.len() != size {
            let mut data = Vec::new();
            data.try_reserve_exact(size)
                .map_err(|_| FrameError::Allocation { size })?;
            data.resize(size, 0);
            self.data = data;
        }
        Ok(&mut self.data)
    }

    /// Read-only view of the pixel data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the pixel data
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Buffer size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the frame has no storage
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row (may include padding)
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Capture timestamp
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Overwrite the capture timestamp
    pub fn set_timestamp(&mut self, timestamp: Instant) {
        self.timestamp = timestamp;
    }

    /// Pixel bytes of row `y`, without stride padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * BYTES_PER_PIXEL as usize;
        &self.data[start..start + len]
    }

    /// Fill every pixel (not the padding) with one BGRA colour
    pub fn fill(&mut self, bgra: [u8; 4]) {
        let row_bytes = self.width as usize * BYTES_PER_PIXEL as usize;
        if self.stride == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(self.stride as usize) {
            for pixel in row[..row_bytes].chunks_exact_mut(4) {
                pixel.copy_from_slice(&bgra);
            }
        }
    }

    /// Same width, height and stride as `other`
    pub fn same_layout(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.stride == other.stride
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_sizes_storage() {
        let mut frame = Frame::new();
        frame.configure(800, 600, 3200, Instant::now()).unwrap();
        assert_eq!(frame.len(), 3200 * 600);
        assert_eq!(frame.width(), 800);
        assert_eq!(frame.height(), 600);
        assert_eq!(frame.stride(), 3200);
    }

    #[test]
    fn test_configure_padded_stride() {
        let mut frame = Frame::new();
        frame.configure(10, 2, 48, Instant::now()).unwrap();
        assert_eq!(frame.len(), 96);
        assert_eq!(frame.row(1).len(), 40);
    }

    #[test]
    fn test_configure_rejects_short_stride() {
        let mut frame = Frame::new();
        let err = frame.configure(100, 10, 399, Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidStride {
                width: 100,
                stride: 399
            }
        ));
        assert!(frame.is_empty());
    }

    #[test]
    fn test_ensure_capacity_exact_size() {
        let mut frame = Frame::new();
        assert_eq!(frame.ensure_capacity(1024).unwrap().len(), 1024);
        assert_eq!(frame.data().len(), 1024);
    }

    #[test]
    fn test_ensure_capacity_same_size_keeps_contents() {
        let mut frame = Frame::new();
        frame.ensure_capacity(16).unwrap().fill(0xAB);
        let view = frame.ensure_capacity(16).unwrap();
        assert!(view.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_ensure_capacity_new_size_invalidates() {
        let mut frame = Frame::new();
        frame.ensure_capacity(16).unwrap().fill(0xAB);
        let view = frame.ensure_capacity(32).unwrap();
        assert_eq!(view.len(), 32);
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_solid_fill_skips_padding() {
        let mut frame = Frame::new();
        frame.configure(2, 2, 12, Instant::now()).unwrap();
        frame.fill([1, 2, 3, 4]);
        assert_eq!(&frame.data()[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(&frame.data()[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_same_layout() {
        let a = Frame::solid(4, 4, [0; 4]).unwrap();
        let b = Frame::solid(4, 4, [9; 4]).unwrap();
        let c = Frame::solid(4, 5, [0; 4]).unwrap();
        assert!(a.same_layout(&b));
        assert!(!a.same_layout(&c));
    }
}
