//! Tile codecs and pixel packing helpers

use super::EncodeError;
use crate::damage::DamageRegion;
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Side length of an RFX tile in pixels
pub const RFX_TILE_SIZE: u32 = 64;

/// Compressor for one RFX tile
///
/// Input is tightly packed BGRA, `width * height * 4` bytes. Edge tiles may
/// be smaller than [`RFX_TILE_SIZE`].
pub trait TileCodec: Send + Sync {
    /// Codec name for logs
    fn name(&self) -> &'static str;

    /// Compress one tile
    fn encode_tile(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncodeError>;
}

/// LZ4 block compression with a size prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4TileCodec;

impl TileCodec for Lz4TileCodec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode_tile(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncodeError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL as usize;
        if pixels.len() != expected {
            return Err(EncodeError::Codec(format!(
                "tile {}x{} expects {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(lz4_flex::block::compress_prepend_size(pixels))
    }
}

/// Inverse of [`Lz4TileCodec::encode_tile`]
pub fn decode_lz4_tile(data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    lz4_flex::block::decompress_size_prepended(data).map_err(|e| EncodeError::Codec(e.to_string()))
}

/// Copy `region` out of `frame` as tightly packed BGRA rows
pub fn pack_region(frame: &Frame, region: &DamageRegion) -> Vec<u8> {
    let row_len = (region.width * BYTES_PER_PIXEL) as usize;
    let x_offset = (region.x * BYTES_PER_PIXEL) as usize;
    let mut out = Vec::with_capacity(row_len * region.height as usize);

    for y in region.y..region.y + region.height {
        let row = frame.row(y);
        out.extend_from_slice(&row[x_offset..x_offset + row_len]);
    }
    out
}

/// Split a frame into RFX tiles, clamped at the right and bottom edges
pub fn tile_grid(width: u32, height: u32) -> Vec<DamageRegion> {
    let mut tiles = Vec::new();
    for y in (0..height).step_by(RFX_TILE_SIZE as usize) {
        for x in (0..width).step_by(RFX_TILE_SIZE as usize) {
            tiles.push(DamageRegion::new(
                x,
                y,
                RFX_TILE_SIZE.min(width - x),
                RFX_TILE_SIZE.min(height - y),
            ));
        }
    }
    tiles
}
