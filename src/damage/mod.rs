//! Frame differencing
//!
//! Tile-based comparison of the current frame against the last transmitted
//! one, so the encoder only ships what changed.
//!
//! # Architecture
//!
//! ```text
//! Current Frame → Tile Grid (64×64) → Row memcmp vs Previous → Dirty Tiles → Damage
//! ```
//!
//! # Algorithm
//!
//! 1. Divide the frame into a tile grid (default 64×64 pixels)
//! 2. Compare each tile row by row against the stored previous frame
//! 3. Mark a tile dirty if any of its pixel bytes differ
//! 4. Report the dirty tiles; callers that want fewer, larger rectangles
//!    run [`merge_regions`] over them
//!
//! Comparison is exact. A diff is only ever computed between frames with
//! identical width, height and stride; anything else is reported as
//! [`Damage::Full`].

use std::time::Instant;

use crate::frame::{Frame, BYTES_PER_PIXEL};

// =============================================================================
// Types
// =============================================================================

/// A rectangular region of the screen that has changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DamageRegion {
    /// X coordinate of the region (pixels from left)
    pub x: u32,
    /// Y coordinate of the region (pixels from top)
    pub y: u32,
    /// Width of the region in pixels
    pub width: u32,
    /// Height of the region in pixels
    pub height: u32,
}

impl DamageRegion {
    /// Create a new damage region
    #[inline]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a region covering the entire frame
    #[inline]
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Area of this region in pixels
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bounding box of two regions
    pub fn union(&self, other: &DamageRegion) -> DamageRegion {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        DamageRegion::new(x, y, right - x, bottom - y)
    }

    /// Whether both the horizontal and vertical gap to `other` are at most
    /// `merge_distance` pixels
    pub fn is_adjacent(&self, other: &DamageRegion, merge_distance: u32) -> bool {
        let gap = |a_start: u32, a_len: u32, b_start: u32, b_len: u32| {
            let (a_end, b_end) = (a_start + a_len, b_start + b_len);
            if b_start >= a_end {
                b_start - a_end
            } else if a_start >= b_end {
                a_start - b_end
            } else {
                0
            }
        };

        gap(self.x, self.width, other.x, other.width) <= merge_distance
            && gap(self.y, self.height, other.y, other.height) <= merge_distance
    }
}

/// What changed between two frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Damage {
    /// Nothing to diff against (first frame, invalidation, layout change)
    Full,
    /// Dirty tiles, in row-major order, clamped to the frame
    Partial(Vec<DamageRegion>),
    /// Identical to the previous frame
    Unchanged,
}

/// Configuration for damage detection
#[derive(Debug, Clone)]
pub struct DamageConfig {
    /// Size of each comparison tile in pixels (default: 64)
    pub tile_size: u32,

    /// Distance in pixels for merging adjacent dirty tiles (default: 32)
    pub merge_distance: u32,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            tile_size: 64,
            merge_distance: 32,
        }
    }
}

/// Statistics about damage detection
#[derive(Debug, Clone, Default)]
pub struct DamageStats {
    /// Total frames processed
    pub frames_processed: u64,

    /// Frames identical to their predecessor
    pub frames_skipped: u64,

    /// Frames reported as full damage
    pub frames_full: u64,

    /// Frames with partial damage
    pub frames_partial: u64,

    /// Total damaged area across all frames (pixels)
    pub total_damage_area: u64,

    /// Total frame area across all frames (pixels)
    pub total_frame_area: u64,

    /// Total time spent on detection (nanoseconds)
    pub total_detection_time_ns: u64,
}

impl DamageStats {
    /// Share of frame area that did not need to be sent
    pub fn bandwidth_reduction_percent(&self) -> f32 {
        if self.total_frame_area == 0 {
            return 0.0;
        }
        let ratio = self.total_damage_area as f32 / self.total_frame_area as f32;
        (1.0 - ratio) * 100.0
    }

    /// Mean detection time in milliseconds
    pub fn avg_detection_time_ms(&self) -> f32 {
        if self.frames_processed == 0 {
            return 0.0;
        }
        (self.total_detection_time_ns as f64 / self.frames_processed as f64 / 1_000_000.0) as f32
    }
}

// =============================================================================
// Region Merging
// =============================================================================

/// Merge regions that are within `merge_distance` of each other
pub fn merge_regions(mut regions: Vec<DamageRegion>, merge_distance: u32) -> Vec<DamageRegion> {
    if regions.len() <= 1 {
        return regions;
    }

    let mut changed = true;
    while changed {
        changed = false;
        let mut merged: Vec<DamageRegion> = Vec::with_capacity(regions.len());

        for region in regions.drain(..) {
            match merged
                .iter_mut()
                .find(|m| m.is_adjacent(&region, merge_distance))
            {
                Some(existing) => {
                    *existing = existing.union(&region);
                    changed = true;
                }
                None => merged.push(region),
            }
        }

        regions = merged;
    }

    regions
}

// =============================================================================
// DamageDetector
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    width: u32,
    height: u32,
    stride: u32,
}

impl Layout {
    fn of(frame: &Frame) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            stride: frame.stride(),
        }
    }
}

/// Compares consecutive frames to find changed tiles
pub struct DamageDetector {
    config: DamageConfig,
    previous: Vec<u8>,
    layout: Option<Layout>,
    invalidated: bool,
    stats: DamageStats,
}

impl DamageDetector {
    /// Create a detector with the given configuration
    pub fn new(config: DamageConfig) -> Self {
        Self {
            config: DamageConfig {
                tile_size: config.tile_size.max(1),
                ..config
            },
            previous: Vec::new(),
            layout: None,
            invalidated: true,
            stats: DamageStats::default(),
        }
    }

    /// Create a detector with default configuration
    pub fn with_defaults() -> Self {
        Self::new(DamageConfig::default())
    }

    /// Compare `frame` with the previous one and remember it
    pub fn detect(&mut self, frame: &Frame) -> Damage {
        let start = Instant::now();
        let layout = Layout::of(frame);
        let frame_area = layout.width as u64 * layout.height as u64;

        let damage = if self.invalidated || self.layout != Some(layout) {
            self.stats.frames_full += 1;
            self.stats.total_damage_area += frame_area;
            Damage::Full
        } else {
            let tiles = self.dirty_tiles(frame, layout);
            if tiles.is_empty() {
                self.stats.frames_skipped += 1;
                Damage::Unchanged
            } else {
                self.stats.frames_partial += 1;
                self.stats.total_damage_area += tiles.iter().map(DamageRegion::area).sum::<u64>();
                Damage::Partial(tiles)
            }
        };

        if damage != Damage::Unchanged {
            self.previous.clear();
            self.previous.extend_from_slice(frame.data());
        }
        self.layout = Some(layout);
        self.invalidated = false;

        self.stats.frames_processed += 1;
        self.stats.total_frame_area += frame_area;
        self.stats.total_detection_time_ns += start.elapsed().as_nanos() as u64;

        damage
    }

    /// Force [`Damage::Full`] on the next call to [`detect`](Self::detect)
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Detection statistics
    pub fn stats(&self) -> &DamageStats {
        &self.stats
    }

    /// Current configuration
    pub fn config(&self) -> &DamageConfig {
        &self.config
    }

    /// Replace the configuration; invalidates the detector
    pub fn set_config(&mut self, config: DamageConfig) {
        *self = Self {
            stats: std::mem::take(&mut self.stats),
            ..Self::new(config)
        };
    }

    fn dirty_tiles(&self, frame: &Frame, layout: Layout) -> Vec<DamageRegion> {
        let tile = self.config.tile_size;
        let stride = layout.stride as usize;
        let current = frame.data();
        let mut dirty = Vec::new();

        for tile_y in (0..layout.height).step_by(tile as usize) {
            let tile_height = tile.min(layout.height - tile_y);

            for tile_x in (0..layout.width).step_by(tile as usize) {
                let tile_width = tile.min(layout.width - tile_x);
                let row_start = (tile_x * BYTES_PER_PIXEL) as usize;
                let row_len = (tile_width * BYTES_PER_PIXEL) as usize;

                let changed = (tile_y..tile_y + tile_height).any(|y| {
                    let offset = y as usize * stride + row_start;
                    current[offset..offset + row_len] != self.previous[offset..offset + row_len]
                });

                if changed {
                    dirty.push(DamageRegion::new(tile_x, tile_y, tile_width, tile_height));
                }
            }
        }

        dirty
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_frame_with_region(
        width: u32,
        height: u32,
        bg_color: [u8; 4],
        region: DamageRegion,
        region_color: [u8; 4],
    ) -> Frame {
        let mut frame = Frame::solid(width, height, bg_color).unwrap();
        let stride = frame.stride() as usize;
        let data = frame.data_mut();

        for y in region.y..(region.y + region.height).min(height) {
            for x in region.x..(region.x + region.width).min(width) {
                let idx = y as usize * stride + x as usize * 4;
                data[idx..idx + 4].copy_from_slice(&region_color);
            }
        }

        frame
    }

    // -------------------------------------------------------------------------
    // DamageRegion tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_damage_region_union() {
        let r1 = DamageRegion::new(0, 0, 50, 50);
        let r2 = DamageRegion::new(30, 30, 50, 50);
        assert_eq!(r1.union(&r2), DamageRegion::new(0, 0, 80, 80));
    }

    #[test]
    fn test_damage_region_is_adjacent() {
        let r1 = DamageRegion::new(0, 0, 64, 64);
        let r2 = DamageRegion::new(80, 0, 64, 64); // 16 pixels gap
        let r3 = DamageRegion::new(200, 0, 64, 64);

        assert!(r1.is_adjacent(&r2, 32));
        assert!(!r1.is_adjacent(&r2, 10));
        assert!(!r1.is_adjacent(&r3, 32));
    }

    // -------------------------------------------------------------------------
    // Region merging tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_merge_regions_adjacent() {
        let r1 = DamageRegion::new(0, 0, 64, 64);
        let r2 = DamageRegion::new(64, 0, 64, 64);

        let regions = merge_regions(vec![r1, r2], 0);
        assert_eq!(regions, vec![DamageRegion::new(0, 0, 128, 64)]);
    }

    #[test]
    fn test_merge_regions_separate() {
        let r1 = DamageRegion::new(0, 0, 64, 64);
        let r2 = DamageRegion::new(200, 200, 64, 64);
        assert_eq!(merge_regions(vec![r1, r2], 32).len(), 2);
    }

    #[test]
    fn test_merge_regions_chain() {
        let r1 = DamageRegion::new(0, 0, 64, 64);
        let r2 = DamageRegion::new(80, 0, 64, 64);
        let r3 = DamageRegion::new(160, 0, 64, 64);

        let regions = merge_regions(vec![r1, r2, r3], 32);
        assert_eq!(regions, vec![DamageRegion::new(0, 0, 224, 64)]);
    }

    // -------------------------------------------------------------------------
    // DamageDetector tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_detector_first_frame_full_damage() {
        let mut detector = DamageDetector::with_defaults();
        let frame = Frame::solid(640, 480, [0, 0, 0, 255]).unwrap();
        assert_eq!(detector.detect(&frame), Damage::Full);
    }

    #[test]
    fn test_detector_identical_frames_no_damage() {
        let mut detector = DamageDetector::with_defaults();
        let frame = Frame::solid(640, 480, [100, 100, 100, 255]).unwrap();

        detector.detect(&frame);
        assert_eq!(detector.detect(&frame), Damage::Unchanged);
    }

    #[test]
    fn test_detector_partial_change_is_tile_aligned() {
        let mut detector = DamageDetector::with_defaults();
        let frame1 = Frame::solid(256, 256, [0, 0, 0, 255]).unwrap();
        let frame2 = create_frame_with_region(
            256,
            256,
            [0, 0, 0, 255],
            DamageRegion::new(70, 10, 4, 4),
            [255, 255, 255, 255],
        );

        detector.detect(&frame1);
        assert_eq!(
            detector.detect(&frame2),
            Damage::Partial(vec![DamageRegion::new(64, 0, 64, 64)])
        );
    }

    #[test]
    fn test_detector_single_pixel_change() {
        let mut detector = DamageDetector::with_defaults();
        let frame1 = Frame::solid(128, 128, [0, 0, 0, 255]).unwrap();
        let frame2 = create_frame_with_region(
            128,
            128,
            [0, 0, 0, 255],
            DamageRegion::new(127, 127, 1, 1),
            [1, 0, 0, 255],
        );

        detector.detect(&frame1);
        assert_eq!(
            detector.detect(&frame2),
            Damage::Partial(vec![DamageRegion::new(64, 64, 64, 64)])
        );
    }

    #[test]
    fn test_detector_dimension_change_is_full() {
        let mut detector = DamageDetector::with_defaults();
        let frame1 = Frame::solid(640, 480, [100, 100, 100, 255]).unwrap();
        let frame2 = Frame::solid(800, 600, [100, 100, 100, 255]).unwrap();

        assert_eq!(detector.detect(&frame1), Damage::Full);
        assert_eq!(detector.detect(&frame2), Damage::Full);
    }

    #[test]
    fn test_detector_stride_change_is_full() {
        let mut detector = DamageDetector::with_defaults();
        let packed = Frame::solid(64, 64, [7; 4]).unwrap();
        let mut padded = Frame::new();
        padded
            .configure(64, 64, 64 * 4 + 16, Instant::now())
            .unwrap();
        padded.fill([7; 4]);

        detector.detect(&packed);
        assert_eq!(detector.detect(&padded), Damage::Full);
    }

    #[test]
    fn test_detector_ignores_stride_padding() {
        let mut detector = DamageDetector::with_defaults();
        let mut frame = Frame::new();
        frame.configure(16, 16, 16 * 4 + 8, Instant::now()).unwrap();

        detector.detect(&frame);
        // Scribble over the padding of row 3 only
        let offset = 3 * frame.stride() as usize + 16 * 4;
        frame.data_mut()[offset] = 0xFF;
        assert_eq!(detector.detect(&frame), Damage::Unchanged);
    }

    #[test]
    fn test_detector_invalidate() {
        let mut detector = DamageDetector::with_defaults();
        let frame = Frame::solid(640, 480, [100, 100, 100, 255]).unwrap();

        detector.detect(&frame);
        detector.invalidate();
        assert_eq!(detector.detect(&frame), Damage::Full);
        assert_eq!(detector.detect(&frame), Damage::Unchanged);
    }

    #[test]
    fn test_detector_stats() {
        let mut detector = DamageDetector::with_defaults();
        let frame = Frame::solid(640, 480, [0, 0, 0, 255]).unwrap();

        for _ in 0..5 {
            detector.detect(&frame);
        }

        let stats = detector.stats();
        assert_eq!(stats.frames_processed, 5);
        assert_eq!(stats.frames_full, 1);
        assert_eq!(stats.frames_skipped, 4);
        assert!(stats.bandwidth_reduction_percent() > 0.0);
    }

    #[test]
    fn test_detector_config_update_invalidates() {
        let mut detector = DamageDetector::with_defaults();
        let frame = Frame::solid(640, 480, [100, 100, 100, 255]).unwrap();

        detector.detect(&frame);
        detector.set_config(DamageConfig {
            tile_size: 128,
            merge_distance: 64,
        });
        assert_eq!(detector.detect(&frame), Damage::Full);
        assert_eq!(detector.stats().frames_processed, 2);
    }

    #[test]
    fn test_detector_odd_dimensions() {
        let mut detector = DamageDetector::with_defaults();
        let frame1 = Frame::solid(100, 100, [128, 128, 128, 255]).unwrap();
        let frame2 = create_frame_with_region(
            100,
            100,
            [128, 128, 128, 255],
            DamageRegion::new(99, 99, 1, 1),
            [0, 0, 0, 255],
        );

        detector.detect(&frame1);
        // Bottom-right tile is clamped to the frame edge
        assert_eq!(
            detector.detect(&frame2),
            Damage::Partial(vec![DamageRegion::new(64, 64, 36, 36)])
        );
    }
}
