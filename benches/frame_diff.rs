//! Frame Diff Benchmarks
//!
//! Measures tile comparison and the encoder's full vs differential paths
//! at common desktop resolutions.

use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lamco_x11_rdp_server::damage::{DamageConfig, DamageDetector};
use lamco_x11_rdp_server::encoder::{EncodingManager, EncodingMode, EncodingOptions};
use lamco_x11_rdp_server::frame::Frame;

const RESOLUTIONS: [(u32, u32, &str); 3] = [(640, 480, "480p"), (1280, 720, "720p"), (1920, 1080, "1080p")];

/// Gradient frame shifted by `offset`
fn gradient_frame(width: u32, height: u32, offset: u32) -> Frame {
    let mut frame = Frame::new();
    frame
        .configure(width, height, width * 4, Instant::now())
        .unwrap();
    let data = frame.data_mut();
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 4) as usize;
            data[idx] = (((x + offset) * 255) / width) as u8;
            data[idx + 1] = (((y + offset) * 255) / height) as u8;
            data[idx + 2] = 128;
            data[idx + 3] = 255;
        }
    }
    frame
}

/// Gradient frame with a white square at (`x`, `y`)
fn with_square(width: u32, height: u32, x: u32, y: u32, size: u32) -> Frame {
    let mut frame = gradient_frame(width, height, 0);
    let data = frame.data_mut();
    for row in y..(y + size).min(height) {
        for col in x..(x + size).min(width) {
            let idx = ((row * width + col) * 4) as usize;
            data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
        }
    }
    frame
}

fn bench_detect(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_diff_detect");

    for (width, height, name) in RESOLUTIONS {
        let base = gradient_frame(width, height, 0);
        let cursor = with_square(width, height, 100, 100, 32);
        group.throughput(Throughput::Elements((width * height) as u64));

        group.bench_with_input(BenchmarkId::new("unchanged", name), &base, |b, frame| {
            let mut detector = DamageDetector::new(DamageConfig::default());
            let _ = detector.detect(frame);
            b.iter(|| black_box(detector.detect(black_box(frame))))
        });

        group.bench_function(BenchmarkId::new("cursor_32x32", name), |b| {
            let mut detector = DamageDetector::new(DamageConfig::default());
            let _ = detector.detect(&base);
            b.iter(|| {
                let _ = detector.detect(&base);
                black_box(detector.detect(black_box(&cursor)))
            })
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_diff_encode");

    for (width, height, name) in RESOLUTIONS {
        let base = gradient_frame(width, height, 0);
        let window = with_square(width, height, 200, 150, 256);
        group.throughput(Throughput::Bytes(base.len() as u64));

        for mode in [EncodingMode::Raw, EncodingMode::Rfx] {
            let label = format!("{:?}", mode).to_lowercase();

            group.bench_function(BenchmarkId::new(format!("{}_full", label), name), |b| {
                let encoder = EncodingManager::new(EncodingOptions::new(width, height, mode, false));
                encoder.start().unwrap();
                b.iter(|| black_box(encoder.encode(black_box(&base)).unwrap()))
            });

            group.bench_function(BenchmarkId::new(format!("{}_diff", label), name), |b| {
                let encoder = EncodingManager::new(EncodingOptions::new(width, height, mode, true));
                encoder.start().unwrap();
                b.iter(|| {
                    let _ = encoder.encode(&base).unwrap();
                    black_box(encoder.encode(black_box(&window)).unwrap())
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_detect, bench_encode);
criterion_main!(benches);
