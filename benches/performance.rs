//! Performance benchmarks for the edit-history engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use retouch::testing::{fake_image, FakeTransformer};
use retouch::{Engine, EngineConfig, FlipAxis, Image, ImageFormat, Operation, Sequence, StaticProfiles};
use std::sync::Arc;
use tempfile::TempDir;

fn create_engine(dir: &TempDir) -> Engine {
    Engine::create(
        EngineConfig {
            revision_cache_size: 1000,
            max_images_per_session: 1_000_000,
            ..EngineConfig::at(dir.path().join("engine"))
        },
        Arc::new(FakeTransformer::new()),
        Arc::new(StaticProfiles::system_defaults()),
    )
    .unwrap()
}

fn upload(engine: &Engine) -> Image {
    let session = engine.create_session().unwrap();
    engine
        .upload(&session.id, "bench.jpg", &fake_image(ImageFormat::Jpeg, 4000, 3000))
        .unwrap()
}

/// Benchmark a single edit (transform, two revision writes, record swap)
fn bench_apply(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);
    let image = upload(&engine);

    c.bench_function("apply_flip", |b| {
        b.iter(|| {
            black_box(
                engine
                    .apply_operation(image.id, Operation::flip(FlipAxis::Horizontal))
                    .unwrap(),
            );
        });
    });
}

/// Benchmark apply followed by undo
fn bench_apply_undo(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);
    let image = upload(&engine);
    let rotate = Operation::rotate(90).unwrap();

    c.bench_function("apply_undo", |b| {
        b.iter(|| {
            engine.apply_operation(image.id, rotate.clone()).unwrap();
            black_box(engine.undo(image.id).unwrap());
        });
    });
}

/// Benchmark restore with varying history lengths
fn bench_restore(c: &mut Criterion) {
    let mut group = c.benchmark_group("restore");

    for depth in [10, 100, 500] {
        group.bench_with_input(BenchmarkId::new("history_len", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            let engine = create_engine(&dir);
            let image = upload(&engine);
            for _ in 0..depth {
                engine
                    .apply_operation(image.id, Operation::flip(FlipAxis::Vertical))
                    .unwrap();
            }

            let mut target = 0u64;
            b.iter(|| {
                target = (target + 7) % (depth as u64 + 1);
                black_box(engine.restore_to_sequence(image.id, Sequence(target)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark upload (probe, normalize, original + thumbnail)
fn bench_upload(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);
    let session = engine.create_session().unwrap();
    let bytes = fake_image(ImageFormat::Png, 1920, 1080);

    c.bench_function("upload", |b| {
        b.iter(|| {
            black_box(engine.upload(&session.id, "bench.png", &bytes).unwrap());
        });
    });
}

/// Benchmark reading current bytes (cached)
fn bench_read_current(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);
    let image = upload(&engine);
    engine
        .apply_operation(image.id, Operation::compress("web"))
        .unwrap();

    c.bench_function("read_current", |b| {
        b.iter(|| {
            black_box(engine.current_bytes(image.id).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_apply,
    bench_apply_undo,
    bench_restore,
    bench_upload,
    bench_read_current,
);

criterion_main!(benches);
