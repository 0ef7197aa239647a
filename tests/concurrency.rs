//! Concurrency tests: per-image isolation, contiguous sequences under
//! load, and expiry racing in-flight edits.

use retouch::testing::{fake_image, FakeTransformer};
use retouch::{
    Engine, EngineConfig, EngineError, FlipAxis, Image, ImageFormat, Operation, Sequence,
    StaticProfiles,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn test_engine(
    dir: &TempDir,
    tweak: impl FnOnce(&mut EngineConfig),
) -> (Arc<Engine>, Arc<FakeTransformer>) {
    init_tracing();
    let mut config = EngineConfig {
        max_images_per_session: 32,
        ..EngineConfig::at(dir.path().join("engine"))
    };
    tweak(&mut config);
    let transformer = Arc::new(FakeTransformer::new());
    let engine = Engine::create(
        config,
        transformer.clone(),
        Arc::new(StaticProfiles::system_defaults()),
    )
    .unwrap();
    (Arc::new(engine), transformer)
}

fn upload(engine: &Engine, session: &retouch::SessionId) -> Image {
    engine
        .upload(session, "a.jpg", &fake_image(ImageFormat::Jpeg, 640, 480))
        .unwrap()
}

#[test]
fn test_same_image_sequences_stay_contiguous() {
    let dir = TempDir::new().unwrap();
    let (engine, _) = test_engine(&dir, |_| {});
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    const THREADS: usize = 8;
    const PER_THREAD: usize = 10;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut sequences = Vec::new();
                for j in 0..PER_THREAD {
                    let op = if (i + j) % 2 == 0 {
                        Operation::rotate(90).unwrap()
                    } else {
                        Operation::flip(FlipAxis::Horizontal)
                    };
                    sequences.push(engine.apply_operation(image.id, op).unwrap().current_sequence);
                }
                sequences
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for sequence in handle.join().unwrap() {
            assert!(seen.insert(sequence), "duplicate sequence {sequence:?}");
        }
    }

    let history = engine.get_history(image.id).unwrap();
    assert_eq!(history.len(), THREADS * PER_THREAD + 1);
    for (i, entry) in history.iter().enumerate() {
        assert_eq!(entry.sequence, Sequence(i as u64));
    }
    // Each append was made from the version current at the time
    for pair in history.windows(2) {
        assert_eq!(pair[1].parent, Some(pair[0].sequence));
    }
    assert_eq!(engine.stats().unwrap().tracked_locks, 0);
}

#[test]
fn test_different_images_do_not_block() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) = test_engine(&dir, |_| {});
    let session = engine.create_session().unwrap();
    let images: Vec<Image> = (0..4).map(|_| upload(&engine, &session.id)).collect();

    let delay = Duration::from_millis(300);
    transformer.set_delay(delay);
    let barrier = Arc::new(Barrier::new(images.len()));

    let start = Instant::now();
    let handles: Vec<_> = images
        .iter()
        .map(|image| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let id = image.id;
            thread::spawn(move || {
                barrier.wait();
                engine.apply_operation(id, Operation::rotate(180).unwrap())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    let elapsed = start.elapsed();

    // Serialized execution would take four delays
    assert!(elapsed < delay * 2, "edits were serialized: {elapsed:?}");
}

#[test]
fn test_try_variants_report_busy() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) = test_engine(&dir, |_| {});
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);
    let other = upload(&engine, &session.id);
    engine
        .apply_operation(image.id, Operation::rotate(90).unwrap())
        .unwrap();

    transformer.set_delay(Duration::from_millis(300));
    let slow = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || engine.apply_operation(id, Operation::flip(FlipAxis::Vertical)))
    };
    thread::sleep(Duration::from_millis(100));

    let err = engine
        .try_apply_operation(image.id, Operation::rotate(90).unwrap())
        .unwrap_err();
    assert!(matches!(err, EngineError::Busy(_)));
    assert!(err.is_retryable());
    assert!(matches!(engine.try_undo(image.id), Err(EngineError::Busy(_))));

    // Reads never wait for the mutation lock
    let read_start = Instant::now();
    assert_eq!(
        engine.get_image(image.id).unwrap().current_sequence,
        Sequence(1)
    );
    assert!(read_start.elapsed() < Duration::from_millis(100));

    // Another image is free
    transformer.set_delay(Duration::ZERO);
    engine
        .try_apply_operation(other.id, Operation::rotate(90).unwrap())
        .unwrap();

    let flipped = slow.join().unwrap().unwrap();
    assert_eq!(flipped.current_sequence, Sequence(2));
    engine.try_undo(image.id).unwrap();
}

#[test]
fn test_lock_timeout_reports_busy() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) =
        test_engine(&dir, |c| c.lock_timeout = Some(Duration::from_millis(50)));
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    transformer.set_delay(Duration::from_millis(400));
    let slow = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || engine.apply_operation(id, Operation::rotate(90).unwrap()))
    };
    thread::sleep(Duration::from_millis(100));

    let result = engine.apply_operation(image.id, Operation::rotate(90).unwrap());
    assert!(matches!(result, Err(EngineError::Busy(_))));

    slow.join().unwrap().unwrap();
    assert_eq!(engine.get_history(image.id).unwrap().len(), 2);
}

#[test]
fn test_readers_see_consistent_pointers() {
    let dir = TempDir::new().unwrap();
    let (engine, _) = test_engine(&dir, |_| {});
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    let writer = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || {
            for i in 0..40 {
                if i % 3 == 2 {
                    engine.undo(id).unwrap();
                } else {
                    engine
                        .apply_operation(id, Operation::rotate(90).unwrap())
                        .unwrap();
                }
            }
        })
    };

    while !writer.is_finished() {
        let current = engine.get_image(image.id).unwrap();
        // Entries are immutable once written, so a later snapshot of the
        // log describes the version `current` points at.
        let history = engine.get_history(image.id).unwrap();
        let entry = &history[current.current_sequence.0 as usize];
        assert_eq!(entry.revision.key, current.current);
        assert_eq!(entry.thumbnail.key, current.thumbnail);
        assert_eq!(entry.revision.dimensions, current.dimensions);
    }
    writer.join().unwrap();
}

#[test]
fn test_concurrent_uploads_respect_limit() {
    let dir = TempDir::new().unwrap();
    let (engine, _) = test_engine(&dir, |c| c.max_images_per_session = 5);
    let session = engine.create_session().unwrap();
    let barrier = Arc::new(Barrier::new(10));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let session = session.id.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.upload(&session, "a.png", &fake_image(ImageFormat::Png, 8, 8))
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::ImageLimitReached { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(engine.list_session_images(&session.id).unwrap().len(), 5);
    assert_eq!(engine.stats().unwrap().revision_count, 10);
}

#[test]
fn test_sweep_waits_for_in_flight_edit() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) =
        test_engine(&dir, |c| c.session_retention = Duration::from_millis(300));
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    transformer.set_delay(Duration::from_millis(500));
    let edit = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || engine.apply_operation(id, Operation::rotate(90).unwrap()))
    };

    thread::sleep(Duration::from_millis(350));
    let report = engine.expiry_sweep();

    // The edit started while the session was live and finished first
    let edited = edit.join().unwrap().unwrap();
    assert_eq!(edited.current_sequence, Sequence(1));

    assert_eq!(report.sessions_removed, vec![session.id.clone()]);
    assert_eq!(report.images_deleted, 1);
    assert!(matches!(
        engine.get_image(image.id),
        Err(EngineError::ExpiredSession(_))
    ));
    assert_eq!(engine.stats().unwrap().revision_count, 0);
}

#[test]
fn test_revoke_waits_for_in_flight_edit() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) = test_engine(&dir, |_| {});
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    transformer.set_delay(Duration::from_millis(400));
    let edit = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || engine.apply_operation(id, Operation::rotate(90).unwrap()))
    };
    thread::sleep(Duration::from_millis(100));

    // No lock timeout: revoke blocks until the edit is done, then deletes
    let deleted = engine.revoke_session(&session.id).unwrap();
    assert_eq!(deleted, vec![image.id]);
    assert_eq!(edit.join().unwrap().unwrap().current_sequence, Sequence(1));

    assert!(engine.get_session(&session.id).is_err());
    assert!(matches!(
        engine.get_image(image.id),
        Err(EngineError::ExpiredSession(_))
    ));
    assert_eq!(engine.stats().unwrap().revision_count, 0);
}

#[test]
fn test_revoke_defers_image_on_lock_timeout() {
    let dir = TempDir::new().unwrap();
    let (engine, transformer) =
        test_engine(&dir, |c| c.lock_timeout = Some(Duration::from_millis(50)));
    let session = engine.create_session().unwrap();
    let image = upload(&engine, &session.id);

    transformer.set_delay(Duration::from_millis(400));
    let edit = {
        let engine = Arc::clone(&engine);
        let id = image.id;
        thread::spawn(move || engine.apply_operation(id, Operation::rotate(90).unwrap()))
    };
    thread::sleep(Duration::from_millis(100));

    let deleted = engine.revoke_session(&session.id).unwrap();
    assert!(deleted.is_empty());
    assert!(!engine.validate_session(&session.id));
    edit.join().unwrap().unwrap();

    // The next sweep picks up what revoke left behind
    let report = engine.expiry_sweep();
    assert_eq!(report.sessions_removed, vec![session.id.clone()]);
    assert_eq!(report.images_deleted, 1);
    assert!(matches!(
        engine.get_image(image.id),
        Err(EngineError::ExpiredSession(_))
    ));
}
