//! Background expiry sweeps.

use crate::engine::Engine;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Periodically tears down expired sessions and collects unreferenced
/// revisions. The first pass runs as soon as the thread starts.
///
/// The sweeper holds only a weak reference, so it never keeps an engine
/// alive; it stops by itself once the engine is dropped.
pub struct ExpirySweeper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Start sweeping every `sweep_interval` of the engine's config.
    pub fn spawn(engine: &Arc<Engine>) -> std::io::Result<Self> {
        let interval = engine.config().sweep_interval;
        Self::spawn_with_interval(engine, interval)
    }

    pub fn spawn_with_interval(engine: &Arc<Engine>, interval: Duration) -> std::io::Result<Self> {
        let engine = Arc::downgrade(engine);
        let (shutdown, signal) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("retouch-sweeper".into())
            .spawn(move || loop {
                if !sweep_once(&engine) {
                    break;
                }
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the sweeper and wait for an in-progress pass to finish.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("expiry sweeper panicked");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Returns false once the engine is gone.
fn sweep_once(engine: &Weak<Engine>) -> bool {
    let Some(engine) = engine.upgrade() else {
        return false;
    };

    let report = engine.expiry_sweep();
    if report.images_deferred > 0 {
        tracing::warn!(
            deferred = report.images_deferred,
            "expiry sweep left images for the next pass"
        );
    }
    if let Err(e) = engine.garbage_collect() {
        tracing::error!(error = %e, "revision garbage collection failed");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ops::StaticProfiles;
    use crate::testing::{fake_image, FakeTransformer};
    use crate::types::ImageFormat;
    use tempfile::TempDir;

    #[test]
    fn test_sweeper_removes_expired_sessions() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            session_retention: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            ..EngineConfig::at(dir.path().join("engine"))
        };
        let engine = Arc::new(
            Engine::create(
                config,
                Arc::new(FakeTransformer::new()),
                Arc::new(StaticProfiles::system_defaults()),
            )
            .unwrap(),
        );
        let session = engine.create_session().unwrap();
        engine
            .upload(&session.id, "a.png", &fake_image(ImageFormat::Png, 10, 10))
            .unwrap();

        // The first pass finds nothing; a later one at the configured
        // interval removes the session.
        let sweeper = ExpirySweeper::spawn(&engine).unwrap();
        thread::sleep(Duration::from_millis(350));
        sweeper.stop();

        assert!(engine.get_session(&session.id).is_err());
        assert_eq!(engine.stats().unwrap().image_count, 0);
    }

    #[test]
    fn test_sweeper_interval_override() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            session_retention: Duration::from_millis(100),
            ..EngineConfig::at(dir.path().join("engine"))
        };
        let engine = Arc::new(
            Engine::create(
                config,
                Arc::new(FakeTransformer::new()),
                Arc::new(StaticProfiles::system_defaults()),
            )
            .unwrap(),
        );
        let session = engine.create_session().unwrap();

        // The configured hour would never come round in this test
        let sweeper = ExpirySweeper::spawn_with_interval(&engine, Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(350));
        sweeper.stop();

        assert!(engine.get_session(&session.id).is_err());
    }

    #[test]
    fn test_sweeper_stops_when_engine_dropped() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            Engine::create(
                EngineConfig::at(dir.path().join("engine")),
                Arc::new(FakeTransformer::new()),
                Arc::new(StaticProfiles::system_defaults()),
            )
            .unwrap(),
        );
        let sweeper = ExpirySweeper::spawn_with_interval(&engine, Duration::from_millis(10)).unwrap();
        drop(engine);
        thread::sleep(Duration::from_millis(50));

        let handle = sweeper.handle.as_ref().unwrap();
        assert!(handle.is_finished());
    }
}
