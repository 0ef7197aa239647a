//! Per-image mutation locks.
//!
//! Every history mutation of an image runs while holding that image's
//! [`ImageGuard`]. Mutations of different images never contend. Lock
//! entries are created on first use and evicted when the last guard or
//! waiter lets go, so the map only tracks images with activity in flight.

use crate::error::{EngineError, Result};
use crate::types::ImageId;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type ImageLock = Arc<Mutex<()>>;

/// Hands out exclusive per-image guards.
pub struct MutationCoordinator {
    locks: Arc<Mutex<HashMap<ImageId, ImageLock>>>,
    default_timeout: Option<Duration>,
}

/// Exclusive right to mutate one image's history.
pub struct ImageGuard {
    image: ImageId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    lock: ImageLock,
    locks: Arc<Mutex<HashMap<ImageId, ImageLock>>>,
}

impl ImageGuard {
    pub fn image(&self) -> ImageId {
        self.image
    }
}

impl std::fmt::Debug for ImageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGuard").field("image", &self.image).finish()
    }
}

impl Drop for ImageGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        evict_if_idle(&self.locks, self.image, &self.lock);
    }
}

/// Remove the entry for `image` if nobody but `held` and the map refer to it.
fn evict_if_idle(
    locks: &Mutex<HashMap<ImageId, ImageLock>>,
    image: ImageId,
    held: &ImageLock,
) {
    let mut map = locks.lock();
    if let Some(entry) = map.get(&image) {
        // One reference in the map, one held by the caller.
        if Arc::ptr_eq(entry, held) && Arc::strong_count(entry) == 2 {
            map.remove(&image);
        }
    }
}

impl MutationCoordinator {
    /// `default_timeout` bounds how long [`lock`](Self::lock) waits;
    /// `None` waits indefinitely.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Acquire the guard for `image`, waiting up to the default timeout.
    pub fn lock(&self, image: ImageId) -> Result<ImageGuard> {
        match self.default_timeout {
            Some(timeout) => self.lock_timeout(image, timeout),
            None => {
                let lock = self.entry(image);
                let guard = lock.lock_arc();
                Ok(self.guard(image, guard, lock))
            }
        }
    }

    /// Acquire the guard for `image` or fail immediately with `Busy`.
    pub fn try_lock(&self, image: ImageId) -> Result<ImageGuard> {
        let lock = self.entry(image);
        match lock.try_lock_arc() {
            Some(guard) => Ok(self.guard(image, guard, lock)),
            None => {
                evict_if_idle(&self.locks, image, &lock);
                Err(EngineError::Busy(image))
            }
        }
    }

    /// Acquire the guard for `image`, failing with `Busy` after `timeout`.
    pub fn lock_timeout(&self, image: ImageId, timeout: Duration) -> Result<ImageGuard> {
        let lock = self.entry(image);
        match lock.try_lock_arc_for(timeout) {
            Some(guard) => Ok(self.guard(image, guard, lock)),
            None => {
                evict_if_idle(&self.locks, image, &lock);
                tracing::debug!(image = %image, ?timeout, "timed out waiting for image lock");
                Err(EngineError::Busy(image))
            }
        }
    }

    /// Whether a mutation of `image` is in progress.
    pub fn is_locked(&self, image: ImageId) -> bool {
        self.locks
            .lock()
            .get(&image)
            .map(|lock| lock.is_locked())
            .unwrap_or(false)
    }

    /// Number of images with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }

    fn entry(&self, image: ImageId) -> ImageLock {
        self.locks
            .lock()
            .entry(image)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(
        &self,
        image: ImageId,
        guard: ArcMutexGuard<RawMutex, ()>,
        lock: ImageLock,
    ) -> ImageGuard {
        ImageGuard {
            image,
            guard: Some(guard),
            lock,
            locks: self.locks.clone(),
        }
    }
}
