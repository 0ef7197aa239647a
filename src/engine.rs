//! Main Engine struct tying all components together.

use crate::config::EngineConfig;
use crate::coordinator::{ImageGuard, MutationCoordinator};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, HistoryEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::executor::{CancelFlag, Executor, Transformer};
use crate::history::ImageRecord;
use crate::ops::{Operation, ProfileRegistry};
use crate::revisions::{GcReport, RevisionStorage};
use crate::sessions::SessionManager;
use crate::types::{
    EngineStats, HistoryEntry, Image, ImageId, RevisionKey, RevisionKind, Sequence, Session,
    SessionId, Timestamp,
};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for engine manifest.
const ENGINE_MAGIC: &[u8; 4] = b"RTC\0";

/// Current engine format version.
const ENGINE_VERSION: u8 = 1;

/// Most swept images remembered for `ExpiredSession` reporting.
const EXPIRED_IMAGE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Outcome of an expiry sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    /// Sessions torn down completely.
    pub sessions_removed: Vec<SessionId>,
    /// Images deleted across all expired sessions.
    pub images_deleted: usize,
    /// Images left for the next sweep (lock timeout or storage failure).
    pub images_deferred: usize,
    /// Swept-image tombstones forgotten after outliving the retention period.
    pub tombstones_pruned: usize,
}

#[derive(Clone, Copy)]
enum LockMode {
    Wait,
    Try,
}

/// The edit-history engine.
///
/// Provides a unified interface for:
/// - Creating and expiring sessions
/// - Uploading images into a session
/// - Applying operations, undoing and restoring versions
/// - Reading current revisions, thumbnails and history
pub struct Engine {
    /// Engine configuration.
    config: EngineConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Revision blobs and thumbnails.
    revisions: RevisionStorage,

    /// Session lifecycle.
    sessions: SessionManager,

    /// Committed image records. Entries are replaced whole, never edited,
    /// so a reader always sees pointers from a single history entry.
    records: RwLock<HashMap<ImageId, Arc<ImageRecord>>>,

    /// Images removed by session teardown, mapped to their session and
    /// removal time, so late callers get `ExpiredSession` instead of
    /// `ImageNotFound`. Bounded, and pruned one retention period after
    /// removal. Not persisted.
    expired_images: Mutex<LruCache<ImageId, (SessionId, Timestamp)>>,

    /// Per-image mutation locks.
    coordinator: MutationCoordinator,

    /// Runs operations through the transformer.
    executor: Executor,

    /// Change notifications.
    events: EventBus,
}

impl Engine {
    /// Open an existing engine or create a new one.
    pub fn open_or_create(
        config: EngineConfig,
        transformer: Arc<dyn Transformer>,
        profiles: Arc<dyn ProfileRegistry>,
    ) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config, transformer, profiles)
        } else if config.create_if_missing {
            Self::create(config, transformer, profiles)
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    /// Create a new engine.
    pub fn create(
        config: EngineConfig,
        transformer: Arc<dyn Transformer>,
        profiles: Arc<dyn ProfileRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        // Create directory structure
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("images"))?;
        fs::create_dir_all(config.path.join("revisions"))?;

        // Acquire lock
        let lock_file = Self::acquire_lock(&config.path)?;

        // Write manifest
        Self::write_manifest(&config.path)?;

        let revisions =
            RevisionStorage::new(config.path.join("revisions"), config.revision_cache_size)?;
        let sessions = SessionManager::new(
            config.path.join("sessions.bin"),
            config.session_retention,
            config.max_images_per_session,
        );
        sessions.save()?;

        tracing::info!(path = %config.path.display(), "created engine");

        Ok(Self::assemble(
            config,
            lock_file,
            revisions,
            sessions,
            HashMap::new(),
            transformer,
            profiles,
        ))
    }

    /// Open an existing engine.
    pub fn open(
        config: EngineConfig,
        transformer: Arc<dyn Transformer>,
        profiles: Arc<dyn ProfileRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        // Verify manifest
        Self::verify_manifest(&config.path)?;

        // Acquire lock
        let lock_file = Self::acquire_lock(&config.path)?;

        fs::create_dir_all(config.path.join("images"))?;
        let revisions =
            RevisionStorage::new(config.path.join("revisions"), config.revision_cache_size)?;
        let sessions = SessionManager::load(
            config.path.join("sessions.bin"),
            config.session_retention,
            config.max_images_per_session,
        )?;

        let images_dir = config.path.join("images");
        let mut records = HashMap::new();
        for record in ImageRecord::load_all(&images_dir)? {
            if sessions.get(&record.image.session).is_none() {
                // Session teardown was interrupted after the session itself
                // was forgotten; finish it.
                tracing::warn!(
                    image = %record.image.id,
                    session = %record.image.session,
                    "removing image of unknown session"
                );
                ImageRecord::remove(&images_dir, record.image.id)?;
                for key in record.referenced_keys() {
                    revisions.delete(&key)?;
                }
                continue;
            }
            records.insert(record.image.id, Arc::new(record));
        }
        sessions.rebuild_ownership(
            records
                .values()
                .map(|r| (r.image.session.clone(), r.image.id, r.image.created)),
        );

        tracing::info!(
            path = %config.path.display(),
            sessions = sessions.count(),
            images = records.len(),
            "opened engine"
        );

        Ok(Self::assemble(
            config,
            lock_file,
            revisions,
            sessions,
            records,
            transformer,
            profiles,
        ))
    }

    fn assemble(
        config: EngineConfig,
        lock_file: File,
        revisions: RevisionStorage,
        sessions: SessionManager,
        records: HashMap<ImageId, Arc<ImageRecord>>,
        transformer: Arc<dyn Transformer>,
        profiles: Arc<dyn ProfileRegistry>,
    ) -> Self {
        Self {
            coordinator: MutationCoordinator::new(config.lock_timeout),
            config,
            _lock_file: lock_file,
            revisions,
            sessions,
            records: RwLock::new(records),
            expired_images: Mutex::new(LruCache::new(EXPIRED_IMAGE_CAPACITY)),
            executor: Executor::new(transformer, profiles),
            events: EventBus::new(),
        }
    }

    // --- Session Operations ---

    /// Start a new session.
    pub fn create_session(&self) -> Result<Session> {
        let session = self.sessions.create();
        self.sessions.save()?;
        tracing::info!(session = %session.id, expires = session.expires.0, "created session");
        Ok(session)
    }

    /// Start a session with a caller-chosen id. If it already exists its
    /// expiry is pushed out by the retention period instead.
    pub fn create_session_with_id(&self, id: impl Into<SessionId>) -> Result<Session> {
        let (session, created) = self.sessions.create_or_refresh(id.into())?;
        self.sessions.save()?;
        if created {
            tracing::info!(session = %session.id, "created session");
        } else {
            tracing::debug!(session = %session.id, "refreshed session");
        }
        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))
    }

    /// Whether the session exists and has not expired.
    pub fn validate_session(&self, id: &SessionId) -> bool {
        self.sessions.validate(id)
    }

    /// End a session now, deleting every image it owns.
    ///
    /// Waits for each image's in-flight edit to finish. The wait has no
    /// bound unless `lock_timeout` is configured. Images whose lock times
    /// out or whose deletion fails are left for the next expiry sweep; the
    /// session is already expired, so nothing new can mutate them.
    pub fn revoke_session(&self, id: &SessionId) -> Result<Vec<ImageId>> {
        self.sessions.expire_now(id)?;
        let (deleted, deferred) = self.teardown_session(id, true);
        self.save_sessions();
        tracing::info!(
            session = %id,
            images_deleted = deleted.len(),
            images_deferred = deferred,
            "revoked session"
        );
        Ok(deleted)
    }

    // --- Image Operations ---

    /// Add an image to a session.
    ///
    /// The payload is probed for format and size, normalized (orientation
    /// baked in), stored as sequence 0 and given a thumbnail.
    pub fn upload(&self, session: &SessionId, filename: &str, bytes: &[u8]) -> Result<Image> {
        if bytes.is_empty() {
            return Err(EngineError::validation("upload is empty"));
        }
        if bytes.len() > self.config.max_upload_bytes {
            return Err(EngineError::validation(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.config.max_upload_bytes
            )));
        }
        self.sessions.require_active(session)?;

        let transformer = self.executor.transformer();
        let probed = transformer.probe(bytes).map_err(|e| EngineError::Transform {
            operation: "probe",
            message: e.0,
        })?;
        if !self.config.allowed_formats.contains(&probed.format) {
            return Err(EngineError::validation(format!(
                "format {} is not accepted",
                probed.format
            )));
        }
        let pixels = transformer
            .normalize(probed)
            .map_err(|e| EngineError::Transform {
                operation: "normalize",
                message: e.0,
            })?;
        if pixels.data.is_empty() || pixels.dimensions.is_empty() {
            return Err(EngineError::validation("upload decodes to an empty image"));
        }

        let id = ImageId::new();
        let guard = self.coordinator.lock(id)?;
        self.sessions.reserve_image_slot(session, id)?;

        let stored = self.revisions.put(id, &pixels, RevisionKind::Full).and_then(|original| {
            match self.revisions.derived_thumbnail(
                id,
                &original,
                transformer,
                self.config.thumbnail_max_edge,
            ) {
                Ok(thumbnail) => Ok((original, thumbnail)),
                Err(e) => {
                    self.revisions.discard([original.key]);
                    Err(e)
                }
            }
        });
        let (original, thumbnail) = match stored {
            Ok(pair) => pair,
            Err(e) => {
                self.sessions.release_image(session, id);
                return Err(e);
            }
        };

        let keys = [original.key, thumbnail.key];
        let record = ImageRecord::new(id, session.clone(), filename, original, thumbnail);
        let record = match self.commit(&guard, record, &keys) {
            Ok(record) => record,
            Err(e) => {
                self.sessions.release_image(session, id);
                return Err(e);
            }
        };
        self.save_sessions();

        tracing::info!(
            session = %session,
            image = %id,
            format = %record.image.format,
            width = record.image.dimensions.width,
            height = record.image.dimensions.height,
            bytes = record.image.byte_size,
            "uploaded image"
        );
        self.events.publish(HistoryEvent::Uploaded {
            session: session.clone(),
            image: id,
            current: record.image.current,
        });

        Ok(record.image.clone())
    }

    /// Apply an operation to the image's current revision, waiting for any
    /// in-flight mutation of the same image.
    pub fn apply_operation(&self, image: ImageId, op: Operation) -> Result<Image> {
        self.apply_inner(image, op, &CancelFlag::new(), LockMode::Wait)
    }

    /// Like [`apply_operation`](Self::apply_operation) but fails with
    /// `Busy` instead of waiting.
    pub fn try_apply_operation(&self, image: ImageId, op: Operation) -> Result<Image> {
        self.apply_inner(image, op, &CancelFlag::new(), LockMode::Try)
    }

    /// Like [`apply_operation`](Self::apply_operation), abandoning the
    /// operation without a trace if `cancel` is set before it commits.
    pub fn apply_operation_cancellable(
        &self,
        image: ImageId,
        op: Operation,
        cancel: &CancelFlag,
    ) -> Result<Image> {
        self.apply_inner(image, op, cancel, LockMode::Wait)
    }

    fn apply_inner(
        &self,
        image: ImageId,
        op: Operation,
        cancel: &CancelFlag,
        mode: LockMode,
    ) -> Result<Image> {
        let op = self.executor.resolve(op)?;
        let guard = self.acquire(image, mode)?;
        let record = self.record(image)?;
        self.require_live_session(&record)?;

        let applied = self.executor.apply(
            &self.revisions,
            image,
            record.current_revision(),
            &op,
            self.config.thumbnail_max_edge,
            cancel,
        )?;
        let keys = applied.keys();
        if cancel.is_cancelled() {
            self.revisions.discard(keys);
            return Err(EngineError::Cancelled(image));
        }

        let kind = op.kind();
        let mut next = (*record).clone();
        if let Err(e) = next.log.append(&guard, op, applied) {
            self.revisions.discard(keys);
            return Err(e);
        }
        next.sync_pointers();
        let record = self.commit(&guard, next, &keys)?;
        self.sessions.touch(&record.image.session);

        tracing::info!(
            image = %image,
            operation = %kind,
            sequence = record.image.current_sequence.0,
            current = %record.image.current,
            "applied operation"
        );
        self.events.publish(HistoryEvent::Applied {
            session: record.image.session.clone(),
            image,
            kind,
            sequence: record.image.current_sequence,
            current: record.image.current,
            thumbnail: record.image.thumbnail,
        });

        Ok(record.image.clone())
    }

    /// Whether [`undo`](Self::undo) would succeed.
    pub fn can_undo(&self, image: ImageId) -> Result<bool> {
        Ok(self.record(image)?.log.can_undo())
    }

    /// Step back to the version the current one was produced from.
    pub fn undo(&self, image: ImageId) -> Result<Image> {
        self.undo_inner(image, LockMode::Wait)
    }

    /// Like [`undo`](Self::undo) but fails with `Busy` instead of waiting.
    pub fn try_undo(&self, image: ImageId) -> Result<Image> {
        self.undo_inner(image, LockMode::Try)
    }

    fn undo_inner(&self, image: ImageId, mode: LockMode) -> Result<Image> {
        let guard = self.acquire(image, mode)?;
        let record = self.record(image)?;
        self.require_live_session(&record)?;

        let mut next = (*record).clone();
        next.log.undo(&guard)?;
        next.sync_pointers();
        let record = self.commit(&guard, next, &[])?;
        self.sessions.touch(&record.image.session);

        tracing::info!(
            image = %image,
            sequence = record.image.current_sequence.0,
            "undid operation"
        );
        self.events.publish(HistoryEvent::Undone {
            session: record.image.session.clone(),
            image,
            sequence: record.image.current_sequence,
            current: record.image.current,
            thumbnail: record.image.thumbnail,
        });

        Ok(record.image.clone())
    }

    /// Make any logged version current. Later entries are kept.
    pub fn restore_to_sequence(&self, image: ImageId, sequence: Sequence) -> Result<Image> {
        let guard = self.coordinator.lock(image)?;
        let record = self.record(image)?;
        self.require_live_session(&record)?;

        let mut next = (*record).clone();
        next.log.restore_to(&guard, sequence)?;
        next.sync_pointers();
        let record = self.commit(&guard, next, &[])?;
        self.sessions.touch(&record.image.session);

        tracing::info!(image = %image, sequence = sequence.0, "restored version");
        self.events.publish(HistoryEvent::Restored {
            session: record.image.session.clone(),
            image,
            sequence,
            current: record.image.current,
            thumbnail: record.image.thumbnail,
        });

        Ok(record.image.clone())
    }

    /// Discard every version but the original and make it current.
    pub fn clear_history(&self, image: ImageId) -> Result<Image> {
        let guard = self.coordinator.lock(image)?;
        let record = self.record(image)?;
        self.require_live_session(&record)?;

        let mut next = (*record).clone();
        let removed = next.log.clear(&guard)?;
        next.sync_pointers();
        let record = self.commit(&guard, next, &[])?;
        self.sessions.touch(&record.image.session);

        let live: HashSet<RevisionKey> = record.referenced_keys().collect();
        for key in removed
            .iter()
            .flat_map(|entry| [entry.revision.key, entry.thumbnail.key])
            .filter(|key| !live.contains(key))
        {
            if let Err(e) = self.revisions.delete(&key) {
                tracing::warn!(image = %image, revision = %key, error = %e, "failed to delete cleared revision");
            }
        }

        tracing::info!(image = %image, removed_entries = removed.len(), "cleared history");
        self.events.publish(HistoryEvent::Cleared {
            session: record.image.session.clone(),
            image,
            removed_entries: removed.len(),
        });

        Ok(record.image.clone())
    }

    /// Delete an image, its history and every revision it owns.
    pub fn delete_image(&self, image: ImageId) -> Result<()> {
        let guard = self.coordinator.lock(image)?;
        let record = self.record(image)?;

        self.remove_image(&guard, &record)?;
        self.save_sessions();

        tracing::info!(image = %image, session = %record.image.session, "deleted image");
        self.events.publish(HistoryEvent::Deleted {
            session: record.image.session.clone(),
            image,
        });
        Ok(())
    }

    // --- Read Operations ---

    pub fn get_image(&self, image: ImageId) -> Result<Image> {
        Ok(self.record(image)?.image.clone())
    }

    /// Every entry in the image's log, sequence 0 first.
    pub fn get_history(&self, image: ImageId) -> Result<Vec<HistoryEntry>> {
        Ok(self.record(image)?.log.entries().to_vec())
    }

    /// Images owned by the session, newest first.
    pub fn list_session_images(&self, session: &SessionId) -> Result<Vec<Image>> {
        self.get_session(session)?;

        let records = self.records.read();
        let mut images: Vec<Image> = self
            .sessions
            .images_of(session)
            .iter()
            .filter_map(|id| records.get(id).map(|r| r.image.clone()))
            .collect();
        images.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(images)
    }

    /// Encoded bytes of the current revision.
    pub fn current_bytes(&self, image: ImageId) -> Result<Vec<u8>> {
        let record = self.record(image)?;
        Ok(self.revisions.load_verified(record.current_revision())?.data)
    }

    /// Encoded bytes of the current thumbnail.
    pub fn thumbnail_bytes(&self, image: ImageId) -> Result<Vec<u8>> {
        let record = self.record(image)?;
        Ok(self.revisions.load_verified(&record.log.current().thumbnail)?.data)
    }

    /// Encoded bytes of the revision produced at `sequence`.
    pub fn revision_bytes(&self, image: ImageId, sequence: Sequence) -> Result<Vec<u8>> {
        let record = self.record(image)?;
        let entry = record
            .log
            .get(sequence)
            .ok_or(EngineError::SequenceNotFound { image, sequence })?;
        Ok(self.revisions.load_verified(&entry.revision)?.data)
    }

    // --- Subscriptions ---

    /// Subscribe to change notifications.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.events.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    // --- Maintenance ---

    /// Tear down every expired session and its images.
    ///
    /// Each image is deleted under its own mutation lock, so an in-flight
    /// operation on it finishes first and mutations of other images are
    /// never held up.
    pub fn expiry_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Timestamp::now();

        for session in self.sessions.expired(now) {
            let (deleted, deferred) = self.teardown_session(&session.id, false);
            report.images_deleted += deleted.len();
            report.images_deferred += deferred;
            if deferred == 0 {
                report.sessions_removed.push(session.id);
            }
        }

        report.tombstones_pruned = self.prune_expired_images(now);

        if !report.sessions_removed.is_empty() || report.images_deferred > 0 {
            self.save_sessions();
            tracing::info!(
                sessions = report.sessions_removed.len(),
                images_deleted = report.images_deleted,
                images_deferred = report.images_deferred,
                "expiry sweep finished"
            );
        }
        report
    }

    /// Forget swept images removed more than one retention period ago.
    fn prune_expired_images(&self, now: Timestamp) -> usize {
        let cutoff = now.minus(self.config.session_retention);
        let mut expired = self.expired_images.lock();
        let stale: Vec<ImageId> = expired
            .iter()
            .filter_map(|(image, (_, removed))| (*removed < cutoff).then_some(*image))
            .collect();
        for image in &stale {
            expired.pop(image);
        }
        stale.len()
    }

    /// Reclaim revisions no image history references.
    pub fn garbage_collect(&self) -> Result<GcReport> {
        let live: HashSet<RevisionKey> = self
            .records
            .read()
            .values()
            .flat_map(|record| record.referenced_keys().collect::<Vec<_>>())
            .collect();

        let report = self.revisions.garbage_collect(&live)?;
        if report.deleted > 0 {
            tracing::info!(
                scanned = report.scanned,
                deleted = report.deleted,
                bytes_reclaimed = report.bytes_reclaimed,
                "garbage collected revisions"
            );
        }
        Ok(report)
    }

    /// Get engine statistics.
    pub fn stats(&self) -> Result<EngineStats> {
        let (image_count, history_entry_count) = {
            let records = self.records.read();
            let entries: usize = records.values().map(|r| r.log.len()).sum();
            (records.len() as u64, entries as u64)
        };
        Ok(EngineStats {
            session_count: self.sessions.count() as u64,
            image_count,
            history_entry_count,
            revision_count: self.revisions.list()?.len() as u64,
            revision_bytes: self.revisions.total_size()?,
            tracked_locks: self.coordinator.tracked() as u64,
        })
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.sessions.save()
    }

    /// Get the engine path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Private Helpers ---

    fn images_dir(&self) -> PathBuf {
        self.config.path.join("images")
    }

    fn acquire(&self, image: ImageId, mode: LockMode) -> Result<ImageGuard> {
        match mode {
            LockMode::Wait => self.coordinator.lock(image),
            LockMode::Try => self.coordinator.try_lock(image),
        }
    }

    fn record(&self, image: ImageId) -> Result<Arc<ImageRecord>> {
        if let Some(record) = self.records.read().get(&image) {
            return Ok(Arc::clone(record));
        }
        if let Some((session, _)) = self.expired_images.lock().peek(&image) {
            return Err(EngineError::ExpiredSession(session.clone()));
        }
        Err(EngineError::ImageNotFound(image))
    }

    fn require_live_session(&self, record: &ImageRecord) -> Result<()> {
        match self.sessions.get(&record.image.session) {
            Some(session) if !session.is_expired() => Ok(()),
            _ => Err(EngineError::ExpiredSession(record.image.session.clone())),
        }
    }

    /// Persist `next` and make it visible. `new_keys` are the revisions
    /// written for this change; they are removed again if it fails.
    fn commit(
        &self,
        guard: &ImageGuard,
        next: ImageRecord,
        new_keys: &[RevisionKey],
    ) -> Result<Arc<ImageRecord>> {
        if guard.image() != next.image.id {
            self.revisions.discard(new_keys.iter().copied());
            return Err(EngineError::LockNotHeld(next.image.id));
        }
        if let Err(e) = next.save(&self.images_dir()) {
            self.revisions.discard(new_keys.iter().copied());
            return Err(e);
        }

        let next = Arc::new(next);
        self.records.write().insert(next.image.id, Arc::clone(&next));
        Ok(next)
    }

    /// Remove an image record and its revisions. Requires the image's guard.
    fn remove_image(&self, guard: &ImageGuard, record: &ImageRecord) -> Result<()> {
        let id = record.image.id;
        if guard.image() != id {
            return Err(EngineError::LockNotHeld(id));
        }

        ImageRecord::remove(&self.images_dir(), id)?;
        self.records.write().remove(&id);
        self.sessions.release_image(&record.image.session, id);

        for key in record.referenced_keys() {
            if let Err(e) = self.revisions.delete(&key) {
                tracing::warn!(image = %id, revision = %key, error = %e, "failed to delete revision");
            }
        }
        Ok(())
    }

    /// Delete every image of an expired session, then the session itself.
    /// Returns the deleted images and how many were left behind.
    fn teardown_session(&self, id: &SessionId, revoked: bool) -> (Vec<ImageId>, usize) {
        let mut deleted = Vec::new();
        let mut deferred = 0;

        for image in self.sessions.images_of(id) {
            let guard = match self.coordinator.lock(image) {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::warn!(session = %id, image = %image, error = %e, "deferring image deletion");
                    deferred += 1;
                    continue;
                }
            };
            let record = match self.records.read().get(&image) {
                Some(record) => Arc::clone(record),
                None => {
                    self.sessions.release_image(id, image);
                    continue;
                }
            };
            match self.remove_image(&guard, &record) {
                Ok(()) => {
                    self.expired_images
                        .lock()
                        .put(image, (id.clone(), Timestamp::now()));
                    self.events.publish(HistoryEvent::Deleted {
                        session: id.clone(),
                        image,
                    });
                    deleted.push(image);
                }
                Err(e) => {
                    tracing::warn!(session = %id, image = %image, error = %e, "failed to delete image");
                    deferred += 1;
                }
            }
        }

        if deferred == 0 {
            self.sessions.remove(id);
            let event = if revoked {
                HistoryEvent::SessionRevoked {
                    session: id.clone(),
                    images: deleted.clone(),
                }
            } else {
                HistoryEvent::SessionExpired {
                    session: id.clone(),
                    images: deleted.clone(),
                }
            };
            self.events.publish(event);
        }
        (deleted, deferred)
    }

    fn save_sessions(&self) {
        if let Err(e) = self.sessions.save() {
            tracing::warn!(error = %e, "failed to save session index");
        }
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(ENGINE_MAGIC)?;
        file.write_all(&[ENGINE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(EngineError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENGINE_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid engine magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ENGINE_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported engine version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
        self.events.close();
    }
}
