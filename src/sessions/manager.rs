//! Session manager implementation.

use crate::error::{EngineError, Result};
use crate::types::{ImageId, Session, SessionId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Magic bytes for session index file.
const SESSION_INDEX_MAGIC: &[u8; 4] = b"SES\0";

/// Current session index format version.
const SESSION_INDEX_VERSION: u8 = 1;

/// Session index stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionIndex {
    /// All sessions by ID.
    sessions: HashMap<SessionId, Session>,

    /// Images owned by each session, oldest first.
    owned: HashMap<SessionId, Vec<ImageId>>,
}

/// Tracks sessions, their expiry and the images they own.
pub struct SessionManager {
    /// Path to session index file.
    path: PathBuf,

    /// In-memory index.
    index: RwLock<SessionIndex>,

    retention: Duration,
    image_limit: usize,
}

impl SessionManager {
    /// Create an empty manager.
    pub fn new(path: impl AsRef<Path>, retention: Duration, image_limit: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            index: RwLock::new(SessionIndex::default()),
            retention,
            image_limit,
        }
    }

    /// Load the manager from file, or start empty if there is none.
    pub fn load(path: impl AsRef<Path>, retention: Duration, image_limit: usize) -> Result<Self> {
        let manager = Self::new(path, retention, image_limit);
        if manager.path.exists() {
            manager.load_from_file()?;
        }
        Ok(manager)
    }

    /// Create a session with a fresh id.
    pub fn create(&self) -> Session {
        let session = self.new_session(SessionId::generate(), Timestamp::now());
        self.index
            .write()
            .sessions
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Create a session with a caller-chosen id, or extend the expiry of
    /// the existing session with that id.
    pub fn create_or_refresh(&self, id: SessionId) -> Result<(Session, bool)> {
        if id.as_str().trim().is_empty() {
            return Err(EngineError::validation("session id must not be empty"));
        }

        let now = Timestamp::now();
        let mut index = self.index.write();
        if let Some(existing) = index.sessions.get_mut(&id) {
            existing.expires = now.plus(self.retention);
            existing.last_activity = now;
            return Ok((existing.clone(), false));
        }

        let session = self.new_session(id, now);
        index.sessions.insert(session.id.clone(), session.clone());
        Ok((session, true))
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.index.read().sessions.get(id).cloned()
    }

    /// Whether the session exists and has not expired.
    pub fn validate(&self, id: &SessionId) -> bool {
        self.get(id).map(|s| !s.is_expired()).unwrap_or(false)
    }

    /// The session, if it exists and is still active.
    pub fn require_active(&self, id: &SessionId) -> Result<Session> {
        let session = self
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;
        if session.is_expired() {
            return Err(EngineError::ExpiredSession(id.clone()));
        }
        Ok(session)
    }

    /// Attach `image` to an active session, enforcing the image limit.
    ///
    /// The limit check and the attach happen under one lock, so concurrent
    /// uploads cannot overshoot the limit.
    pub fn reserve_image_slot(&self, id: &SessionId, image: ImageId) -> Result<()> {
        let now = Timestamp::now();
        let mut index = self.index.write();

        let session = index
            .sessions
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;
        if session.is_expired_at(now) {
            return Err(EngineError::ExpiredSession(id.clone()));
        }
        let limit = session.image_limit;

        let owned = index.owned.entry(id.clone()).or_default();
        if owned.len() >= limit {
            return Err(EngineError::ImageLimitReached {
                session: id.clone(),
                limit,
            });
        }
        owned.push(image);

        if let Some(session) = index.sessions.get_mut(id) {
            session.last_activity = now;
        }
        Ok(())
    }

    /// Detach `image` from its session, freeing the slot.
    pub fn release_image(&self, id: &SessionId, image: ImageId) {
        let mut index = self.index.write();
        if let Some(owned) = index.owned.get_mut(id) {
            owned.retain(|i| *i != image);
        }
    }

    /// Images owned by the session, oldest first.
    pub fn images_of(&self, id: &SessionId) -> Vec<ImageId> {
        self.index.read().owned.get(id).cloned().unwrap_or_default()
    }

    /// Sessions whose expiry is at or before `now`.
    pub fn expired(&self, now: Timestamp) -> Vec<Session> {
        self.index
            .read()
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Forget a session and its ownership list.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let mut index = self.index.write();
        index.owned.remove(id);
        index.sessions.remove(id)
    }

    /// Mark a session expired immediately, so the next sweep tears it down.
    pub fn expire_now(&self, id: &SessionId) -> Result<Session> {
        let mut index = self.index.write();
        let session = index
            .sessions
            .get_mut(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;
        session.expires = Timestamp::now();
        Ok(session.clone())
    }

    /// Replace the ownership lists with the given `(session, image,
    /// created)` triples, which come from the image records on disk.
    pub fn rebuild_ownership(&self, images: impl IntoIterator<Item = (SessionId, ImageId, Timestamp)>) {
        let mut by_session: HashMap<SessionId, Vec<(Timestamp, ImageId)>> = HashMap::new();
        for (session, image, created) in images {
            by_session.entry(session).or_default().push((created, image));
        }

        let mut index = self.index.write();
        index.owned = by_session
            .into_iter()
            .map(|(session, mut images)| {
                images.sort();
                (session, images.into_iter().map(|(_, image)| image).collect())
            })
            .collect();
    }

    /// Record activity on the session.
    pub fn touch(&self, id: &SessionId) {
        if let Some(session) = self.index.write().sessions.get_mut(id) {
            session.last_activity = Timestamp::now();
        }
    }

    pub fn count(&self) -> usize {
        self.index.read().sessions.len()
    }

    pub fn list(&self) -> Vec<Session> {
        self.index.read().sessions.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn set_expiry(&self, id: &SessionId, expires: Timestamp) {
        if let Some(session) = self.index.write().sessions.get_mut(id) {
            session.expires = expires;
        }
    }

    fn new_session(&self, id: SessionId, now: Timestamp) -> Session {
        Session {
            id,
            created: now,
            expires: now.plus(self.retention),
            last_activity: now,
            image_limit: self.image_limit,
        }
    }

    /// Save session index to file.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("bin.tmp");
        let mut file = File::create(&tmp_path)?;

        // Write magic
        file.write_all(SESSION_INDEX_MAGIC)?;

        // Write version
        file.write_all(&[SESSION_INDEX_VERSION])?;

        // Serialize index with MessagePack
        let encoded = {
            let index = self.index.read();
            rmp_serde::to_vec_named(&*index)?
        };

        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load session index from file.
    fn load_from_file(&self) -> Result<()> {
        let mut file = File::open(&self.path)?;

        // Read magic
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SESSION_INDEX_MAGIC {
            return Err(EngineError::InvalidFormat(
                "Invalid session index magic".into(),
            ));
        }

        // Read version
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SESSION_INDEX_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported session index version: {}",
                version[0]
            )));
        }

        // Read index
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let index: SessionIndex = rmp_serde::from_slice(&encoded)?;
        *self.index.write() = index;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(dir.path().join("sessions.bin"), WEEK, 2)
    }

    #[test]
    fn test_create_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let session = manager.create();
        assert_eq!(session.image_limit, 2);
        assert_eq!(session.expires, session.created.plus(WEEK));
        assert!(manager.validate(&session.id));
        assert!(!manager.validate(&SessionId::from("nope")));
    }

    #[test]
    fn test_refresh_existing_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let (first, created) = manager.create_or_refresh(SessionId::from("client-7")).unwrap();
        assert!(created);
        manager.set_expiry(&first.id, first.created.plus(Duration::from_secs(5)));

        let (again, created) = manager.create_or_refresh(SessionId::from("client-7")).unwrap();
        assert!(!created);
        assert_eq!(again.created, first.created);
        assert!(again.expires > first.created.plus(Duration::from_secs(5)));
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_image_limit() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let session = manager.create();

        manager.reserve_image_slot(&session.id, ImageId::new()).unwrap();
        let second = ImageId::new();
        manager.reserve_image_slot(&session.id, second).unwrap();

        let err = manager
            .reserve_image_slot(&session.id, ImageId::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::ImageLimitReached { limit: 2, .. }));

        manager.release_image(&session.id, second);
        manager.reserve_image_slot(&session.id, ImageId::new()).unwrap();
        assert_eq!(manager.images_of(&session.id).len(), 2);
    }

    #[test]
    fn test_expired_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let session = manager.create();
        manager.set_expiry(&session.id, Timestamp::now().minus(Duration::from_secs(1)));

        assert!(!manager.validate(&session.id));
        assert!(matches!(
            manager.require_active(&session.id),
            Err(EngineError::ExpiredSession(_))
        ));
        assert!(matches!(
            manager.reserve_image_slot(&session.id, ImageId::new()),
            Err(EngineError::ExpiredSession(_))
        ));
        assert_eq!(manager.expired(Timestamp::now()).len(), 1);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.bin");
        let image = ImageId::new();

        let id = {
            let manager = SessionManager::new(&path, WEEK, 5);
            let session = manager.create();
            manager.reserve_image_slot(&session.id, image).unwrap();
            manager.save().unwrap();
            session.id
        };

        let manager = SessionManager::load(&path, WEEK, 5).unwrap();
        assert!(manager.validate(&id));
        assert_eq!(manager.images_of(&id), vec![image]);
    }

    #[test]
    fn test_expire_now() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let session = manager.create();

        manager.expire_now(&session.id).unwrap();
        assert!(!manager.validate(&session.id));
        assert!(matches!(
            manager.expire_now(&SessionId::from("ghost")),
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_rebuild_ownership_orders_by_creation() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let session = manager.create();
        let (older, newer) = (ImageId::new(), ImageId::new());
        let now = Timestamp::now();

        manager.rebuild_ownership([
            (session.id.clone(), newer, now),
            (session.id.clone(), older, now.minus(Duration::from_secs(60))),
        ]);
        assert_eq!(manager.images_of(&session.id), vec![older, newer]);
    }

    #[test]
    fn test_remove_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let session = manager.create();
        manager.reserve_image_slot(&session.id, ImageId::new()).unwrap();

        assert!(manager.remove(&session.id).is_some());
        assert!(manager.get(&session.id).is_none());
        assert!(manager.images_of(&session.id).is_empty());
    }
}
