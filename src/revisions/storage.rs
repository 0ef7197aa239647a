//! Revision storage implementation.

use crate::error::{EngineError, Result};
use crate::executor::Transformer;
use crate::types::{
    Dimensions, Hash, ImageFormat, ImageId, Pixels, Revision, RevisionKey, RevisionKind, Timestamp,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for revision files.
const REVISION_MAGIC: &[u8; 4] = b"REV\0";

/// Current revision format version.
const REVISION_VERSION: u8 = 1;

/// Outcome of a garbage collection pass.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    /// Revisions found on disk.
    pub scanned: usize,
    /// Revisions deleted.
    pub deleted: usize,
    /// Bytes reclaimed.
    pub bytes_reclaimed: u64,
    /// Revisions that were unreachable but could not be deleted.
    pub errors: Vec<(RevisionKey, String)>,
}

/// Immutable revision storage.
pub struct RevisionStorage {
    /// Base directory for revisions.
    path: PathBuf,

    /// LRU cache for recently read revisions.
    cache: Mutex<LruCache<RevisionKey, Pixels>>,

    /// Revisions written by this process that no garbage collection pass
    /// has yet seen referenced. Collection skips these, so a revision
    /// whose operation is still committing cannot be reclaimed.
    pending: Mutex<HashSet<RevisionKey>>,
}

impl RevisionStorage {
    /// Create a new revision storage at the given path.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            pending: Mutex::new(HashSet::new()),
        })
    }

    /// Persist a new revision for `image`.
    ///
    /// The returned key has never been issued before, even if the same
    /// pixels were stored earlier. The revision stays pending (invisible
    /// to garbage collection) until a collection pass finds it referenced.
    pub fn put(&self, image: ImageId, pixels: &Pixels, kind: RevisionKind) -> Result<Revision> {
        if pixels.data.is_empty() || pixels.dimensions.is_empty() {
            return Err(EngineError::InvalidFormat(format!(
                "refusing to store empty revision for image {image}"
            )));
        }

        let key = RevisionKey::generate(image, &pixels.data);
        self.pending.lock().insert(key);

        if let Err(e) = self.write_file(&key, pixels, kind) {
            self.pending.lock().remove(&key);
            return Err(e);
        }

        self.cache.lock().put(key, pixels.clone());

        tracing::debug!(
            image = %image,
            revision = %key,
            bytes = pixels.data.len(),
            kind = ?kind,
            "stored revision"
        );

        Ok(Revision {
            key,
            kind,
            content_hash: Hash::from_bytes(&pixels.data),
            byte_size: pixels.data.len() as u64,
            dimensions: pixels.dimensions,
            format: pixels.format,
            created: Timestamp::now(),
        })
    }

    /// Render and store a thumbnail of `revision`.
    pub fn derived_thumbnail(
        &self,
        image: ImageId,
        revision: &Revision,
        transformer: &dyn Transformer,
        max_edge: u32,
    ) -> Result<Revision> {
        let source = self.load_verified(revision)?;
        let thumb = transformer
            .thumbnail(&source, max_edge)
            .map_err(|e| EngineError::Transform {
                operation: "thumbnail",
                message: e.0,
            })?;
        if thumb.dimensions.width > max_edge || thumb.dimensions.height > max_edge {
            return Err(EngineError::Transform {
                operation: "thumbnail",
                message: format!(
                    "thumbnail {}x{} exceeds max edge {max_edge}",
                    thumb.dimensions.width, thumb.dimensions.height
                ),
            });
        }
        self.put(image, &thumb, RevisionKind::Thumbnail)
    }

    /// Delete revisions written for an operation that did not commit.
    pub fn discard(&self, keys: impl IntoIterator<Item = RevisionKey>) {
        for key in keys {
            if let Err(e) = self.delete(&key) {
                tracing::warn!(revision = %key, error = %e, "failed to discard revision");
            }
        }
    }

    /// Read the raw encoded bytes of a revision.
    pub fn get_bytes(&self, key: &RevisionKey) -> Result<Vec<u8>> {
        Ok(self.load(key)?.data)
    }

    /// Read a revision.
    pub fn load(&self, key: &RevisionKey) -> Result<Pixels> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(cached);
        }

        let path = self.revision_path(key);
        if !path.exists() {
            return Err(EngineError::RevisionNotFound(key.to_hex()));
        }

        let (_, pixels) = Self::read_file(&path)?;
        self.cache.lock().put(*key, pixels.clone());
        Ok(pixels)
    }

    /// Read a revision and check it against its recorded metadata.
    pub fn load_verified(&self, revision: &Revision) -> Result<Pixels> {
        let pixels = self.load(&revision.key)?;
        let computed = Hash::from_bytes(&pixels.data);
        if computed != revision.content_hash {
            return Err(EngineError::Corruption(format!(
                "revision {} content hash {} does not match recorded {}",
                revision.key, computed, revision.content_hash
            )));
        }
        Ok(pixels)
    }

    /// Check if a revision exists.
    pub fn exists(&self, key: &RevisionKey) -> bool {
        if self.cache.lock().contains(key) {
            return true;
        }
        self.revision_path(key).exists()
    }

    /// Delete a revision.
    pub fn delete(&self, key: &RevisionKey) -> Result<bool> {
        self.cache.lock().pop(key);
        self.pending.lock().remove(key);

        let path = self.revision_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all revision keys on disk.
    pub fn list(&self) -> Result<Vec<RevisionKey>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for revision_entry in fs::read_dir(entry.path())? {
                    let revision_entry = revision_entry?;
                    let filename = revision_entry.file_name();
                    let filename_str = filename.to_string_lossy();
                    if let Ok(key) = RevisionKey::from_hex(&filename_str) {
                        keys.push(key);
                    }
                }
            }
        }

        Ok(keys)
    }

    /// Get total size of all revision files.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for revision_entry in fs::read_dir(entry.path())? {
                    total += revision_entry?.metadata()?.len();
                }
            }
        }

        Ok(total)
    }

    /// Delete every revision that is neither in `live` nor pending.
    ///
    /// `live` may be a slightly stale snapshot: a key only stops being
    /// pending once a pass has seen it live, and a key that has stopped
    /// being referenced is never referenced again.
    pub fn garbage_collect(&self, live: &HashSet<RevisionKey>) -> Result<GcReport> {
        let mut report = GcReport::default();

        for key in self.list()? {
            report.scanned += 1;
            if live.contains(&key) {
                self.pending.lock().remove(&key);
                continue;
            }
            if self.pending.lock().contains(&key) {
                continue;
            }

            let size = fs::metadata(self.revision_path(&key))
                .map(|m| m.len())
                .unwrap_or(0);
            match self.delete(&key) {
                Ok(true) => {
                    report.deleted += 1;
                    report.bytes_reclaimed += size;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(revision = %key, error = %e, "failed to collect revision");
                    report.errors.push((key, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    fn write_file(&self, key: &RevisionKey, pixels: &Pixels, kind: RevisionKind) -> Result<()> {
        let shard_dir = self.shard_path(key);
        fs::create_dir_all(&shard_dir)?;

        let final_path = self.revision_path(key);
        let tmp_path = final_path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;

        // Header
        file.write_all(REVISION_MAGIC)?;
        file.write_all(&[REVISION_VERSION])?;
        file.write_all(&[match kind {
            RevisionKind::Full => 0u8,
            RevisionKind::Thumbnail => 1u8,
        }])?;
        file.write_all(&[pixels.format.to_byte()])?;
        file.write_all(&pixels.dimensions.width.to_le_bytes())?;
        file.write_all(&pixels.dimensions.height.to_le_bytes())?;

        // Content
        file.write_all(&(pixels.data.len() as u64).to_le_bytes())?;
        file.write_all(&pixels.data)?;

        // Checksum
        file.write_all(&crc32fast::hash(&pixels.data).to_le_bytes())?;

        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<(RevisionKind, Pixels)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REVISION_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid revision magic".into()));
        }

        let mut header = [0u8; 3];
        file.read_exact(&mut header)?;
        if header[0] != REVISION_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported revision version: {}",
                header[0]
            )));
        }
        let kind = match header[1] {
            0 => RevisionKind::Full,
            1 => RevisionKind::Thumbnail,
            other => {
                return Err(EngineError::InvalidFormat(format!(
                    "Unknown revision kind: {other}"
                )))
            }
        };
        let format = ImageFormat::from_byte(header[2]).ok_or_else(|| {
            EngineError::InvalidFormat(format!("Unknown image format byte: {}", header[2]))
        })?;

        let mut dims = [0u8; 8];
        file.read_exact(&mut dims)?;
        let width = u32::from_le_bytes([dims[0], dims[1], dims[2], dims[3]]);
        let height = u32::from_le_bytes([dims[4], dims[5], dims[6], dims[7]]);

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&data);
        if stored_checksum != computed_checksum {
            return Err(EngineError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok((
            kind,
            Pixels {
                data,
                format,
                dimensions: Dimensions::new(width, height),
            },
        ))
    }

    fn shard_path(&self, key: &RevisionKey) -> PathBuf {
        self.path.join(key.shard_prefix())
    }

    fn revision_path(&self, key: &RevisionKey) -> PathBuf {
        self.shard_path(key).join(key.to_hex())
    }
}
