//! Durable image records.

use super::HistoryLog;
use crate::error::{EngineError, Result};
use crate::types::{Image, ImageId, Revision, RevisionKey, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for image record files.
const RECORD_MAGIC: &[u8; 4] = b"IMG\0";

/// Current image record format version.
const RECORD_VERSION: u8 = 1;

/// An image together with its history.
///
/// The image's pointer fields are derived from the log's cursor by
/// [`sync_pointers`](Self::sync_pointers) and never set independently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image: Image,
    pub log: HistoryLog,
}

impl ImageRecord {
    pub fn new(
        id: ImageId,
        session: SessionId,
        filename: &str,
        original: Revision,
        thumbnail: Revision,
    ) -> Self {
        let now = Timestamp::now();
        let image = Image {
            id,
            session,
            original_filename: filename.to_string(),
            original: original.key,
            current: original.key,
            thumbnail: thumbnail.key,
            current_sequence: crate::types::Sequence::ORIGINAL,
            dimensions: original.dimensions,
            format: original.format,
            byte_size: original.byte_size,
            created: now,
            modified: now,
        };
        Self {
            image,
            log: HistoryLog::start(id, filename, original, thumbnail),
        }
    }

    /// Copy the log's current entry into the image's pointer fields.
    pub fn sync_pointers(&mut self) {
        let entry = self.log.current();
        self.image.current = entry.revision.key;
        self.image.thumbnail = entry.thumbnail.key;
        self.image.current_sequence = entry.sequence;
        self.image.dimensions = entry.revision.dimensions;
        self.image.format = entry.revision.format;
        self.image.byte_size = entry.revision.byte_size;
        self.image.modified = Timestamp::now();
    }

    /// The current full revision.
    pub fn current_revision(&self) -> &Revision {
        &self.log.current().revision
    }

    pub fn referenced_keys(&self) -> impl Iterator<Item = RevisionKey> + '_ {
        self.log.referenced_keys()
    }

    pub fn path_in(dir: &Path, id: ImageId) -> PathBuf {
        dir.join(format!("{id}.rec"))
    }

    /// Write the record to `dir`, replacing any previous version atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path_in(dir, self.image.id);
        let tmp_path = path.with_extension("rec.tmp");

        let encoded = rmp_serde::to_vec_named(self)?;

        let mut file = File::create(&tmp_path)?;
        file.write_all(RECORD_MAGIC)?;
        file.write_all(&[RECORD_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Read one record file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(EngineError::InvalidFormat(format!(
                "Invalid image record magic in {}",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != RECORD_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported image record version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let record: ImageRecord = rmp_serde::from_slice(&encoded)?;
        record.log.verify()?;
        if record.log.image() != record.image.id {
            return Err(EngineError::Corruption(format!(
                "record {} carries history for image {}",
                record.image.id,
                record.log.image()
            )));
        }
        Ok(record)
    }

    /// Load every record in `dir`, skipping leftover temp files.
    pub fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("rec") => records.push(Self::load(&path)?),
                Some("tmp") => {
                    tracing::warn!(path = %path.display(), "removing interrupted record write");
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }
        Ok(records)
    }

    /// Remove the record file for `id`. Missing files are not an error.
    pub fn remove(dir: &Path, id: ImageId) -> Result<()> {
        match fs::remove_file(Self::path_in(dir, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
