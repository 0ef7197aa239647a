//! History log state machine.

use crate::coordinator::ImageGuard;
use crate::error::{EngineError, Result};
use crate::executor::AppliedRevision;
use crate::ops::Operation;
use crate::types::{EntryAction, HistoryEntry, ImageId, Revision, RevisionKey, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// Ordered log of everything applied to one image.
///
/// Sequences are contiguous from 0. Entries are never edited; undo and
/// restore only move the cursor. Every mutating method takes the image's
/// [`ImageGuard`] and refuses to run under a guard for another image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryLog {
    image: ImageId,
    entries: Vec<HistoryEntry>,
    cursor: Sequence,
}

impl HistoryLog {
    /// Start a log whose only entry is the original upload.
    pub fn start(image: ImageId, filename: &str, original: Revision, thumbnail: Revision) -> Self {
        Self {
            image,
            entries: vec![HistoryEntry {
                image,
                sequence: Sequence::ORIGINAL,
                parent: None,
                action: EntryAction::Original {
                    filename: filename.to_string(),
                },
                revision: original,
                thumbnail,
                timestamp: Timestamp::now(),
            }],
            cursor: Sequence::ORIGINAL,
        }
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    /// The entry readers currently see.
    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.cursor.0 as usize]
    }

    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    /// Highest sequence in the log.
    pub fn max_sequence(&self) -> Sequence {
        Sequence(self.entries.len() as u64 - 1)
    }

    pub fn original(&self) -> &HistoryEntry {
        &self.entries[0]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, sequence: Sequence) -> Option<&HistoryEntry> {
        self.entries.get(sequence.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > Sequence::ORIGINAL
    }

    /// Record an applied operation at `max + 1` and move the cursor to it.
    pub fn append(
        &mut self,
        guard: &ImageGuard,
        op: Operation,
        applied: AppliedRevision,
    ) -> Result<&HistoryEntry> {
        self.check_guard(guard)?;

        let sequence = self.max_sequence().next();
        self.entries.push(HistoryEntry {
            image: self.image,
            sequence,
            parent: Some(self.cursor),
            action: EntryAction::Applied(op),
            revision: applied.revision,
            thumbnail: applied.thumbnail,
            timestamp: Timestamp::now(),
        });
        self.cursor = sequence;
        Ok(self.current())
    }

    /// Step back to the entry the current one was applied on top of.
    pub fn undo(&mut self, guard: &ImageGuard) -> Result<&HistoryEntry> {
        self.check_guard(guard)?;

        let parent = self.current().parent;
        match parent {
            Some(parent) if self.can_undo() => {
                self.cursor = parent;
                Ok(self.current())
            }
            _ => Err(EngineError::NothingToUndo(self.image)),
        }
    }

    /// Point the cursor at `sequence`, keeping every later entry.
    pub fn restore_to(&mut self, guard: &ImageGuard, sequence: Sequence) -> Result<&HistoryEntry> {
        self.check_guard(guard)?;

        if self.get(sequence).is_none() {
            return Err(EngineError::SequenceNotFound {
                image: self.image,
                sequence,
            });
        }
        self.cursor = sequence;
        Ok(self.current())
    }

    /// Drop every entry but the original and return the dropped ones.
    pub fn clear(&mut self, guard: &ImageGuard) -> Result<Vec<HistoryEntry>> {
        self.check_guard(guard)?;

        let removed = self.entries.split_off(1);
        self.cursor = Sequence::ORIGINAL;
        Ok(removed)
    }

    /// Every revision (full and thumbnail) any entry references.
    pub fn referenced_keys(&self) -> impl Iterator<Item = RevisionKey> + '_ {
        self.entries
            .iter()
            .flat_map(|entry| [entry.revision.key, entry.thumbnail.key])
    }

    /// Check the structural invariants of a log read back from disk.
    pub fn verify(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(EngineError::Corruption(format!(
                "history for image {} has no entries",
                self.image
            )));
        }
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.sequence != Sequence(index as u64) || entry.image != self.image {
                return Err(EngineError::Corruption(format!(
                    "history for image {} is out of order at position {index}",
                    self.image
                )));
            }
            let parent_ok = match entry.parent {
                None => index == 0,
                Some(parent) => parent.0 < index as u64,
            };
            if !parent_ok {
                return Err(EngineError::Corruption(format!(
                    "history entry {index} of image {} has an invalid parent",
                    self.image
                )));
            }
        }
        if self.get(self.cursor).is_none() {
            return Err(EngineError::Corruption(format!(
                "history cursor {:?} of image {} is past the end",
                self.cursor, self.image
            )));
        }
        Ok(())
    }

    fn check_guard(&self, guard: &ImageGuard) -> Result<()> {
        if guard.image() != self.image {
            return Err(EngineError::LockNotHeld(self.image));
        }
        Ok(())
    }
}
