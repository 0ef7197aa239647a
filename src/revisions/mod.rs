//! Revision storage.
//!
//! Every stored artifact (full image or thumbnail) is an immutable file
//! named by its [`RevisionKey`](crate::types::RevisionKey), sharded into
//! directories by the first byte of the key. Files are written to a
//! temporary name and renamed into place, so a reader never sees a
//! partial revision.

mod storage;

pub use storage::{GcReport, RevisionStorage};
