//! Per-image edit history.
//!
//! [`HistoryLog`] is the state machine: an append-only list of entries
//! indexed by sequence plus a cursor naming the entry readers see.
//! [`ImageRecord`] pairs a log with the [`Image`](crate::types::Image) it
//! drives and owns the on-disk record format.

mod log;
mod record;

pub use log::HistoryLog;
pub use record::ImageRecord;
