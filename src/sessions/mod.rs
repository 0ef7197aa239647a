//! Session lifecycle.
//!
//! A session owns up to a configured number of images and expires after a
//! retention period. The [`SessionManager`] tracks sessions and image
//! ownership; cascading deletion of an expired session's images is driven
//! by the engine, which holds the per-image locks needed to do it safely.

mod manager;

pub use manager::SessionManager;
