//! In-process change notifications.
//!
//! Every committed history change (upload, apply, undo, restore, clear,
//! delete) and every session teardown is broadcast to subscribers over a
//! bounded channel. Subscribers can narrow the stream to one session or
//! one image. A subscriber whose buffer fills up is dropped rather than
//! slowing down the mutation that produced the event.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.subscribe(SubscriptionConfig {
//!     filter: EventFilter::session(session.id.clone()),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         HistoryEvent::Applied { image, sequence, .. } => refresh(image, sequence),
//!         HistoryEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{
    DropReason, EventFilter, HistoryEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
