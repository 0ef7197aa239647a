//! # Retouch
//!
//! A versioned, undoable edit history for images owned by short-lived
//! sessions.
//!
//! ## Core Concepts
//!
//! - **Sessions**: Anonymous owners with an expiry; everything they own is
//!   deleted when they expire
//! - **Revisions**: Immutable stored renditions of an image, each with its
//!   own thumbnail
//! - **History**: Per-image log of every version; undo follows the link to
//!   the version an edit was made from, restore jumps to any of them
//! - **Operations**: A closed set of edits (resize, rotate, flip, compress,
//!   background removal, AI edits) executed by a pluggable [`Transformer`]
//!
//! ## Example
//!
//! ```ignore
//! use retouch::{Engine, EngineConfig, Operation, StaticProfiles};
//!
//! let engine = Engine::open_or_create(
//!     EngineConfig::at("./storage"),
//!     Arc::new(MyTransformer::new()),
//!     Arc::new(StaticProfiles::system_defaults()),
//! )?;
//!
//! let session = engine.create_session()?;
//! let image = engine.upload(&session.id, "cat.jpg", &bytes)?;
//!
//! engine.apply_operation(image.id, Operation::rotate(90)?)?;
//! engine.apply_operation(image.id, Operation::compress("web"))?;
//!
//! // Back to the rotated version
//! engine.undo(image.id)?;
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod ops;
pub mod revisions;
pub mod sessions;
pub mod sweeper;
#[doc(hidden)]
pub mod testing;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use coordinator::{ImageGuard, MutationCoordinator};
pub use engine::{Engine, SweepReport};
pub use error::{EngineError, Result};
pub use events::{
    DropReason, EventBus, EventFilter, HistoryEvent, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
pub use executor::{
    AppliedRevision, CancelFlag, Executor, TransformFailure, TransformResult, Transformer,
};
pub use history::{HistoryLog, ImageRecord};
pub use ops::{
    AiEdit, AiStep, AlphaMatting, BackgroundModel, CompressionProfile, FlipAxis, Operation,
    ProfileRef, ProfileRegistry, Rotation, StaticProfiles, MAX_DIMENSION,
};
pub use revisions::{GcReport, RevisionStorage};
pub use sessions::SessionManager;
pub use sweeper::ExpirySweeper;
pub use types::*;
