//! Edit operations.
//!
//! Every mutation an image can undergo is one case of the closed
//! [`Operation`] union. Each case carries only its own parameter set, and
//! parameter types are chosen so most invalid values cannot be built at
//! all (`Rotation` only holds quarter turns, `Resize` only non-zero sizes).
//! Remaining range checks live in `validate`.

mod ai;
mod operation;
mod profiles;

pub use ai::{AiEdit, AiStep};
pub use operation::{
    AlphaMatting, BackgroundModel, FlipAxis, Operation, ProfileRef, Rotation, MAX_DIMENSION,
};
pub use profiles::{CompressionProfile, ProfileRegistry, StaticProfiles};
