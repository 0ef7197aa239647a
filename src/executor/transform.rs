//! External pixel functions.

use crate::ops::{AiEdit, AiStep, AlphaMatting, BackgroundModel, CompressionProfile, FlipAxis, Rotation};
use crate::types::Pixels;
use thiserror::Error;

/// Failure reported by an external pixel function.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransformFailure(pub String);

impl TransformFailure {
    pub fn new(message: impl Into<String>) -> Self {
        TransformFailure(message.into())
    }
}

/// Result of an external pixel function.
pub type TransformResult = std::result::Result<Pixels, TransformFailure>;

/// The pixel algorithms the engine delegates to.
///
/// The engine treats every method as a black box: it hands over the
/// current encoded image and stores whatever comes back. Implementations
/// may be slow (model inference) and are always called outside any
/// engine-wide lock, but inside the target image's mutation lock.
pub trait Transformer: Send + Sync {
    /// Decode enough of an uploaded payload to learn its format and size.
    /// The returned `data` is the payload itself.
    fn probe(&self, bytes: &[u8]) -> TransformResult;

    /// Bake in orientation metadata so later steps see upright pixels.
    fn normalize(&self, pixels: Pixels) -> TransformResult {
        Ok(pixels)
    }

    fn resize(&self, pixels: &Pixels, width: u32, height: u32) -> TransformResult;

    fn rotate(&self, pixels: &Pixels, rotation: Rotation) -> TransformResult;

    fn flip(&self, pixels: &Pixels, axis: FlipAxis) -> TransformResult;

    fn compress(&self, pixels: &Pixels, profile: &CompressionProfile) -> TransformResult;

    fn remove_background(
        &self,
        pixels: &Pixels,
        model: BackgroundModel,
        alpha_matting: Option<AlphaMatting>,
    ) -> TransformResult;

    /// Apply one primitive AI step.
    fn ai_step(&self, pixels: &Pixels, step: &AiStep) -> TransformResult;

    /// Apply a whole AI turn. Fails as a unit if any step fails.
    fn ai_edit(&self, pixels: &Pixels, edit: &AiEdit) -> TransformResult {
        let mut current = pixels.clone();
        for step in &edit.steps {
            current = self.ai_step(&current, step)?;
        }
        Ok(current)
    }

    /// Downscale so neither edge exceeds `max_edge`.
    fn thumbnail(&self, pixels: &Pixels, max_edge: u32) -> TransformResult;
}
