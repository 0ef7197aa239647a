//! Operation execution.
//!
//! The executor turns a validated [`Operation`] plus the image's current
//! revision into a new stored revision and its thumbnail. It never touches
//! history; the caller decides whether the result is committed.

mod transform;

pub use transform::{TransformFailure, TransformResult, Transformer};

use crate::error::{EngineError, Result};
use crate::ops::{Operation, ProfileRef, ProfileRegistry};
use crate::revisions::RevisionStorage;
use crate::types::{ImageId, Pixels, Revision, RevisionKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation for a long-running operation.
///
/// Checked before the transform starts and again before anything is
/// committed; a transform already running is allowed to finish.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Revisions written by a successful [`Executor::apply`].
#[derive(Clone, Debug)]
pub struct AppliedRevision {
    pub revision: Revision,
    pub thumbnail: Revision,
}

impl AppliedRevision {
    pub fn keys(&self) -> [crate::types::RevisionKey; 2] {
        [self.revision.key, self.thumbnail.key]
    }
}

/// Runs operations against stored revisions.
pub struct Executor {
    transformer: Arc<dyn Transformer>,
    profiles: Arc<dyn ProfileRegistry>,
}

impl Executor {
    pub fn new(transformer: Arc<dyn Transformer>, profiles: Arc<dyn ProfileRegistry>) -> Self {
        Self {
            transformer,
            profiles,
        }
    }

    pub fn transformer(&self) -> &dyn Transformer {
        self.transformer.as_ref()
    }

    /// Validate `op` and pin any registry lookups it depends on.
    ///
    /// A compress operation gets the profile's current parameters copied
    /// into it, so the recorded entry does not change meaning when the
    /// profile is later edited or removed.
    pub fn resolve(&self, op: Operation) -> Result<Operation> {
        op.validate()?;
        match op {
            Operation::Compress { profile } => {
                let snapshot = self.profiles.get_profile(&profile.id).ok_or_else(|| {
                    EngineError::validation(format!(
                        "unknown compression profile: {}",
                        profile.id
                    ))
                })?;
                snapshot.validate()?;
                Ok(Operation::Compress {
                    profile: ProfileRef {
                        id: profile.id,
                        snapshot: Some(snapshot),
                    },
                })
            }
            other => Ok(other),
        }
    }

    /// Apply `op` to `current` and store the result plus a thumbnail.
    ///
    /// On any failure nothing written by this call survives.
    pub fn apply(
        &self,
        revisions: &RevisionStorage,
        image: ImageId,
        current: &Revision,
        op: &Operation,
        thumbnail_edge: u32,
        cancel: &CancelFlag,
    ) -> Result<AppliedRevision> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(image));
        }

        let source = revisions.load_verified(current)?;
        let output = self.transform(&source, op).map_err(|e| EngineError::Transform {
            operation: op.kind().as_str(),
            message: e.0,
        })?;
        check_output(op, &output)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(image));
        }

        let revision = revisions.put(image, &output, RevisionKind::Full)?;
        let thumbnail = match revisions.derived_thumbnail(
            image,
            &revision,
            self.transformer.as_ref(),
            thumbnail_edge,
        ) {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                revisions.discard([revision.key]);
                return Err(e);
            }
        };

        tracing::debug!(
            image = %image,
            operation = %op.kind(),
            revision = %revision.key,
            width = revision.dimensions.width,
            height = revision.dimensions.height,
            "operation executed"
        );

        Ok(AppliedRevision {
            revision,
            thumbnail,
        })
    }

    fn transform(&self, source: &Pixels, op: &Operation) -> TransformResult {
        let t = self.transformer.as_ref();
        match op {
            Operation::Resize { width, height } => t.resize(source, width.get(), height.get()),
            Operation::Rotate { degrees } => t.rotate(source, *degrees),
            Operation::Flip { axis } => t.flip(source, *axis),
            Operation::Compress { profile } => match &profile.snapshot {
                Some(snapshot) => t.compress(source, snapshot),
                None => Err(TransformFailure::new(format!(
                    "compression profile '{}' was not resolved",
                    profile.id
                ))),
            },
            Operation::RemoveBackground {
                model,
                alpha_matting,
            } => t.remove_background(source, *model, *alpha_matting),
            Operation::AiEdit(edit) => t.ai_edit(source, edit),
        }
    }
}

fn check_output(op: &Operation, output: &Pixels) -> Result<()> {
    if output.data.is_empty() || output.dimensions.is_empty() {
        return Err(EngineError::Transform {
            operation: op.kind().as_str(),
            message: format!(
                "produced an empty image ({}x{}, {} bytes)",
                output.dimensions.width,
                output.dimensions.height,
                output.data.len()
            ),
        });
    }
    Ok(())
}
