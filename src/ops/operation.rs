//! The operation union and its parameter types.

use super::ai::AiEdit;
use super::profiles::CompressionProfile;
use crate::error::{EngineError, Result};
use crate::types::{Dimensions, OperationKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// Largest width or height a resize may request.
pub const MAX_DIMENSION: u32 = 16_384;

/// An edit applied to an image's current revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Resize {
        width: NonZeroU32,
        height: NonZeroU32,
    },
    Rotate {
        degrees: Rotation,
    },
    Flip {
        axis: FlipAxis,
    },
    Compress {
        profile: ProfileRef,
    },
    RemoveBackground {
        model: BackgroundModel,
        #[serde(default)]
        alpha_matting: Option<AlphaMatting>,
    },
    /// One AI chat turn: an ordered list of primitive steps recorded as a
    /// single history entry.
    AiEdit(AiEdit),
}

impl Operation {
    pub fn resize(width: u32, height: u32) -> Result<Self> {
        let (width, height) = match (NonZeroU32::new(width), NonZeroU32::new(height)) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(EngineError::validation(format!(
                    "resize dimensions must be positive, got {width}x{height}"
                )))
            }
        };
        let op = Operation::Resize { width, height };
        op.validate()?;
        Ok(op)
    }

    pub fn rotate(degrees: i32) -> Result<Self> {
        let degrees = Rotation::try_from(degrees).map_err(EngineError::Validation)?;
        Ok(Operation::Rotate { degrees })
    }

    pub fn flip(axis: FlipAxis) -> Self {
        Operation::Flip { axis }
    }

    /// Compress with a named profile. The profile is resolved and
    /// snapshotted into the operation when it is applied.
    pub fn compress(profile_id: impl Into<String>) -> Self {
        Operation::Compress {
            profile: ProfileRef {
                id: profile_id.into(),
                snapshot: None,
            },
        }
    }

    pub fn remove_background(model: BackgroundModel) -> Self {
        Operation::RemoveBackground {
            model,
            alpha_matting: None,
        }
    }

    pub fn ai_edit(edit: AiEdit) -> Result<Self> {
        edit.validate()?;
        Ok(Operation::AiEdit(edit))
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Resize { .. } => OperationKind::Resize,
            Operation::Rotate { .. } => OperationKind::Rotate,
            Operation::Flip { .. } => OperationKind::Flip,
            Operation::Compress { .. } => OperationKind::Compress,
            Operation::RemoveBackground { .. } => OperationKind::RemoveBackground,
            Operation::AiEdit(_) => OperationKind::AiEdit,
        }
    }

    /// Check the range constraints the parameter types cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Resize { width, height } => {
                if width.get() > MAX_DIMENSION || height.get() > MAX_DIMENSION {
                    return Err(EngineError::validation(format!(
                        "resize dimensions must not exceed {MAX_DIMENSION}, got {width}x{height}"
                    )));
                }
                Ok(())
            }
            Operation::Rotate { .. } | Operation::Flip { .. } => Ok(()),
            Operation::Compress { profile } => {
                if profile.id.trim().is_empty() {
                    return Err(EngineError::validation("compression profile id is empty"));
                }
                match &profile.snapshot {
                    Some(snapshot) => snapshot.validate(),
                    None => Ok(()),
                }
            }
            Operation::RemoveBackground { alpha_matting, .. } => match alpha_matting {
                Some(matting) => matting.validate(),
                None => Ok(()),
            },
            Operation::AiEdit(edit) => edit.validate(),
        }
    }
}

/// A clockwise rotation by a whole number of quarter turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    Quarter,
    Half,
    ThreeQuarters,
}

impl Rotation {
    /// Clockwise degrees in `{90, 180, 270}`.
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarters => 270,
        }
    }

    pub fn apply_to(&self, dimensions: Dimensions) -> Dimensions {
        match self {
            Rotation::Half => dimensions,
            Rotation::Quarter | Rotation::ThreeQuarters => dimensions.transposed(),
        }
    }
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    /// Accepts any non-trivial multiple of 90; negative values rotate
    /// counter-clockwise (`-90` is `270`).
    fn try_from(degrees: i32) -> std::result::Result<Self, Self::Error> {
        if degrees % 90 != 0 {
            return Err(format!("rotation must be a multiple of 90 degrees, got {degrees}"));
        }
        match degrees.rem_euclid(360) {
            90 => Ok(Rotation::Quarter),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::ThreeQuarters),
            _ => Err(format!("rotation of {degrees} degrees does not change the image")),
        }
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees() as i32
    }
}

/// Mirror axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

impl FromStr for FlipAxis {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "horizontal" => Ok(FlipAxis::Horizontal),
            "vertical" => Ok(FlipAxis::Vertical),
            other => Err(EngineError::validation(format!(
                "flip axis must be 'horizontal' or 'vertical', got '{other}'"
            ))),
        }
    }
}

/// Reference to a compression profile by id.
///
/// `snapshot` is filled in with the resolved profile when the operation is
/// applied, so a recorded entry stays replayable after the profile changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    #[serde(default)]
    pub snapshot: Option<CompressionProfile>,
}

/// Segmentation model used for background removal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackgroundModel {
    /// General purpose.
    #[default]
    #[serde(rename = "u2net")]
    U2net,
    #[serde(rename = "u2net_human_seg")]
    U2netHumanSeg,
    #[serde(rename = "isnet-general-use")]
    IsnetGeneralUse,
    #[serde(rename = "isnet-anime")]
    IsnetAnime,
}

impl BackgroundModel {
    pub const ALL: [BackgroundModel; 4] = [
        BackgroundModel::U2net,
        BackgroundModel::U2netHumanSeg,
        BackgroundModel::IsnetGeneralUse,
        BackgroundModel::IsnetAnime,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BackgroundModel::U2net => "u2net",
            BackgroundModel::U2netHumanSeg => "u2net_human_seg",
            BackgroundModel::IsnetGeneralUse => "isnet-general-use",
            BackgroundModel::IsnetAnime => "isnet-anime",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BackgroundModel::U2net => "General purpose",
            BackgroundModel::U2netHumanSeg => "Human segmentation",
            BackgroundModel::IsnetGeneralUse => "High quality general",
            BackgroundModel::IsnetAnime => "Anime/illustration",
        }
    }
}

impl FromStr for BackgroundModel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        BackgroundModel::ALL
            .into_iter()
            .find(|model| model.id() == s)
            .ok_or_else(|| EngineError::validation(format!("unknown background model: {s}")))
    }
}

impl fmt::Display for BackgroundModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Alpha matting thresholds for smoother cut-out edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlphaMatting {
    pub foreground_threshold: u8,
    pub background_threshold: u8,
}

impl Default for AlphaMatting {
    fn default() -> Self {
        Self {
            foreground_threshold: 240,
            background_threshold: 10,
        }
    }
}

impl AlphaMatting {
    pub fn validate(&self) -> Result<()> {
        if self.foreground_threshold <= self.background_threshold {
            return Err(EngineError::validation(format!(
                "alpha matting foreground threshold ({}) must exceed background threshold ({})",
                self.foreground_threshold, self.background_threshold
            )));
        }
        Ok(())
    }
}
