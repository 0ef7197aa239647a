//! AI-directed edits.
//!
//! An AI collaborator answers a chat turn with a JSON block listing
//! primitive steps:
//!
//! ```json
//! {"operations": [
//!   {"type": "brightness", "params": {"value": 1.3}},
//!   {"type": "saturation", "params": {"value": 1.4}}
//! ]}
//! ```
//!
//! The whole list becomes one [`AiEdit`], applied and undone as a unit.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// One primitive step proposed by the AI collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum AiStep {
    Brightness { value: f32 },
    Contrast { value: f32 },
    Saturation { value: f32 },
    Rotate { degrees: i32 },
    Crop {
        /// `[x1, y1, x2, y2]`
        #[serde(rename = "box")]
        bounds: [u32; 4],
    },
    Resize { width: u32, height: u32 },
    Blur { radius: u32 },
    Sharpen { factor: f32 },
    Sepia {},
    Grayscale {},
}

impl AiStep {
    pub fn name(&self) -> &'static str {
        match self {
            AiStep::Brightness { .. } => "brightness",
            AiStep::Contrast { .. } => "contrast",
            AiStep::Saturation { .. } => "saturation",
            AiStep::Rotate { .. } => "rotate",
            AiStep::Crop { .. } => "crop",
            AiStep::Resize { .. } => "resize",
            AiStep::Blur { .. } => "blur",
            AiStep::Sharpen { .. } => "sharpen",
            AiStep::Sepia {} => "sepia",
            AiStep::Grayscale {} => "grayscale",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            AiStep::Brightness { value } | AiStep::Contrast { value } => {
                check_range(self.name(), value, 0.5, 2.0)
            }
            AiStep::Saturation { value } => check_range("saturation", value, 0.0, 2.0),
            AiStep::Sharpen { factor } => check_range("sharpen", factor, 0.5, 2.0),
            AiStep::Rotate { degrees } => {
                if !(-360..=360).contains(&degrees) {
                    return Err(EngineError::validation(format!(
                        "rotate step must be within -360..=360 degrees, got {degrees}"
                    )));
                }
                Ok(())
            }
            AiStep::Crop {
                bounds: [x1, y1, x2, y2],
            } => {
                if x1 >= x2 || y1 >= y2 {
                    return Err(EngineError::validation(format!(
                        "crop box [{x1}, {y1}, {x2}, {y2}] is empty"
                    )));
                }
                Ok(())
            }
            AiStep::Resize { width, height } => {
                if width == 0 || height == 0 {
                    return Err(EngineError::validation(format!(
                        "resize step dimensions must be positive, got {width}x{height}"
                    )));
                }
                Ok(())
            }
            AiStep::Blur { radius } => {
                if !(1..=10).contains(&radius) {
                    return Err(EngineError::validation(format!(
                        "blur radius must be within 1..=10, got {radius}"
                    )));
                }
                Ok(())
            }
            AiStep::Sepia {} | AiStep::Grayscale {} => Ok(()),
        }
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(EngineError::validation(format!(
            "{name} must be within {min}..={max}, got {value}"
        )));
    }
    Ok(())
}

/// One AI chat turn's worth of steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiEdit {
    pub steps: Vec<AiStep>,

    /// Model that proposed the steps.
    #[serde(default)]
    pub model: Option<String>,

    /// The user message that prompted the turn.
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Deserialize)]
struct AiPayload {
    operations: Vec<AiStep>,
}

impl AiEdit {
    pub fn new(steps: Vec<AiStep>) -> Result<Self> {
        let edit = Self {
            steps,
            model: None,
            prompt: None,
        };
        edit.validate()?;
        Ok(edit)
    }

    /// Parse the collaborator's `{"operations": [...]}` block.
    pub fn from_json(payload: &str) -> Result<Self> {
        let parsed: AiPayload = serde_json::from_str(payload).map_err(|e| {
            EngineError::validation(format!("malformed AI operation list: {e}"))
        })?;
        Self::new(parsed.operations)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::validation("AI edit contains no operations"));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| match e {
                EngineError::Validation(msg) => {
                    EngineError::Validation(format!("AI step {index}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collaborator_payload() {
        let edit = AiEdit::from_json(
            r#"{"operations": [
                {"type": "brightness", "params": {"value": 1.3}},
                {"type": "crop", "params": {"box": [0, 0, 100, 80]}},
                {"type": "grayscale", "params": {}}
            ]}"#,
        )
        .unwrap();

        assert_eq!(edit.steps.len(), 3);
        assert_eq!(edit.steps[0], AiStep::Brightness { value: 1.3 });
        assert_eq!(edit.steps[1], AiStep::Crop { bounds: [0, 0, 100, 80] });
        assert_eq!(edit.steps[2], AiStep::Grayscale {});
    }

    #[test]
    fn test_malformed_payload_is_validation_error() {
        assert!(matches!(AiEdit::from_json("not json"), Err(EngineError::Validation(_))));
        assert!(matches!(
            AiEdit::from_json(r#"{"operations": [{"type": "explode", "params": {}}]}"#),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            AiEdit::from_json(r#"{"operations": []}"#),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_step_ranges() {
        assert!(AiStep::Brightness { value: 2.5 }.validate().is_err());
        assert!(AiStep::Saturation { value: 0.0 }.validate().is_ok());
        assert!(AiStep::Blur { radius: 0 }.validate().is_err());
        assert!(AiStep::Rotate { degrees: -400 }.validate().is_err());
        assert!(AiStep::Crop { bounds: [10, 10, 10, 20] }.validate().is_err());
        assert!(AiStep::Contrast { value: f32::NAN }.validate().is_err());
    }

    #[test]
    fn test_error_names_failing_step() {
        let err = AiEdit::new(vec![
            AiStep::Sepia {},
            AiStep::Sharpen { factor: 9.0 },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("AI step 1"));
    }
}
