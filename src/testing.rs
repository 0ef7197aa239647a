//! Deterministic transformer for tests and benchmarks.
//!
//! Images are plain text: a header line `RTIMG <format> <width>x<height>`
//! followed by a trail of the steps applied so far. Every operation
//! rewrites the header with the dimensions a real implementation would
//! produce, which is all the engine ever inspects.

use crate::executor::{TransformFailure, TransformResult, Transformer};
use crate::ops::{AiStep, AlphaMatting, BackgroundModel, CompressionProfile, FlipAxis, Rotation};
use crate::types::{Dimensions, ImageFormat, Pixels};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const HEADER: &str = "RTIMG";

/// Encode a synthetic image.
pub fn fake_image(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    encode(format, Dimensions::new(width, height), "")
}

fn encode(format: ImageFormat, dimensions: Dimensions, trail: &str) -> Vec<u8> {
    format!(
        "{HEADER} {} {}x{}\n{trail}",
        format.as_str(),
        dimensions.width,
        dimensions.height
    )
    .into_bytes()
}

fn parse(bytes: &[u8]) -> Option<(ImageFormat, Dimensions, String)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (header, trail) = text.split_once('\n')?;
    let mut parts = header.split(' ');
    if parts.next()? != HEADER {
        return None;
    }
    let format = parts.next()?.parse().ok()?;
    let (w, h) = parts.next()?.split_once('x')?;
    Some((
        format,
        Dimensions::new(w.parse().ok()?, h.parse().ok()?),
        trail.to_string(),
    ))
}

fn fit_within(dimensions: Dimensions, max_width: u32, max_height: u32) -> Dimensions {
    if dimensions.width <= max_width && dimensions.height <= max_height {
        return dimensions;
    }
    let ratio = f64::min(
        max_width as f64 / dimensions.width as f64,
        max_height as f64 / dimensions.height as f64,
    );
    Dimensions::new(
        ((dimensions.width as f64 * ratio).round() as u32).max(1),
        ((dimensions.height as f64 * ratio).round() as u32).max(1),
    )
}

/// A [`Transformer`] that fakes pixel work.
#[derive(Default)]
pub struct FakeTransformer {
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to the named stage fail (`"rotate"`, `"thumbnail"`, ...).
    pub fn fail_on(&self, stage: &str) {
        self.failing.lock().insert(stage.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Sleep for `delay` inside every operation (not thumbnails or probes).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of transformer calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Decode a synthetic image without counting a call.
    pub fn decode(&self, bytes: &[u8]) -> TransformResult {
        let (format, dimensions, _) = parse(bytes)
            .ok_or_else(|| TransformFailure::new("unrecognized image data"))?;
        Ok(Pixels {
            data: bytes.to_vec(),
            format,
            dimensions,
        })
    }

    fn enter(&self, stage: &str, slow: bool) -> Result<(), TransformFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if slow {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }
        if self.failing.lock().contains(stage) {
            return Err(TransformFailure::new(format!("injected {stage} failure")));
        }
        Ok(())
    }

    fn produce(
        &self,
        source: &Pixels,
        format: ImageFormat,
        dimensions: Dimensions,
        step: &str,
    ) -> TransformResult {
        let (_, _, trail) = parse(&source.data)
            .ok_or_else(|| TransformFailure::new("unrecognized image data"))?;
        let trail = format!("{trail}{step};");
        Ok(Pixels {
            data: encode(format, dimensions, &trail),
            format,
            dimensions,
        })
    }
}

impl Transformer for FakeTransformer {
    fn probe(&self, bytes: &[u8]) -> TransformResult {
        self.enter("probe", false)?;
        self.decode(bytes)
    }

    fn normalize(&self, pixels: Pixels) -> TransformResult {
        self.enter("normalize", false)?;
        Ok(pixels)
    }

    fn resize(&self, pixels: &Pixels, width: u32, height: u32) -> TransformResult {
        self.enter("resize", true)?;
        self.produce(
            pixels,
            pixels.format,
            Dimensions::new(width, height),
            &format!("resize {width}x{height}"),
        )
    }

    fn rotate(&self, pixels: &Pixels, rotation: Rotation) -> TransformResult {
        self.enter("rotate", true)?;
        self.produce(
            pixels,
            pixels.format,
            rotation.apply_to(pixels.dimensions),
            &format!("rotate {}", rotation.degrees()),
        )
    }

    fn flip(&self, pixels: &Pixels, axis: FlipAxis) -> TransformResult {
        self.enter("flip", true)?;
        self.produce(pixels, pixels.format, pixels.dimensions, &format!("flip {axis:?}"))
    }

    fn compress(&self, pixels: &Pixels, profile: &CompressionProfile) -> TransformResult {
        self.enter("compress", true)?;
        let dimensions = if profile.retain_aspect_ratio {
            fit_within(pixels.dimensions, profile.max_width, profile.max_height)
        } else {
            Dimensions::new(
                pixels.dimensions.width.min(profile.max_width),
                pixels.dimensions.height.min(profile.max_height),
            )
        };
        self.produce(
            pixels,
            profile.format,
            dimensions,
            &format!("compress {} q{}", profile.id, profile.quality),
        )
    }

    fn remove_background(
        &self,
        pixels: &Pixels,
        model: BackgroundModel,
        _alpha_matting: Option<AlphaMatting>,
    ) -> TransformResult {
        self.enter("remove_background", true)?;
        self.produce(
            pixels,
            ImageFormat::Png,
            pixels.dimensions,
            &format!("remove_background {model}"),
        )
    }

    fn ai_step(&self, pixels: &Pixels, step: &AiStep) -> TransformResult {
        self.enter(step.name(), true)?;
        let dimensions = match *step {
            AiStep::Crop {
                bounds: [x1, y1, x2, y2],
            } => Dimensions::new(
                x2.min(pixels.dimensions.width).saturating_sub(x1).max(1),
                y2.min(pixels.dimensions.height).saturating_sub(y1).max(1),
            ),
            AiStep::Resize { width, height } => Dimensions::new(width, height),
            AiStep::Rotate { degrees } => match Rotation::try_from(degrees) {
                Ok(rotation) => rotation.apply_to(pixels.dimensions),
                Err(_) => pixels.dimensions,
            },
            _ => pixels.dimensions,
        };
        self.produce(pixels, pixels.format, dimensions, &format!("ai {}", step.name()))
    }

    fn thumbnail(&self, pixels: &Pixels, max_edge: u32) -> TransformResult {
        self.enter("thumbnail", false)?;
        self.produce(
            pixels,
            pixels.format,
            fit_within(pixels.dimensions, max_edge, max_edge),
            &format!("thumbnail {max_edge}"),
        )
    }
}
