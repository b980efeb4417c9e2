//! Canonical detection types and the boundary to detection backends

pub mod backend;
pub mod normalize;

pub use backend::{Detector, NullDetector};
pub use normalize::{normalize, NormalizeError, Normalized, SkipReason, SkippedPrediction};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::FrameDescriptor;

/// One normalized detection. Coordinates are relative to the source frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f64,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

/// Detections for one processed frame, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_id: u64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(rename = "fps")]
    pub fps_estimate: f64,
    /// Model output order
    pub detections: Vec<Detection>,
    pub error: Option<String>,
}

impl DetectionResult {
    /// An empty result that still tells subscribers the frame was processed
    pub fn failed(descriptor: &FrameDescriptor, fps_estimate: f64, error: impl Into<String>) -> Self {
        Self {
            frame_id: descriptor.frame_id,
            timestamp_ms: descriptor.timestamp_ms(),
            fps_estimate,
            detections: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Normalize `raw` against the best known image size and assemble the
    /// result. Items that could not be normalized are returned for logging.
    pub fn from_predictions(
        descriptor: &FrameDescriptor,
        fps_estimate: f64,
        raw: &RawPredictions,
        min_confidence: f64,
    ) -> (Self, Vec<SkippedPrediction>) {
        let dims = raw.image.unwrap_or(ImageDimensions {
            width: descriptor.width,
            height: descriptor.height,
        });

        match normalize(&raw.predictions, dims.width, dims.height) {
            Ok(normalized) => {
                let error = if !raw.predictions.is_empty()
                    && normalized.skipped.len() == raw.predictions.len()
                {
                    Some(format!(
                        "all {} predictions were malformed",
                        raw.predictions.len()
                    ))
                } else {
                    None
                };

                let detections = normalized
                    .detections
                    .into_iter()
                    .filter(|d| d.confidence >= min_confidence)
                    .collect();

                let result = Self {
                    frame_id: descriptor.frame_id,
                    timestamp_ms: descriptor.timestamp_ms(),
                    fps_estimate,
                    detections,
                    error,
                };
                (result, normalized.skipped)
            }
            Err(err) => (Self::failed(descriptor, fps_estimate, err.to_string()), Vec::new()),
        }
    }
}

/// Image size as reported by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// One prediction as a backend emitted it, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    /// Loosely-typed record, e.g. one entry of a JSON `predictions` array
    Record(Value),
    Structured(StructuredPrediction),
    Corners(CornerPrediction),
}

/// Typed center-format prediction with absolute pixel coordinates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredPrediction {
    pub class_name: Option<String>,
    pub class_id: Option<i64>,
    pub confidence: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub tracker_id: Option<i64>,
}

/// Corner-format (`xyxy`) prediction with absolute pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct CornerPrediction {
    pub class_name: Option<String>,
    pub confidence: Option<f64>,
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Everything a backend produced for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPredictions {
    pub image: Option<ImageDimensions>,
    pub predictions: Vec<RawPrediction>,
}

impl RawPredictions {
    pub fn new(predictions: Vec<RawPrediction>) -> Self {
        Self {
            image: None,
            predictions,
        }
    }

    pub fn with_image(mut self, width: u32, height: u32) -> Self {
        self.image = Some(ImageDimensions { width, height });
        self
    }

    /// Parse a model response received as text
    pub fn parse(text: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NormalizeError::Malformed(format!("unparseable model response: {e}")))?;
        Ok(Self::from_json(&value)?)
    }

    /// Parse a model response document.
    ///
    /// Accepts a response object, or a list of them of which the first is
    /// used. Image size comes from `image.{width,height}` or top-level
    /// `image_width`/`image_height`. A reported size of zero or less is kept
    /// as zero so normalization rejects the batch; only an absent size falls
    /// back to the frame's own.
    pub fn from_json(value: &Value) -> Result<Self, NormalizeError> {
        let response = match value {
            Value::Array(items) => items.first().ok_or(NormalizeError::EmptyPredictionList)?,
            other => other,
        };

        let Value::Object(map) = response else {
            return Err(NormalizeError::Malformed(format!(
                "expected a response object, got {}",
                json_kind(response)
            )));
        };

        let image_field = |nested: &str, flat: &str| {
            map.get("image")
                .and_then(|image| image.get(nested))
                .and_then(image_extent)
                .or_else(|| map.get(flat).and_then(image_extent))
        };
        let image = match (image_field("width", "image_width"), image_field("height", "image_height")) {
            (Some(width), Some(height)) => Some(ImageDimensions { width, height }),
            // A half-reported size that is already zero cannot be repaired
            (Some(0), None) | (None, Some(0)) => Some(ImageDimensions { width: 0, height: 0 }),
            _ => None,
        };

        // A non-list `predictions` is treated as "no predictions"
        let predictions = match map.get("predictions") {
            Some(Value::Array(items)) => items.iter().cloned().map(RawPrediction::Record).collect(),
            _ => Vec::new(),
        };

        Ok(Self { image, predictions })
    }
}

/// Present numeric extent, clamped into `0..=u32::MAX`
fn image_extent(value: &Value) -> Option<u32> {
    let n = value.as_f64()?;
    if n.is_nan() {
        return Some(0);
    }
    Some(n.clamp(0.0, u32::MAX as f64) as u32)
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
