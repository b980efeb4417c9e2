//! Conversion of heterogeneous raw predictions into [`Detection`]s
//!
//! Pure and deterministic: nothing here logs. Items that cannot be
//! normalized are returned with their reason so callers can report them.

use serde_json::{Map, Value};
use thiserror::Error;

use super::{json_kind, CornerPrediction, Detection, RawPrediction, StructuredPrediction};

/// Whole-batch failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("cannot normalize against a {width}x{height} image")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("empty prediction list from model")]
    EmptyPredictionList,

    #[error("malformed prediction payload: {0}")]
    Malformed(String),
}

/// Why a single prediction was left out
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("expected an object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing or non-numeric field `{0}`")]
    MissingField(&'static str),

    #[error("confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),

    #[error("degenerate bounding box")]
    InvalidBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPrediction {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Same relative order as the input
    pub detections: Vec<Detection>,
    pub skipped: Vec<SkippedPrediction>,
}

/// Absolute center-format box, common to all input shapes
struct AbsoluteBox {
    class_name: String,
    confidence: f64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

pub fn normalize(
    predictions: &[RawPrediction],
    image_width: u32,
    image_height: u32,
) -> Result<Normalized, NormalizeError> {
    if image_width == 0 || image_height == 0 {
        return Err(NormalizeError::InvalidImageSize {
            width: image_width,
            height: image_height,
        });
    }

    let (w, h) = (f64::from(image_width), f64::from(image_height));
    let mut out = Normalized::default();

    for (index, raw) in predictions.iter().enumerate() {
        let parsed = match raw {
            RawPrediction::Record(value) => from_record(value),
            RawPrediction::Structured(pred) => from_structured(pred),
            RawPrediction::Corners(pred) => from_corners(pred),
        }
        .and_then(validate);

        match parsed {
            Ok(abs) => out.detections.push(Detection {
                class_name: abs.class_name,
                confidence: abs.confidence,
                x_center: unit(abs.x / w),
                y_center: unit(abs.y / h),
                width: unit(abs.width / w),
                height: unit(abs.height / h),
            }),
            Err(reason) => out.skipped.push(SkippedPrediction { index, reason }),
        }
    }

    Ok(out)
}

fn unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn from_record(value: &Value) -> Result<AbsoluteBox, SkipReason> {
    let Value::Object(map) = value else {
        return Err(SkipReason::NotAnObject(json_kind(value)));
    };

    let class_name = ["class_name", "class"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .ok_or(SkipReason::MissingField("class"))?;

    Ok(AbsoluteBox {
        class_name: class_name.to_owned(),
        confidence: number(map, "confidence")?,
        x: number(map, "x")?,
        y: number(map, "y")?,
        width: number(map, "width")?,
        height: number(map, "height")?,
    })
}

fn number(map: &Map<String, Value>, key: &'static str) -> Result<f64, SkipReason> {
    map.get(key)
        .and_then(Value::as_f64)
        .ok_or(SkipReason::MissingField(key))
}

fn from_structured(pred: &StructuredPrediction) -> Result<AbsoluteBox, SkipReason> {
    let class_name = pred
        .class_name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or(SkipReason::MissingField("class_name"))?;

    Ok(AbsoluteBox {
        class_name,
        confidence: pred.confidence.ok_or(SkipReason::MissingField("confidence"))?,
        x: pred.x.ok_or(SkipReason::MissingField("x"))?,
        y: pred.y.ok_or(SkipReason::MissingField("y"))?,
        width: pred.width.ok_or(SkipReason::MissingField("width"))?,
        height: pred.height.ok_or(SkipReason::MissingField("height"))?,
    })
}

fn from_corners(pred: &CornerPrediction) -> Result<AbsoluteBox, SkipReason> {
    let class_name = pred
        .class_name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or(SkipReason::MissingField("class_name"))?;
    let confidence = pred.confidence.ok_or(SkipReason::MissingField("confidence"))?;

    if pred.x_max < pred.x_min || pred.y_max < pred.y_min {
        return Err(SkipReason::InvalidBox);
    }

    Ok(AbsoluteBox {
        class_name,
        confidence,
        x: (pred.x_min + pred.x_max) / 2.0,
        y: (pred.y_min + pred.y_max) / 2.0,
        width: pred.x_max - pred.x_min,
        height: pred.y_max - pred.y_min,
    })
}

fn validate(abs: AbsoluteBox) -> Result<AbsoluteBox, SkipReason> {
    if !abs.confidence.is_finite() || !(0.0..=1.0).contains(&abs.confidence) {
        return Err(SkipReason::InvalidConfidence(abs.confidence));
    }
    let finite = [abs.x, abs.y, abs.width, abs.height]
        .iter()
        .all(|v| v.is_finite());
    if !finite || abs.width < 0.0 || abs.height < 0.0 {
        return Err(SkipReason::InvalidBox);
    }
    Ok(abs)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(class: &str, conf: f64, x: f64, y: f64, w: f64, h: f64) -> RawPrediction {
        RawPrediction::Record(json!({
            "class": class, "confidence": conf, "x": x, "y": y, "width": w, "height": h
        }))
    }

    #[test]
    fn divides_by_image_size() {
        let out = normalize(&[record("go", 0.8, 100.0, 50.0, 20.0, 10.0)], 200, 100).unwrap();
        let d = &out.detections[0];
        assert_eq!(d.class_name, "go");
        assert_eq!(d.confidence, 0.8);
        assert_eq!((d.x_center, d.y_center, d.width, d.height), (0.5, 0.5, 0.1, 0.1));
    }

    #[test]
    fn zero_width_or_height_is_rejected() {
        let preds = [record("go", 0.8, 1.0, 1.0, 1.0, 1.0)];
        assert_eq!(
            normalize(&preds, 0, 100),
            Err(NormalizeError::InvalidImageSize {
                width: 0,
                height: 100
            })
        );
        assert!(normalize(&preds, 100, 0).is_err());
    }

    #[test]
    fn missing_field_skips_only_that_item() {
        let preds = [
            record("a", 0.9, 10.0, 10.0, 5.0, 5.0),
            RawPrediction::Record(json!({"class": "b", "confidence": 0.9, "x": 1, "y": 1, "width": 1})),
            record("c", 0.7, 20.0, 20.0, 5.0, 5.0),
        ];

        let out = normalize(&preds, 100, 100).unwrap();
        let names: Vec<_> = out.detections.iter().map(|d| d.class_name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(
            out.skipped,
            vec![SkippedPrediction {
                index: 1,
                reason: SkipReason::MissingField("height")
            }]
        );
    }

    #[test]
    fn record_accepts_class_name_key() {
        let preds = [RawPrediction::Record(json!({
            "class_name": "stop", "class_id": 4, "confidence": 0.6,
            "x": 5, "y": 5, "width": 2, "height": 2, "tracker_id": 11
        }))];
        let out = normalize(&preds, 10, 10).unwrap();
        assert_eq!(out.detections[0].class_name, "stop");
    }

    #[test]
    fn record_without_class_is_skipped() {
        let preds = [RawPrediction::Record(json!({
            "class_id": 4, "confidence": 0.6, "x": 5, "y": 5, "width": 2, "height": 2
        }))];
        let out = normalize(&preds, 10, 10).unwrap();
        assert!(out.detections.is_empty());
        assert_eq!(out.skipped[0].reason, SkipReason::MissingField("class"));
    }

    #[test]
    fn non_object_record_is_skipped() {
        let out = normalize(&[RawPrediction::Record(json!([1, 2]))], 10, 10).unwrap();
        assert_eq!(out.skipped[0].reason, SkipReason::NotAnObject("list"));
    }

    #[test]
    fn structured_shape() {
        let pred = StructuredPrediction {
            class_name: Some("person".into()),
            confidence: Some(0.55),
            x: Some(320.0),
            y: Some(120.0),
            width: Some(64.0),
            height: Some(240.0),
            ..Default::default()
        };
        let out = normalize(&[RawPrediction::Structured(pred)], 640, 480).unwrap();
        let d = &out.detections[0];
        assert_eq!((d.x_center, d.y_center, d.width, d.height), (0.5, 0.25, 0.1, 0.5));
    }

    #[test]
    fn structured_missing_confidence_is_skipped() {
        let pred = StructuredPrediction {
            class_name: Some("person".into()),
            x: Some(1.0),
            y: Some(1.0),
            width: Some(1.0),
            height: Some(1.0),
            ..Default::default()
        };
        let out = normalize(&[RawPrediction::Structured(pred)], 10, 10).unwrap();
        assert_eq!(out.skipped[0].reason, SkipReason::MissingField("confidence"));
    }

    #[test]
    fn corners_shape_converts_to_center() {
        let pred = CornerPrediction {
            class_name: Some("car".into()),
            confidence: Some(0.9),
            x_min: 100.0,
            y_min: 100.0,
            x_max: 300.0,
            y_max: 200.0,
        };
        let out = normalize(&[RawPrediction::Corners(pred)], 400, 400).unwrap();
        let d = &out.detections[0];
        assert_eq!((d.x_center, d.y_center, d.width, d.height), (0.5, 0.375, 0.5, 0.25));
    }

    #[test]
    fn inverted_corners_are_skipped() {
        let pred = CornerPrediction {
            class_name: Some("car".into()),
            confidence: Some(0.9),
            x_min: 300.0,
            y_min: 100.0,
            x_max: 100.0,
            y_max: 200.0,
        };
        let out = normalize(&[RawPrediction::Corners(pred)], 400, 400).unwrap();
        assert_eq!(out.skipped[0].reason, SkipReason::InvalidBox);
    }

    #[test]
    fn out_of_range_confidence_is_skipped() {
        let out = normalize(&[record("go", 1.5, 1.0, 1.0, 1.0, 1.0)], 10, 10).unwrap();
        assert_eq!(out.skipped[0].reason, SkipReason::InvalidConfidence(1.5));
    }

    #[test]
    fn coordinates_are_clamped_to_unit_range() {
        let out = normalize(&[record("go", 0.5, 120.0, 50.0, 300.0, 10.0)], 100, 100).unwrap();
        let d = &out.detections[0];
        assert_eq!(d.x_center, 1.0);
        assert_eq!(d.width, 1.0);
    }

    #[test]
    fn preserves_model_order() {
        let preds: Vec<_> = (0..5)
            .map(|i| record(&format!("c{i}"), 0.5, 1.0, 1.0, 1.0, 1.0))
            .collect();
        let out = normalize(&preds, 10, 10).unwrap();
        let names: Vec<_> = out.detections.iter().map(|d| d.class_name.clone()).collect();
        assert_eq!(names, ["c0", "c1", "c2", "c3", "c4"]);
    }
}
