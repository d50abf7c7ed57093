//! Detection endpoint response document.
//!
//! ```json
//! { "objects": [ { "class": "USB", "box": [12, 40, 96, 110], "score": 0.93 } ] }
//! ```
//!
//! Boxes are `[x_min, y_min, x_max, y_max]` in the coordinate space of the
//! image that was sent. Unknown fields are ignored.

use serde::Deserialize;

use crate::{
    detection::{BBox, Detection},
    error::DetectError,
};

#[derive(Deserialize)]
struct WireResponse {
    objects: Option<Vec<WireObject>>,
}

#[derive(Deserialize)]
struct WireObject {
    class: String,
    #[serde(rename = "box")]
    bbox: [f32; 4],
    score: f32,
}

/// Parse a response body, dropping detections scored below `min_confidence`.
pub fn parse_detections(body: &[u8], min_confidence: f32) -> Result<Vec<Detection>, DetectError> {
    let response: WireResponse = serde_json::from_slice(body)
        .map_err(|err| DetectError::MalformedResponse(err.to_string()))?;
    let objects = response
        .objects
        .ok_or_else(|| DetectError::MalformedResponse("missing `objects` field".into()))?;

    let mut detections = Vec::with_capacity(objects.len());
    for object in objects {
        if !object.score.is_finite() || object.score < min_confidence {
            continue;
        }
        let [x_min, y_min, x_max, y_max] = object.bbox;
        detections.push(Detection {
            label: object.class,
            bbox: BBox::new(x_min, y_min, x_max, y_max),
            confidence: object.score.clamp(0.0, 1.0),
        });
    }
    Ok(detections)
}
