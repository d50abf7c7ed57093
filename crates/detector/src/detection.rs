use serde::Serialize;

/// Axis-aligned box as `(x_min, y_min, x_max, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    /// Map the box into another coordinate space. Axes scale independently.
    pub fn scaled(&self, scale: Scale) -> Self {
        Self {
            x_min: self.x_min * scale.x,
            y_min: self.y_min * scale.y,
            x_max: self.x_max * scale.x,
            y_max: self.y_max * scale.y,
        }
    }
}

/// Per-axis factors between two image resolutions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub x: f32,
    pub y: f32,
}

impl Scale {
    pub const IDENTITY: Scale = Scale { x: 1.0, y: 1.0 };

    /// Factors that map coordinates in a `from` sized image onto a `to` sized one.
    /// Degenerate sizes fall back to identity on that axis.
    pub fn between(from: (u32, u32), to: (u32, u32)) -> Self {
        let axis = |from: u32, to: u32| {
            if from == 0 || to == 0 {
                1.0
            } else {
                to as f32 / from as f32
            }
        };
        Self {
            x: axis(from.0, to.0),
            y: axis(from.1, to.1),
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            x: 1.0 / self.x,
            y: 1.0 / self.y,
        }
    }
}

/// One recognised object instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn rescaled(&self, scale: Scale) -> Self {
        Self {
            label: self.label.clone(),
            bbox: self.bbox.scaled(scale),
            confidence: self.confidence,
        }
    }
}

/// Detections for a single request, in detector-input coordinates.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    /// Resolution the image was resized to before it was sent.
    pub input_size: (u32, u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: BBox, b: BBox) {
        for (x, y) in [
            (a.x_min, b.x_min),
            (a.y_min, b.y_min),
            (a.x_max, b.x_max),
            (a.y_max, b.y_max),
        ] {
            assert!((x - y).abs() < 1e-3, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn boxes_scale_back_to_source_resolution() {
        let scale = Scale::between((700, 700), (1280, 720));
        let bbox = BBox::new(70.0, 350.0, 140.0, 700.0);
        let source = bbox.scaled(scale);
        assert_close(source, BBox::new(128.0, 360.0, 256.0, 720.0));
    }

    #[test]
    fn inverse_scale_round_trips() {
        let scale = Scale::between((700, 700), (1920, 1080));
        let boxes = [
            BBox::new(0.0, 0.0, 700.0, 700.0),
            BBox::new(13.5, 201.25, 88.0, 640.75),
            BBox::new(350.0, 1.0, 351.0, 2.0),
        ];
        for bbox in boxes {
            assert_close(bbox.scaled(scale).scaled(scale.inverse()), bbox);
        }
    }

    #[test]
    fn degenerate_sizes_keep_identity() {
        assert_eq!(Scale::between((0, 700), (640, 480)).x, 1.0);
        assert_eq!(Scale::between((700, 700), (700, 700)), Scale::IDENTITY);
    }
}
