//! Turns detections into a pass/fail verdict against the expected bill of
//! materials.

use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr};

use clap::ValueEnum;
use detector::Detection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::InferenceResult;

/// How observed counts are compared with the expected ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// Each expected part must be present, and no more often than its
    /// expected count (normally 1). A duplicate is a defect of its own.
    Presence,
    /// Each expected part must appear exactly its expected number of times.
    ExactCount,
}

impl CompositionMode {
    fn accepts(self, observed: u32, expected: u32) -> bool {
        match self {
            CompositionMode::Presence => observed >= 1 && observed <= expected,
            CompositionMode::ExactCount => observed == expected,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("expected composition lists no parts")]
    Empty,
    #[error("expected count for {0:?} must be at least 1")]
    ZeroCount(String),
    #[error("invalid part spec {0:?}, expected LABEL or LABEL=COUNT")]
    InvalidPart(String),
    #[error("failed to read composition file {path}: {message}")]
    File { path: String, message: String },
}

/// Expected bill of materials. Loaded once, immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedComposition {
    mode: CompositionMode,
    parts: BTreeMap<String, u32>,
}

impl ExpectedComposition {
    pub fn new<I, S>(mode: CompositionMode, parts: I) -> Result<Self, CompositionError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let composition = Self {
            mode,
            parts: parts
                .into_iter()
                .map(|(label, count)| (label.into(), count))
                .collect(),
        };
        composition.validate()?;
        Ok(composition)
    }

    /// Build from `LABEL` / `LABEL=COUNT` specs. A bare label counts as 1.
    pub fn from_specs(mode: CompositionMode, specs: &[PartSpec]) -> Result<Self, CompositionError> {
        Self::new(
            mode,
            specs.iter().map(|spec| (spec.label.clone(), spec.count)),
        )
    }

    /// Load `{ "mode": "presence", "parts": { "USB": 1 } }` from disk.
    pub fn from_json_file(path: &Path) -> Result<Self, CompositionError> {
        let file_error = |message: String| CompositionError::File {
            path: path.display().to_string(),
            message,
        };
        let raw = fs::read_to_string(path).map_err(|err| file_error(err.to_string()))?;
        let composition: Self =
            serde_json::from_str(&raw).map_err(|err| file_error(err.to_string()))?;
        composition.validate()?;
        Ok(composition)
    }

    fn validate(&self) -> Result<(), CompositionError> {
        if self.parts.is_empty() {
            return Err(CompositionError::Empty);
        }
        if let Some((label, _)) = self.parts.iter().find(|(_, count)| **count == 0) {
            return Err(CompositionError::ZeroCount(label.clone()));
        }
        Ok(())
    }

    pub fn mode(&self) -> CompositionMode {
        self.mode
    }

    pub fn parts(&self) -> &BTreeMap<String, u32> {
        &self.parts
    }
}

impl fmt::Display for ExpectedComposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .parts
            .iter()
            .map(|(label, count)| format!("{label}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{:?} [{parts}]", self.mode)
    }
}

/// `LABEL` or `LABEL=COUNT` as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartSpec {
    pub label: String,
    pub count: u32,
}

impl FromStr for PartSpec {
    type Err = CompositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CompositionError::InvalidPart(s.to_string());
        let (label, count) = match s.rsplit_once('=') {
            Some((label, count)) => (label, count.trim().parse().map_err(|_| invalid())?),
            None => (s, 1),
        };
        let label = label.trim();
        if label.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            label: label.to_string(),
            count,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Compliant,
    Defective,
    /// Nothing was detected: the inspection itself failed, not the product.
    NoDetection,
}

impl VerdictStatus {
    pub fn label(self) -> &'static str {
        match self {
            VerdictStatus::Compliant => "compliant",
            VerdictStatus::Defective => "defective",
            VerdictStatus::NoDetection => "no_detection",
        }
    }
}

/// Outcome of inspecting one product.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComplianceVerdict {
    pub status: VerdictStatus,
    /// Detections per label, including labels that are not expected.
    pub observed_counts: BTreeMap<String, u32>,
    /// Expected labels whose count is wrong, in label order.
    pub missing_or_excess: Vec<String>,
    /// Detections rescaled to source-image coordinates.
    pub detections: Vec<Detection>,
}

/// Judge one inference result against the expected composition.
///
/// Pure: the verdict depends only on the arguments. Labels the composition
/// does not mention are counted but never affect the status.
pub fn decide(result: &InferenceResult, expected: &ExpectedComposition) -> ComplianceVerdict {
    let mut observed_counts = BTreeMap::new();
    for detection in &result.detections {
        *observed_counts.entry(detection.label.clone()).or_insert(0) += 1;
    }

    let scale = result.source_scale();
    let detections = result
        .detections
        .iter()
        .map(|detection| detection.rescaled(scale))
        .collect();

    if result.detections.is_empty() {
        return ComplianceVerdict {
            status: VerdictStatus::NoDetection,
            observed_counts,
            missing_or_excess: Vec::new(),
            detections,
        };
    }

    let missing_or_excess: Vec<String> = expected
        .parts
        .iter()
        .filter(|(label, expected_count)| {
            let observed = observed_counts.get(*label).copied().unwrap_or(0);
            !expected.mode.accepts(observed, **expected_count)
        })
        .map(|(label, _)| label.clone())
        .collect();

    let status = if missing_or_excess.is_empty() {
        VerdictStatus::Compliant
    } else {
        VerdictStatus::Defective
    };

    ComplianceVerdict {
        status,
        observed_counts,
        missing_or_excess,
        detections,
    }
}

#[cfg(test)]
mod tests {
    use detector::{BBox, DetectionBatch};
    use video_ingest::{Frame, FrameFormat};

    use super::*;

    fn result_with(labels: &[&str]) -> InferenceResult {
        let frame = Frame::new(vec![0; 1400 * 700 * 3], 1400, 700, FrameFormat::Bgr8).unwrap();
        let detections = labels
            .iter()
            .map(|label| Detection {
                label: label.to_string(),
                bbox: BBox::new(10.0, 20.0, 110.0, 220.0),
                confidence: 0.9,
            })
            .collect();
        InferenceResult::from_batch(
            1,
            frame,
            DetectionBatch {
                detections,
                input_size: (700, 700),
            },
        )
    }

    fn pico_presence() -> ExpectedComposition {
        ExpectedComposition::new(
            CompositionMode::Presence,
            [("USB", 1), ("OSCILLATOR", 1), ("CHIPSET", 1), ("BOOTSEL", 1)],
        )
        .unwrap()
    }

    #[test]
    fn complete_board_is_compliant() {
        let verdict = decide(
            &result_with(&["USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"]),
            &pico_presence(),
        );
        assert_eq!(verdict.status, VerdictStatus::Compliant);
        assert!(verdict.missing_or_excess.is_empty());
        assert_eq!(verdict.observed_counts["USB"], 1);
    }

    #[test]
    fn duplicate_part_is_defective_in_presence_mode() {
        let verdict = decide(
            &result_with(&["USB", "USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"]),
            &pico_presence(),
        );
        assert_eq!(verdict.status, VerdictStatus::Defective);
        assert_eq!(verdict.missing_or_excess, vec!["USB".to_string()]);
        assert_eq!(verdict.observed_counts["USB"], 2);
    }

    #[test]
    fn missing_part_is_defective_in_presence_mode() {
        let verdict = decide(&result_with(&["USB", "CHIPSET", "BOOTSEL"]), &pico_presence());
        assert_eq!(verdict.status, VerdictStatus::Defective);
        assert_eq!(verdict.missing_or_excess, vec!["OSCILLATOR".to_string()]);
    }

    #[test]
    fn presence_mode_ignores_unexpected_labels() {
        let verdict = decide(
            &result_with(&["USB", "OSCILLATOR", "CHIPSET", "BOOTSEL", "HOLE", "HOLE"]),
            &pico_presence(),
        );
        assert_eq!(verdict.status, VerdictStatus::Compliant);
        assert_eq!(verdict.observed_counts["HOLE"], 2);
    }

    #[test]
    fn presence_mode_is_compliant_only_with_exactly_one_of_each() {
        let composition = pico_presence();
        let all = ["USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"];
        // Every combination of 0..=2 copies of each part.
        for mask in 0..81u32 {
            let mut labels = Vec::new();
            let mut all_single = true;
            let mut code = mask;
            for label in all {
                let copies = code % 3;
                code /= 3;
                all_single &= copies == 1;
                for _ in 0..copies {
                    labels.push(label);
                }
            }
            if labels.is_empty() {
                continue;
            }
            let verdict = decide(&result_with(&labels), &composition);
            assert_eq!(
                verdict.status == VerdictStatus::Compliant,
                all_single,
                "labels {labels:?}"
            );
        }
    }

    #[test]
    fn exact_count_reports_observed_shortfall() {
        let composition = ExpectedComposition::new(CompositionMode::ExactCount, [("PART", 9)]).unwrap();
        let verdict = decide(&result_with(&["PART"; 8]), &composition);
        assert_eq!(verdict.status, VerdictStatus::Defective);
        assert_eq!(verdict.observed_counts["PART"], 8);
        assert_eq!(verdict.missing_or_excess, vec!["PART".to_string()]);

        let verdict = decide(&result_with(&["PART"; 9]), &composition);
        assert_eq!(verdict.status, VerdictStatus::Compliant);

        let verdict = decide(&result_with(&["PART"; 10]), &composition);
        assert_eq!(verdict.status, VerdictStatus::Defective);
    }

    #[test]
    fn empty_result_is_no_detection_in_every_mode() {
        let exact = ExpectedComposition::new(CompositionMode::ExactCount, [("PART", 9)]).unwrap();
        for composition in [pico_presence(), exact] {
            let verdict = decide(&result_with(&[]), &composition);
            assert_eq!(verdict.status, VerdictStatus::NoDetection);
            assert!(verdict.missing_or_excess.is_empty());
            assert!(verdict.observed_counts.is_empty());
        }
    }

    #[test]
    fn decide_is_repeatable() {
        let result = result_with(&["USB", "USB", "CHIPSET"]);
        let composition = pico_presence();
        assert_eq!(decide(&result, &composition), decide(&result, &composition));
    }

    #[test]
    fn detections_are_reported_in_source_coordinates() {
        let verdict = decide(&result_with(&["USB"]), &pico_presence());
        let bbox = verdict.detections[0].bbox;
        assert_eq!(bbox, BBox::new(20.0, 20.0, 220.0, 220.0));
    }

    #[test]
    fn part_specs_parse_with_default_count() {
        assert_eq!(
            "USB".parse::<PartSpec>().unwrap(),
            PartSpec {
                label: "USB".into(),
                count: 1
            }
        );
        assert_eq!(
            "RASPBERRY PICO=9".parse::<PartSpec>().unwrap(),
            PartSpec {
                label: "RASPBERRY PICO".into(),
                count: 9
            }
        );
        assert!("=3".parse::<PartSpec>().is_err());
        assert!("USB=many".parse::<PartSpec>().is_err());
    }

    #[test]
    fn composition_validation() {
        let empty: [(&str, u32); 0] = [];
        assert!(matches!(
            ExpectedComposition::new(CompositionMode::Presence, empty),
            Err(CompositionError::Empty)
        ));
        assert!(matches!(
            ExpectedComposition::new(CompositionMode::ExactCount, [("PART", 0)]),
            Err(CompositionError::ZeroCount(_))
        ));
    }

    #[test]
    fn composition_loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.json");
        fs::write(
            &path,
            r#"{"mode": "exact_count", "parts": {"RASPBERRY PICO": 9, "USB": 9}}"#,
        )
        .unwrap();
        let composition = ExpectedComposition::from_json_file(&path).unwrap();
        assert_eq!(composition.mode(), CompositionMode::ExactCount);
        assert_eq!(composition.parts()["RASPBERRY PICO"], 9);
    }
}
