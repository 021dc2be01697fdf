use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Ripeness scale reported per detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RipenessStage {
    Unripe,
    Ripe,
    Overripe,
}

impl RipenessStage {
    /// Map a model category label onto the fixed scale. Unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "unripe" | "green" | "immature" | "not_ripe" => Some(RipenessStage::Unripe),
            "ripe" | "mature" | "ready" => Some(RipenessStage::Ripe),
            "overripe" | "over_ripe" | "rotten" | "spoiled" | "spoiling" => {
                Some(RipenessStage::Overripe)
            }
            _ => None,
        }
    }
}

/// Normalised bounding region, all coordinates in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate)]
pub struct BoundingBox {
    #[garde(range(min = 0.0, max = 1.0))]
    pub x: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub y: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub width: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub height: f64,
}

/// One detected fruit. Confidence and ripeness are independent: a detection
/// may carry no ripeness when the model has no scale for its class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct Detection {
    #[garde(length(min = 1, max = 100))]
    pub class_name: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(dive)]
    pub bounding_box: BoundingBox,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ripeness: Option<RipenessStage>,

    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ripeness_score: Option<f64>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_until_spoilage: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DetectionSummary {
    pub total_objects: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_ripeness_score: Option<f64>,
}

/// Ordered detection list returned by the inference service for one image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct DetectionResult {
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[garde(dive)]
    pub detections: Vec<Detection>,

    #[garde(skip)]
    pub summary: DetectionSummary,
}

impl DetectionResult {
    pub fn new(
        request_id: Option<String>,
        detections: Vec<Detection>,
        detection_time_ms: Option<u64>,
    ) -> Self {
        let scores: Vec<f64> = detections.iter().filter_map(|d| d.ripeness_score).collect();
        let average_ripeness_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        let summary = DetectionSummary {
            total_objects: detections.len(),
            detection_time_ms,
            average_ripeness_score,
        };

        Self {
            request_id,
            detections,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class_name: &str, confidence: f64, score: Option<f64>) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            confidence,
            bounding_box: BoundingBox {
                x: 0.1,
                y: 0.2,
                width: 0.3,
                height: 0.4,
            },
            ripeness: score.map(|_| RipenessStage::Ripe),
            ripeness_score: score,
            days_until_spoilage: None,
        }
    }

    #[test]
    fn test_ripeness_label_mapping() {
        assert_eq!(RipenessStage::from_label("ripe"), Some(RipenessStage::Ripe));
        assert_eq!(RipenessStage::from_label("Green"), Some(RipenessStage::Unripe));
        assert_eq!(RipenessStage::from_label("over-ripe"), Some(RipenessStage::Overripe));
        assert_eq!(RipenessStage::from_label("rotten"), Some(RipenessStage::Overripe));
        assert_eq!(RipenessStage::from_label("purple"), None);
    }

    #[test]
    fn test_summary_computed_from_detections() {
        let result = DetectionResult::new(
            Some("req-1".to_string()),
            vec![
                detection("banana", 0.91, Some(0.8)),
                detection("apple", 0.40, Some(0.2)),
                detection("orange", 0.77, None),
            ],
            Some(450),
        );

        assert_eq!(result.summary.total_objects, 3);
        assert_eq!(result.summary.detection_time_ms, Some(450));
        let avg = result.summary.average_ripeness_score.unwrap();
        assert!((avg - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_out_of_range_fails_validation() {
        let result = DetectionResult::new(None, vec![detection("banana", 1.4, None)], None);
        assert!(result.validate().is_err());

        let ok = DetectionResult::new(None, vec![detection("banana", 0.9, Some(0.7))], None);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_detection_without_ripeness_omits_fields() {
        let json = serde_json::to_value(detection("kiwi", 0.95, None)).unwrap();
        assert!(json.get("ripeness").is_none());
        assert_eq!(json["confidence"], 0.95);
    }
}
