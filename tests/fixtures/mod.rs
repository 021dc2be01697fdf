//! Detection results used across tests.
#![allow(dead_code)]

use fruit_inference_jobs::models::detection::{
    BoundingBox, Detection, DetectionResult, RipenessStage,
};

pub fn detection(
    class_name: &str,
    confidence: f64,
    ripeness: RipenessStage,
    ripeness_score: f64,
) -> Detection {
    Detection {
        class_name: class_name.to_string(),
        confidence,
        bounding_box: BoundingBox {
            x: 0.1,
            y: 0.15,
            width: 0.35,
            height: 0.4,
        },
        ripeness: Some(ripeness),
        ripeness_score: Some(ripeness_score),
        days_until_spoilage: None,
    }
}

/// A ripe banana and an unripe apple, in that order.
pub fn banana_and_apple() -> DetectionResult {
    DetectionResult::new(
        Some("req-banana-apple".to_string()),
        vec![
            detection("banana", 0.91, RipenessStage::Ripe, 0.82),
            detection("apple", 0.40, RipenessStage::Unripe, 0.18),
        ],
        Some(37),
    )
}

/// Service JSON equivalent of `banana_and_apple`.
pub fn banana_and_apple_json() -> serde_json::Value {
    serde_json::json!({
        "status": "success",
        "request_id": "req-banana-apple",
        "results": [
            {
                "class": "banana",
                "confidence": 0.91,
                "bounding_box": [0.1, 0.15, 0.35, 0.4],
                "maturation_level": { "score": 0.82, "category": "ripe" }
            },
            {
                "class": "apple",
                "confidence": 0.40,
                "bounding_box": [0.1, 0.15, 0.35, 0.4],
                "maturation_level": { "score": 0.18, "category": "unripe" }
            }
        ],
        "summary": { "detection_time_ms": 37 }
    })
}
