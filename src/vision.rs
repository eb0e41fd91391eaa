//! Remote defect-detector client, the first estimation tier.
//!
//! The detector is an HTTP sidecar serving a YOLO-family model. It is
//! strictly optional: the client only exists when `DETECTOR_URL` is set, and
//! every failure here is absorbed by the pipeline driver.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::Detection;

const DEFAULT_TIMEOUT_MS: u64 = 4_000;
const CONFIDENCE_THRESHOLD: f64 = 0.25;
const IOU_THRESHOLD: f64 = 0.45;
const IMAGE_SIZE: u32 = 640;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl DetectorConfig {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("DETECTOR_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let timeout_ms = std::env::var("DETECTOR_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Some(Self {
            base_url,
            api_key: std::env::var("DETECTOR_API_KEY").ok(),
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("detector timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One successful detector round-trip.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub detections: Vec<Detection>,
    pub model_name: Option<String>,
    pub inference_ms: u64,
}

#[derive(Clone)]
pub struct DetectorClient {
    http: Client,
    config: DetectorConfig,
}

impl DetectorClient {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            http: build_client(config.timeout),
            config,
        }
    }

    pub fn from_env() -> Option<Self> {
        DetectorConfig::from_env().map(Self::new)
    }

    pub async fn detect(
        &self,
        image: &[u8],
        filename: &str,
    ) -> Result<DetectionOutcome, VisionError> {
        let base = self.config.base_url.trim_end_matches('/');
        let body = DetectRequest {
            image_b64: BASE64.encode(image),
            filename: filename.to_string(),
            conf: CONFIDENCE_THRESHOLD,
            iou: IOU_THRESHOLD,
            imgsz: IMAGE_SIZE,
        };

        let mut request = self.http.post(format!("{base}/detect")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                VisionError::Timeout
            } else {
                VisionError::Http(err.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(VisionError::Http(format!("HTTP {}", response.status())));
        }

        let payload: DetectResponse = response
            .json()
            .await
            .map_err(|err| VisionError::InvalidResponse(err.to_string()))?;
        let inference_ms = started.elapsed().as_millis() as u64;

        Ok(DetectionOutcome {
            detections: normalize_detections(payload.detections),
            model_name: payload.model,
            inference_ms,
        })
    }
}

/// Detector rows come from an external process; rows with malformed boxes
/// are dropped and confidences clamped into the unit interval.
fn normalize_detections(raw: Vec<RawDetection>) -> Vec<Detection> {
    let mut detections = Vec::with_capacity(raw.len());
    for row in raw {
        match row.bbox.as_slice() {
            [x1, y1, x2, y2] => detections.push(Detection {
                label: row.label,
                confidence: row.confidence.clamp(0.0, 1.0),
                bbox: [*x1, *y1, *x2, *y2],
            }),
            other => {
                debug!(
                    target = "ecoloop.vision",
                    coords = other.len(),
                    "dropping detection with malformed bbox"
                );
            }
        }
    }
    detections
}

/// Raw detector classes mapped to customer-facing labels; unmapped classes
/// pass through untouched.
pub fn friendly_label(raw: &str) -> &str {
    match raw {
        "glass_crack" => "Screen crack",
        "scratch" => "Scratch",
        "bent" => "Bent frame",
        "body_damage" => "Body damage",
        "pixel_defect" => "Display defect",
        other => other,
    }
}

fn build_client(timeout: Duration) -> Client {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Serialize)]
struct DetectRequest {
    image_b64: String,
    filename: String,
    conf: f64,
    iou: f64,
    imgsz: u32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    label: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    bbox: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friendly_labels_cover_detector_classes() {
        assert_eq!(friendly_label("glass_crack"), "Screen crack");
        assert_eq!(friendly_label("pixel_defect"), "Display defect");
        assert_eq!(friendly_label("rust_patch"), "rust_patch");
    }

    #[test]
    fn config_needs_a_url() {
        // Guard against ambient env leaking into the test.
        unsafe {
            std::env::remove_var("DETECTOR_URL");
        }
        assert!(DetectorConfig::from_env().is_none());
    }

    #[test]
    fn response_rows_with_bad_bboxes_are_dropped() {
        let payload: DetectResponse = serde_json::from_str(
            r#"{
                "model": "yolov8n-defects",
                "detections": [
                    {"label": "scratch", "confidence": 0.81, "bbox": [0.1, 0.2, 0.4, 0.5]},
                    {"label": "bent", "confidence": 0.4, "bbox": [0.1, 0.2]},
                    {"label": "glass_crack", "confidence": 1.7, "bbox": [0.0, 0.0, 1.0, 1.0]}
                ]
            }"#,
        )
        .expect("payload");

        let detections = normalize_detections(payload.detections);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "scratch");
        assert_eq!(detections[0].bbox, [0.1, 0.2, 0.4, 0.5]);
        assert_eq!(detections[1].confidence, 1.0);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let payload: DetectResponse = serde_json::from_str("{}").expect("payload");
        assert!(payload.model.is_none());
        assert!(payload.detections.is_empty());
    }
}
