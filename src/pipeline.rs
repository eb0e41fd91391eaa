use crate::metrics;
use crate::models::{
    ConditionAssessment, Decision, Detection, DeviceSpecs, EstimationResult, MethodTier,
    Predictions,
};
use crate::rules;
use crate::tabular::TabularModel;
use crate::vision::{self, DetectionOutcome, DetectorClient};
use std::{cmp::Ordering, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

pub const PRICE_FLOOR_ABS: i64 = 100;
pub const PRICE_FLOOR_FRACTION: f64 = 0.05;

/// Tiered estimator: vision detection when a detector is reachable, then the
/// learned tabular model, then the deterministic rules. Tier failures are
/// absorbed; the rules tier cannot fail, so `estimate` is total.
#[derive(Clone)]
pub struct Estimator {
    pub config: Arc<EstimatorConfig>,
}

pub struct EstimatorConfig {
    pub detector: Option<DetectorClient>,
    pub tabular: Option<TabularModel>,
}

pub struct ImageUpload<'a> {
    pub bytes: &'a [u8],
    pub filename: &'a str,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Self {
        let detector = DetectorClient::from_env();
        let tabular = TabularModel::from_env();
        info!(
            target = "ecoloop.pipeline",
            vision = detector.is_some(),
            tabular = tabular.is_some(),
            "estimation tiers configured"
        );
        Self::new(EstimatorConfig { detector, tabular })
    }

    pub fn demo() -> Self {
        Self::new(EstimatorConfig {
            detector: None,
            tabular: None,
        })
    }

    pub async fn estimate(
        &self,
        specs: &DeviceSpecs,
        image: Option<ImageUpload<'_>>,
    ) -> EstimationResult {
        if let (Some(detector), Some(upload)) = (self.config.detector.as_ref(), image.as_ref()) {
            let started = Instant::now();
            match detector.detect(upload.bytes, upload.filename).await {
                Ok(outcome) if !outcome.detections.is_empty() => {
                    metrics::stage_elapsed("vision_detect", started.elapsed().as_millis());
                    metrics::tier_used("vision");
                    return vision_result(specs, outcome);
                }
                Ok(_) => {
                    metrics::stage_elapsed("vision_detect", started.elapsed().as_millis());
                    debug!(
                        target = "ecoloop.pipeline",
                        "detector found nothing; trying next tier"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "ecoloop.pipeline",
                        error = %err,
                        "vision_tier_fallback"
                    );
                }
            }
        }

        if let Some(model) = self.config.tabular.as_ref() {
            let started = Instant::now();
            match model.predict(specs) {
                Ok(prediction) => {
                    let elapsed = started.elapsed().as_millis();
                    metrics::stage_elapsed("tabular_predict", elapsed);
                    metrics::tier_used("tabular");
                    return tabular_result(
                        specs,
                        model,
                        prediction.price,
                        prediction.repair_recommended,
                        elapsed,
                    );
                }
                Err(err) => {
                    warn!(
                        target = "ecoloop.pipeline",
                        error = %err,
                        model = %model.version,
                        "tabular_tier_fallback"
                    );
                }
            }
        }

        metrics::tier_used("rules");
        rules_result(specs)
    }
}

fn vision_result(specs: &DeviceSpecs, outcome: DetectionOutcome) -> EstimationResult {
    let rule = rules::estimate(specs);
    let detections: Vec<Detection> = outcome
        .detections
        .into_iter()
        .map(|det| Detection {
            label: vision::friendly_label(&det.label).to_string(),
            confidence: det.confidence,
            bbox: det.bbox,
        })
        .collect();

    // Condition comes from the strongest detection; pricing still leans on
    // the rule formulas because the detector only sees surface damage.
    let image_condition = detections
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal)
        })
        .map(|det| ConditionAssessment {
            label: det.label.clone(),
            confidence: (det.confidence * 100.0).round() / 100.0,
        })
        .unwrap_or_else(|| rule.condition.clone());

    let original = rules::original_price(specs);
    let mut predictions = rule.predictions;
    predictions.price_suggest = apply_floor(predictions.price_suggest, original);

    EstimationResult {
        method: MethodTier::Vision,
        model_name: outcome.model_name,
        inference_ms: Some(outcome.inference_ms),
        detections,
        image_condition,
        predictions,
        price_explanation: rule.explanation,
        nearby_partners: Vec::new(),
    }
}

fn tabular_result(
    specs: &DeviceSpecs,
    model: &TabularModel,
    raw_price: f64,
    repair_recommended: bool,
    elapsed_ms: u128,
) -> EstimationResult {
    let rule = rules::estimate(specs);
    let original = rules::original_price(specs);
    let price = apply_floor(raw_price.round() as i64, original);

    let decision = if repair_recommended {
        Decision::Repair
    } else if price as f64 >= 0.15 * original {
        Decision::Resell
    } else {
        Decision::Recycle
    };

    let predictions = Predictions {
        price_suggest: price,
        rul_months: rule.predictions.rul_months,
        decision,
        co2_saved_kg: rules::co2_saved_kg(price, original),
    };

    EstimationResult {
        method: MethodTier::Tabular,
        model_name: Some(model.version.clone()),
        inference_ms: Some(elapsed_ms as u64),
        detections: Vec::new(),
        image_condition: rule.condition,
        predictions,
        price_explanation: format!(
            "Learned estimate: model {} suggests a resale value near {}",
            model.version, price
        ),
        nearby_partners: Vec::new(),
    }
}

fn rules_result(specs: &DeviceSpecs) -> EstimationResult {
    let rule = rules::estimate(specs);
    let original = rules::original_price(specs);
    let mut predictions = rule.predictions;
    predictions.price_suggest = apply_floor(predictions.price_suggest, original);

    EstimationResult {
        method: MethodTier::Rules,
        model_name: None,
        inference_ms: None,
        detections: Vec::new(),
        image_condition: rule.condition,
        predictions,
        price_explanation: rule.explanation,
        nearby_partners: Vec::new(),
    }
}

/// Every tier's price obeys `max(100, 5% of original)`. Guards against
/// degenerate model outputs, not against the rule formulas.
fn apply_floor(price: i64, original_price: f64) -> i64 {
    let floor = (original_price * PRICE_FLOOR_FRACTION)
        .max(PRICE_FLOOR_ABS as f64)
        .ceil() as i64;
    price.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mobile_specs() -> DeviceSpecs {
        DeviceSpecs {
            category: "mobile".to_string(),
            age_months: Some(24.0),
            original_price: Some(20000.0),
            battery_health: Some(80.0),
            ..DeviceSpecs::default()
        }
    }

    fn model_from(manifest: &str) -> TabularModel {
        TabularModel::from_json(manifest).expect("manifest parses")
    }

    #[tokio::test]
    async fn rules_tier_when_nothing_is_configured() {
        let estimator = Estimator::demo();
        let result = estimator.estimate(&mobile_specs(), None).await;
        assert_eq!(result.method, MethodTier::Rules);
        assert_eq!(result.predictions.price_suggest, 18560);
        assert_eq!(result.predictions.decision, Decision::Repair);
        assert_eq!(result.image_condition.label, "Good");
        assert!(result.model_name.is_none());
        assert!(result.detections.is_empty());
    }

    #[tokio::test]
    async fn tabular_tier_supplies_price_and_decision() {
        let manifest = r#"{
            "version": "tab-test-1",
            "transform": {"kind": "identity"},
            "features": ["age_months"],
            "price": {"weights": [0.0], "intercept": 5000.0},
            "decision": {"weights": [0.0], "bias": 10.0}
        }"#;
        let estimator = Estimator::new(EstimatorConfig {
            detector: None,
            tabular: Some(model_from(manifest)),
        });
        let result = estimator.estimate(&mobile_specs(), None).await;
        assert_eq!(result.method, MethodTier::Tabular);
        assert_eq!(result.model_name.as_deref(), Some("tab-test-1"));
        assert_eq!(result.predictions.price_suggest, 5000);
        assert_eq!(result.predictions.decision, Decision::Repair);
        // RUL and CO2 still layered in from the rule formulas.
        assert_eq!(result.predictions.rul_months, 24);
        assert!((result.predictions.co2_saved_kg - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tabular_price_is_floored() {
        let manifest = r#"{
            "version": "tab-test-2",
            "transform": {"kind": "identity"},
            "features": ["age_months"],
            "price": {"weights": [0.0], "intercept": 10.0},
            "decision": {"weights": [0.0], "bias": -10.0}
        }"#;
        let estimator = Estimator::new(EstimatorConfig {
            detector: None,
            tabular: Some(model_from(manifest)),
        });
        let result = estimator.estimate(&mobile_specs(), None).await;
        // Floor is 5% of 20000.
        assert_eq!(result.predictions.price_suggest, 1000);
        assert_eq!(result.predictions.decision, Decision::Recycle);
    }

    #[tokio::test]
    async fn broken_tabular_model_falls_through_to_rules() {
        // log_scaled with a huge weight overflows exp() into infinity.
        let manifest = r#"{
            "version": "tab-test-3",
            "transform": {"kind": "log_scaled", "scale": 100.0},
            "features": ["age_months"],
            "price": {"weights": [1000.0], "intercept": 0.0},
            "decision": {"weights": [0.0], "bias": 0.0}
        }"#;
        let estimator = Estimator::new(EstimatorConfig {
            detector: None,
            tabular: Some(model_from(manifest)),
        });
        let result = estimator.estimate(&mobile_specs(), None).await;
        assert_eq!(result.method, MethodTier::Rules);
        assert_eq!(result.predictions.price_suggest, 18560);
    }

    #[test]
    fn floor_tracks_original_price() {
        assert_eq!(apply_floor(0, 500.0), 100);
        assert_eq!(apply_floor(-250, 500.0), 100);
        assert_eq!(apply_floor(50, 20000.0), 1000);
        assert_eq!(apply_floor(5000, 20000.0), 5000);
    }
}
