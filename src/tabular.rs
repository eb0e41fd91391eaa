//! Learned tabular tier: a linear price head plus a logistic decision head,
//! loaded from a JSON manifest exported by the training job.
//!
//! The manifest names its feature columns, so feature-row construction is
//! driven by the file rather than hard-coded column order. The price head
//! predicts in the scale it was trained on; `PriceTransform` records how to
//! get back to currency units.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::DeviceSpecs;
use crate::rules;

const DEFAULT_SCREEN_SIZE: f64 = 6.1;
const DEFAULT_RELEASE_YEAR: f64 = 2020.0;
// Absent capacity fields contribute nothing to either head.
const DEFAULT_STORAGE_GB: f64 = 0.0;
const DEFAULT_RAM_GB: f64 = 0.0;

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("failed to read model manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model manifest lists unknown feature '{0}'")]
    UnknownFeature(String),
    #[error("{head} head has {weights} weights for {features} features")]
    ShapeMismatch {
        head: &'static str,
        weights: usize,
        features: usize,
    },
    #[error("prediction produced a non-finite value")]
    NonFinite,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceTransform {
    /// Head predicts currency units directly.
    Identity,
    /// Head predicts `ln(price / scale)`; invert with `exp(raw) * scale`.
    LogScaled { scale: f64 },
}

impl PriceTransform {
    pub fn invert(&self, raw: f64) -> f64 {
        match self {
            PriceTransform::Identity => raw,
            PriceTransform::LogScaled { scale } => raw.exp() * scale,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearHead {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogisticHead {
    pub weights: Vec<f64>,
    pub bias: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabularModel {
    pub version: String,
    pub transform: PriceTransform,
    pub features: Vec<String>,
    pub price: LinearHead,
    pub decision: LogisticHead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabularPrediction {
    pub price: f64,
    pub repair_recommended: bool,
}

impl TabularModel {
    pub fn from_json(raw: &str) -> Result<Self, TabularError> {
        let model: TabularModel = serde_json::from_str(raw)?;
        if model.price.weights.len() != model.features.len() {
            return Err(TabularError::ShapeMismatch {
                head: "price",
                weights: model.price.weights.len(),
                features: model.features.len(),
            });
        }
        if model.decision.weights.len() != model.features.len() {
            return Err(TabularError::ShapeMismatch {
                head: "decision",
                weights: model.decision.weights.len(),
                features: model.features.len(),
            });
        }
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, TabularError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Loads the manifest named by `TABULAR_MODEL_PATH`. Absent or broken
    /// manifests just disable the tier.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var("TABULAR_MODEL_PATH").ok()?;
        match Self::load(Path::new(&path)) {
            Ok(model) => {
                info!(
                    target = "ecoloop.tabular",
                    version = %model.version,
                    features = model.features.len(),
                    "tabular model loaded"
                );
                Some(model)
            }
            Err(err) => {
                warn!(
                    target = "ecoloop.tabular",
                    error = %err,
                    path = %path,
                    "tabular model unavailable; tier disabled"
                );
                None
            }
        }
    }

    pub fn predict(&self, specs: &DeviceSpecs) -> Result<TabularPrediction, TabularError> {
        let row = self.feature_row(specs)?;

        let raw: f64 = self
            .price
            .weights
            .iter()
            .zip(&row)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.price.intercept;
        let price = self.transform.invert(raw);
        if !price.is_finite() {
            return Err(TabularError::NonFinite);
        }

        let z: f64 = self
            .decision
            .weights
            .iter()
            .zip(&row)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.decision.bias;
        let repair_probability = 1.0 / (1.0 + (-z).exp());
        if !repair_probability.is_finite() {
            return Err(TabularError::NonFinite);
        }

        Ok(TabularPrediction {
            price,
            repair_recommended: repair_probability > 0.5,
        })
    }

    fn feature_row(&self, specs: &DeviceSpecs) -> Result<Vec<f64>, TabularError> {
        self.features
            .iter()
            .map(|name| feature_value(name, specs))
            .collect()
    }
}

fn feature_value(name: &str, specs: &DeviceSpecs) -> Result<f64, TabularError> {
    let os = brand_os(&specs.brand);
    let value = match name {
        "age_months" => rules::age_months(specs),
        "age_years" => rules::age_months(specs) / 12.0,
        "original_price" => rules::original_price(specs),
        "battery_health" => rules::battery_health(specs),
        "storage_gb" => specs
            .storage_gb
            .map(|v| v as f64)
            .unwrap_or(DEFAULT_STORAGE_GB),
        "ram_gb" => specs.ram_gb.map(|v| v as f64).unwrap_or(DEFAULT_RAM_GB),
        "issue_score" => (specs.defect_count + specs.screen_issues + specs.body_issues) as f64,
        "has_accessories" => {
            if specs.accessories.trim().is_empty() {
                0.0
            } else {
                1.0
            }
        }
        "screen_size" => DEFAULT_SCREEN_SIZE,
        "release_year" => DEFAULT_RELEASE_YEAR,
        "os_ios" => (os == BrandOs::Ios) as i64 as f64,
        "os_android" => (os == BrandOs::Android) as i64 as f64,
        "os_other" => (os == BrandOs::Other) as i64 as f64,
        other => return Err(TabularError::UnknownFeature(other.to_string())),
    };
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrandOs {
    Ios,
    Android,
    Other,
}

fn brand_os(brand: &str) -> BrandOs {
    let brand = brand.trim().to_lowercase();
    if brand.contains("apple") {
        BrandOs::Ios
    } else if matches!(brand.as_str(), "samsung" | "oneplus" | "xiaomi") {
        BrandOs::Android
    } else {
        BrandOs::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Intent;

    fn manifest(features: &[&str], price_w: &[f64], decision_w: &[f64]) -> String {
        serde_json::json!({
            "version": "2024.3",
            "transform": {"kind": "identity"},
            "features": features,
            "price": {"weights": price_w, "intercept": 0.0},
            "decision": {"weights": decision_w, "bias": 0.0},
        })
        .to_string()
    }

    fn specs() -> DeviceSpecs {
        DeviceSpecs {
            category: "mobile".to_string(),
            brand: "Apple".to_string(),
            model: "iPhone 12".to_string(),
            age_months: Some(24.0),
            original_price: Some(20000.0),
            defect_count: 1,
            battery_health: Some(80.0),
            storage_gb: Some(128),
            ram_gb: None,
            screen_issues: 1,
            body_issues: 0,
            accessories: "charger, box".to_string(),
            city: "Bengaluru".to_string(),
            lat: None,
            lon: None,
            intent: Intent::Sell,
        }
    }

    #[test]
    fn identity_head_predicts_in_currency_units() {
        let model =
            TabularModel::from_json(&manifest(&["original_price"], &[0.9], &[0.0])).expect("model");
        let pred = model.predict(&specs()).expect("prediction");
        assert!((pred.price - 18000.0).abs() < 1e-9);
    }

    #[test]
    fn log_scaled_transform_inverts() {
        let t = PriceTransform::LogScaled { scale: 100.0 };
        let raw = (18560.0_f64 / 100.0).ln();
        assert!((t.invert(raw) - 18560.0).abs() < 1e-6);
        assert_eq!(PriceTransform::Identity.invert(4321.0), 4321.0);
    }

    #[test]
    fn weight_shape_is_validated() {
        let err = TabularModel::from_json(&manifest(&["age_years", "issue_score"], &[0.5], &[
            0.1, 0.2,
        ]))
        .expect_err("shape mismatch");
        assert!(matches!(err, TabularError::ShapeMismatch { head: "price", .. }));
    }

    #[test]
    fn unknown_feature_is_rejected_at_predict() {
        let model =
            TabularModel::from_json(&manifest(&["shoe_size"], &[1.0], &[1.0])).expect("model");
        let err = model.predict(&specs()).expect_err("unknown feature");
        assert!(matches!(err, TabularError::UnknownFeature(name) if name == "shoe_size"));
    }

    #[test]
    fn derived_features_follow_documented_rules() {
        let s = specs();
        assert_eq!(feature_value("age_years", &s).expect("age_years"), 2.0);
        assert_eq!(feature_value("issue_score", &s).expect("issue_score"), 2.0);
        assert_eq!(
            feature_value("has_accessories", &s).expect("has_accessories"),
            1.0
        );
        assert_eq!(feature_value("screen_size", &s).expect("screen_size"), 6.1);
        assert_eq!(
            feature_value("release_year", &s).expect("release_year"),
            2020.0
        );
        assert_eq!(feature_value("os_ios", &s).expect("os_ios"), 1.0);
        assert_eq!(feature_value("os_android", &s).expect("os_android"), 0.0);

        let mut bare = specs();
        bare.accessories = "   ".to_string();
        assert_eq!(
            feature_value("has_accessories", &bare).expect("has_accessories"),
            0.0
        );
    }

    #[test]
    fn absent_capacity_fields_contribute_zero() {
        let present = specs();
        assert_eq!(
            feature_value("storage_gb", &present).expect("storage_gb"),
            128.0
        );

        let mut sparse = specs();
        sparse.storage_gb = None;
        sparse.ram_gb = None;
        assert_eq!(feature_value("storage_gb", &sparse).expect("storage_gb"), 0.0);
        assert_eq!(feature_value("ram_gb", &sparse).expect("ram_gb"), 0.0);
    }

    #[test]
    fn brand_os_inference() {
        assert_eq!(brand_os(" Apple Inc "), BrandOs::Ios);
        assert_eq!(brand_os("samsung"), BrandOs::Android);
        assert_eq!(brand_os("OnePlus"), BrandOs::Android);
        assert_eq!(brand_os("Nokia"), BrandOs::Other);
    }

    #[test]
    fn decision_head_thresholds_at_half() {
        let raw = serde_json::json!({
            "version": "2024.3",
            "transform": {"kind": "identity"},
            "features": ["issue_score"],
            "price": {"weights": [0.0], "intercept": 9000.0},
            "decision": {"weights": [-1.0], "bias": 1.5},
        })
        .to_string();
        let model = TabularModel::from_json(&raw).expect("model");

        // issue_score 2 gives z = -0.5, probability under one half.
        let pred = model.predict(&specs()).expect("prediction");
        assert!(!pred.repair_recommended);

        let mut clean = specs();
        clean.defect_count = 0;
        clean.screen_issues = 0;
        let pred = model.predict(&clean).expect("prediction");
        assert!(pred.repair_recommended);
    }

    #[test]
    fn non_finite_prediction_is_an_error() {
        let raw = serde_json::json!({
            "version": "2024.3",
            "transform": {"kind": "log_scaled", "scale": 100.0},
            "features": ["original_price"],
            "price": {"weights": [1.0], "intercept": 0.0},
            "decision": {"weights": [0.0], "bias": 0.0},
        })
        .to_string();
        let model = TabularModel::from_json(&raw).expect("model");
        // exp(20000) overflows to infinity.
        let err = model.predict(&specs()).expect_err("overflow");
        assert!(matches!(err, TabularError::NonFinite));
    }
}
