//! Deterministic rule-based estimator, the last tier of the pipeline.
//!
//! Pure arithmetic over the specs payload. It has no external dependency and
//! never fails, which is what lets the estimation pipeline promise a result
//! for every accepted submission.

use crate::models::{ConditionAssessment, Decision, DeviceSpecs, Predictions};

pub const DEFAULT_AGE_MONTHS: f64 = 24.0;
pub const DEFAULT_ORIGINAL_PRICE: f64 = 20000.0;
pub const DEFAULT_BATTERY_HEALTH: f64 = 80.0;

/// Rounded price never drops below this, whatever the wear score says.
const MIN_PRICE: i64 = 500;

/// Battery wear kicks in below this health percentage.
const BATTERY_HEALTHY_PCT: f64 = 80.0;

#[derive(Debug, Clone)]
pub struct RuleEstimate {
    pub condition: ConditionAssessment,
    pub predictions: Predictions,
    pub explanation: String,
}

pub fn estimate(specs: &DeviceSpecs) -> RuleEstimate {
    let age = age_months(specs);
    let orig = original_price(specs);
    let wear = wear_score(specs);

    let deduction = (wear / 10.0).min(0.85);
    let price = round_to_ten(orig * (1.0 - deduction)).max(MIN_PRICE);
    let rul = rul_months(specs);
    let decision = decision_for(price, orig, rul);

    let explanation = format!(
        "Rule estimate: wear {:.2} over {:.0} months gives a {:.1}% deduction on original price {:.0}",
        wear,
        age,
        deduction * 100.0,
        orig,
    );

    RuleEstimate {
        condition: condition(specs),
        predictions: Predictions {
            price_suggest: price,
            rul_months: rul,
            decision,
            co2_saved_kg: co2_saved_kg(price, orig),
        },
        explanation,
    }
}

/// Weighted wear score. Age, screen, body and defect counts always count;
/// battery only counts once it drops below the healthy threshold.
pub fn wear_score(specs: &DeviceSpecs) -> f64 {
    let age = age_months(specs);
    let battery = battery_health(specs);
    let battery_term = if battery < BATTERY_HEALTHY_PCT {
        ((90.0 - battery) * 0.02).max(0.0)
    } else {
        0.0
    };
    0.03 * age
        + 0.5 * specs.screen_issues as f64
        + 0.3 * specs.body_issues as f64
        + 0.7 * specs.defect_count as f64
        + battery_term
}

pub fn condition(specs: &DeviceSpecs) -> ConditionAssessment {
    let defects = specs.defect_count;
    let screen = specs.screen_issues;
    let body = specs.body_issues;
    let (label, confidence) = if defects == 0 && screen == 0 && body == 0 {
        ("Good", 0.85)
    } else if defects <= 1 && screen + body <= 1 {
        ("Fair", 0.7)
    } else {
        ("Poor", 0.6)
    };
    ConditionAssessment {
        label: label.to_string(),
        confidence,
    }
}

/// Remaining useful life in months against a per-category base life.
pub fn rul_months(specs: &DeviceSpecs) -> i64 {
    let base = base_life_months(&specs.category);
    let remaining = base
        - age_months(specs)
        - 4.0 * specs.defect_count as f64
        - 6.0 * specs.screen_issues as f64
        - 4.0 * specs.body_issues as f64;
    (remaining as i64).max(1)
}

pub fn base_life_months(category: &str) -> f64 {
    match category.trim().to_lowercase().as_str() {
        "mobile" => 48.0,
        "laptop" => 72.0,
        "tablet" => 60.0,
        "tv" => 84.0,
        _ => 60.0,
    }
}

pub fn decision_for(price: i64, original_price: f64, rul_months: i64) -> Decision {
    let price = price as f64;
    if rul_months >= 10 && price >= original_price * 0.25 {
        Decision::Repair
    } else if price >= original_price * 0.15 {
        Decision::Resell
    } else {
        Decision::Recycle
    }
}

pub fn co2_saved_kg(price: i64, original_price: f64) -> f64 {
    let ratio = price as f64 / original_price.max(1.0);
    (ratio * 40.0 * 100.0).round() / 100.0
}

pub fn age_months(specs: &DeviceSpecs) -> f64 {
    specs.age_months.unwrap_or(DEFAULT_AGE_MONTHS)
}

pub fn original_price(specs: &DeviceSpecs) -> f64 {
    specs.original_price.unwrap_or(DEFAULT_ORIGINAL_PRICE)
}

pub fn battery_health(specs: &DeviceSpecs) -> f64 {
    specs.battery_health.unwrap_or(DEFAULT_BATTERY_HEALTH)
}

fn round_to_ten(value: f64) -> i64 {
    ((value / 10.0).round() * 10.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Intent;

    fn specs(category: &str) -> DeviceSpecs {
        DeviceSpecs {
            category: category.to_string(),
            brand: "Apple".to_string(),
            model: "iPhone 12".to_string(),
            age_months: None,
            original_price: None,
            defect_count: 0,
            battery_health: None,
            storage_gb: None,
            ram_gb: None,
            screen_issues: 0,
            body_issues: 0,
            accessories: String::new(),
            city: "Bengaluru".to_string(),
            lat: None,
            lon: None,
            intent: Intent::Sell,
        }
    }

    #[test]
    fn two_year_mobile_in_good_shape() {
        let mut s = specs("mobile");
        s.age_months = Some(24.0);
        s.original_price = Some(20000.0);
        s.battery_health = Some(80.0);

        assert!((wear_score(&s) - 0.72).abs() < 1e-9);

        let est = estimate(&s);
        assert_eq!(est.predictions.price_suggest, 18560);
        assert_eq!(est.condition.label, "Good");
        assert_eq!(est.condition.confidence, 0.85);
        assert_eq!(est.predictions.rul_months, 24);
        assert_eq!(est.predictions.decision, Decision::Repair);
        assert_eq!(est.predictions.co2_saved_kg, 37.12);
    }

    #[test]
    fn defaults_fill_missing_numbers() {
        let est = estimate(&specs("mobile"));
        assert_eq!(est.predictions.price_suggest, 18560);
        assert_eq!(est.predictions.rul_months, 24);
    }

    #[test]
    fn weak_battery_adds_wear() {
        let mut s = specs("mobile");
        s.age_months = Some(24.0);
        s.battery_health = Some(50.0);
        // (90 - 50) * 0.02 on top of the age term.
        assert!((wear_score(&s) - 1.52).abs() < 1e-9);
    }

    #[test]
    fn battery_at_healthy_threshold_is_free() {
        let mut s = specs("mobile");
        s.age_months = Some(10.0);
        s.battery_health = Some(80.0);
        assert!((wear_score(&s) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn wear_deduction_is_capped_and_price_floored() {
        let mut s = specs("mobile");
        s.age_months = Some(120.0);
        s.original_price = Some(1000.0);
        s.defect_count = 5;
        s.screen_issues = 2;
        s.body_issues = 2;

        let est = estimate(&s);
        // Cap at 85% deduction would give 150; the floor wins.
        assert_eq!(est.predictions.price_suggest, 500);
        assert_eq!(est.condition.label, "Poor");
        assert_eq!(est.predictions.rul_months, 1);
    }

    #[test]
    fn rounding_below_resell_bar_recycles() {
        let mut s = specs("mobile");
        s.age_months = Some(120.0);
        s.original_price = Some(20010.0);
        s.defect_count = 5;
        s.screen_issues = 2;
        s.body_issues = 2;

        let est = estimate(&s);
        // 15% of 20010 is 3001.5; rounding to the nearest 10 lands just under.
        assert_eq!(est.predictions.price_suggest, 3000);
        assert_eq!(est.predictions.decision, Decision::Recycle);
    }

    #[test]
    fn category_sets_base_life() {
        let mut s = specs("laptop");
        s.age_months = Some(24.0);
        assert_eq!(rul_months(&s), 48);

        let mut s = specs("tv");
        s.age_months = Some(24.0);
        assert_eq!(rul_months(&s), 60);

        let mut s = specs("fridge");
        s.age_months = Some(24.0);
        assert_eq!(rul_months(&s), 36);
    }

    #[test]
    fn single_minor_issue_is_fair() {
        let mut s = specs("mobile");
        s.screen_issues = 1;
        let c = condition(&s);
        assert_eq!(c.label, "Fair");
        assert_eq!(c.confidence, 0.7);

        s.defect_count = 2;
        assert_eq!(condition(&s).label, "Poor");
    }

    #[test]
    fn decision_thresholds() {
        assert_eq!(decision_for(5000, 20000.0, 24), Decision::Repair);
        assert_eq!(decision_for(4990, 20000.0, 24), Decision::Resell);
        assert_eq!(decision_for(5000, 20000.0, 9), Decision::Resell);
        assert_eq!(decision_for(2990, 20000.0, 9), Decision::Recycle);
    }
}
