use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Sell,
    Repair,
    Recycle,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Sell => "sell",
            Intent::Repair => "repair",
            Intent::Recycle => "recycle",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "sell" => Some(Intent::Sell),
            "repair" => Some(Intent::Repair),
            "recycle" => Some(Intent::Recycle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Repair,
    Resell,
    Recycle,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Repair => "repair",
            Decision::Resell => "resell",
            Decision::Recycle => "recycle",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "repair" => Some(Decision::Repair),
            "resell" => Some(Decision::Resell),
            "recycle" => Some(Decision::Recycle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Created,
    SharedWithPartner,
    InProgress,
    Completed,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Created => "created",
            ListingStatus::SharedWithPartner => "shared_with_partner",
            ListingStatus::InProgress => "in_progress",
            ListingStatus::Completed => "completed",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "created" => Some(ListingStatus::Created),
            "shared_with_partner" => Some(ListingStatus::SharedWithPartner),
            "in_progress" => Some(ListingStatus::InProgress),
            "completed" => Some(ListingStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
    Removed,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Visible => "visible",
            Visibility::Hidden => "hidden",
            Visibility::Removed => "removed",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "visible" => Some(Visibility::Visible),
            "hidden" => Some(Visibility::Hidden),
            "removed" => Some(Visibility::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartnerType {
    Repair,
    Recycler,
}

impl PartnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartnerType::Repair => "repair",
            PartnerType::Recycler => "recycler",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "repair" => Some(PartnerType::Repair),
            "recycler" | "recycle" => Some(PartnerType::Recycler),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    #[default]
    NotSubmitted,
    Submitted,
    Verified,
    Rejected,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::NotSubmitted => "not_submitted",
            KycStatus::Submitted => "submitted",
            KycStatus::Verified => "verified",
            KycStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "not_submitted" => Some(KycStatus::NotSubmitted),
            "submitted" => Some(KycStatus::Submitted),
            "verified" => Some(KycStatus::Verified),
            "rejected" => Some(KycStatus::Rejected),
            _ => None,
        }
    }
}

/// Device attributes captured from the intake form. Numeric fields stay
/// optional so the estimator can apply its own defaults.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSpecs {
    pub category: String,
    pub brand: String,
    pub model: String,
    #[serde(default)]
    pub age_months: Option<f64>,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub defect_count: i64,
    #[serde(default)]
    pub battery_health: Option<f64>,
    #[serde(default)]
    pub storage_gb: Option<i64>,
    #[serde(default)]
    pub ram_gb: Option<i64>,
    #[serde(default)]
    pub screen_issues: i64,
    #[serde(default)]
    pub body_issues: i64,
    #[serde(default)]
    pub accessories: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub intent: Intent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionAssessment {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predictions {
    pub price_suggest: i64,
    pub rul_months: i64,
    pub decision: Decision,
    pub co2_saved_kg: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MethodTier {
    Vision,
    Tabular,
    Rules,
}

impl MethodTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodTier::Vision => "vision",
            MethodTier::Tabular => "tabular",
            MethodTier::Rules => "rules",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationResult {
    pub method: MethodTier,
    pub model_name: Option<String>,
    pub inference_ms: Option<u64>,
    pub detections: Vec<Detection>,
    pub image_condition: ConditionAssessment,
    pub predictions: Predictions,
    pub price_explanation: String,
    #[serde(default)]
    pub nearby_partners: Vec<PartnerSummary>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerSummary {
    pub user_id: i64,
    pub org_name: String,
    pub partner_type: PartnerType,
    pub city: String,
    pub distance_km: Option<f64>,
    pub service_radius_km: f64,
    pub kyc_status: KycStatus,
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerProfile {
    pub user_id: i64,
    pub org_name: String,
    pub partner_type: PartnerType,
    pub city: String,
    pub address: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub service_radius_km: f64,
    pub contact_phone: Option<String>,
    pub kyc_status: KycStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartnerUpsertRequest {
    pub org_name: String,
    pub partner_type: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub service_radius_km: Option<f64>,
    #[serde(default)]
    pub contact_phone: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ListingSummary {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub city: String,
    pub image: String,
    pub status: &'static str,
    pub intent: Intent,
    pub predictions: Option<Predictions>,
    pub image_condition: Option<ConditionAssessment>,
    pub chosen_partner_id: Option<i64>,
    pub outcome: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct LeadSummary {
    pub listing_id: i64,
    pub created_at: DateTime<Utc>,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub city: String,
    pub intent: Intent,
    pub decision: Option<Decision>,
    pub status: &'static str,
    pub mine: bool,
    pub predictions: Option<Predictions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteLeadRequest {
    pub outcome: String,
    #[serde(default)]
    pub final_price: Option<i64>,
    #[serde(default)]
    pub final_rul_months: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "select", rename_all = "snake_case")]
pub enum PartnerSelection {
    Ids { ids: Vec<i64> },
    All,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
