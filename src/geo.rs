//! Partner matching and geospatial ranking.
//!
//! Ranking never fails: callers without coordinates get the matching set
//! unranked, and partners without coordinates sort after every ranked one.

use std::cmp::Ordering;

use crate::models::{Intent, KycStatus, PartnerProfile, PartnerSummary, PartnerType};

const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Sell listings go to every partner type; repair and recycle route to the
/// matching specialty.
pub fn matches_intent(partner_type: PartnerType, intent: Intent) -> bool {
    match intent {
        Intent::Sell => true,
        Intent::Repair => partner_type == PartnerType::Repair,
        Intent::Recycle => partner_type == PartnerType::Recycler,
    }
}

/// Rank partners for a caller. Partners outside their own service radius are
/// dropped; ties keep registration order (the sort is stable).
pub fn rank_partners(
    partners: &[PartnerProfile],
    origin: Option<(f64, f64)>,
    intent: Intent,
    limit: usize,
) -> Vec<PartnerSummary> {
    let mut ranked: Vec<(f64, &PartnerProfile)> = Vec::new();
    let mut unranked: Vec<&PartnerProfile> = Vec::new();

    for partner in partners {
        if !matches_intent(partner.partner_type, intent) {
            continue;
        }
        match (origin, partner.lat, partner.lon) {
            (Some((lat, lon)), Some(p_lat), Some(p_lon)) => {
                let d = haversine_km(lat, lon, p_lat, p_lon);
                if d <= partner.service_radius_km {
                    ranked.push((d, partner));
                }
            }
            _ => unranked.push(partner),
        }
    }

    ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut out: Vec<PartnerSummary> = ranked
        .into_iter()
        .map(|(d, p)| summarize(p, Some(d)))
        .collect();
    out.extend(unranked.into_iter().map(|p| summarize(p, None)));
    out.truncate(limit);
    out
}

/// Projection for API responses. Contact details stay redacted until the
/// partner clears KYC.
pub fn summarize(partner: &PartnerProfile, distance_km: Option<f64>) -> PartnerSummary {
    let contact_phone = if partner.kyc_status == KycStatus::Verified {
        partner.contact_phone.clone()
    } else {
        None
    };
    PartnerSummary {
        user_id: partner.user_id,
        org_name: partner.org_name.clone(),
        partner_type: partner.partner_type,
        city: partner.city.clone(),
        distance_km: distance_km.map(|d| (d * 100.0).round() / 100.0),
        service_radius_km: partner.service_radius_km,
        kyc_status: partner.kyc_status,
        contact_phone,
    }
}
