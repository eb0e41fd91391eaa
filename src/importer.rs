//! Partner directory CSV import, run once at startup.
//!
//! The directory is curated by operations and re-shipped on deploys, so the
//! import is an idempotent upsert: rows describing an already-known premises
//! update it instead of duplicating it. A premises is recognized by exact
//! phone match or by coordinates within a small epsilon.

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{KycStatus, PartnerType};
use crate::store::{PartnerRecord, Store, StoreError};

/// Roughly 50 metres of latitude. Two rows closer than this on both axes
/// describe the same premises.
pub const PROXIMITY_EPS_DEG: f64 = 0.0005;

pub const DEFAULT_SERVICE_RADIUS_KM: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read partner csv: {0}")]
    Io(#[from] std::io::Error),
    #[error("partner csv has no header row")]
    MissingHeader,
    #[error("partner csv is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
}

pub async fn import_partners(store: &Store, path: &Path) -> Result<ImportReport, ImportError> {
    let raw = tokio::fs::read_to_string(path).await?;
    import_from_str(store, &raw).await
}

pub async fn import_from_str(store: &Store, raw: &str) -> Result<ImportReport, ImportError> {
    let batch = Uuid::new_v4();
    let mut lines = raw.lines().enumerate();
    let header = loop {
        match lines.next() {
            Some((_, line)) if line.trim().is_empty() => continue,
            Some((_, line)) => break line,
            None => return Err(ImportError::MissingHeader),
        }
    };
    let columns = parse_header(header)?;

    let mut report = ImportReport::default();
    for (line_no, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let Some(row) = parse_row(&columns, line) else {
            report.skipped += 1;
            warn!(
                target = "ecoloop.import",
                batch = %batch,
                line = line_no + 1,
                "skipping malformed partner row"
            );
            continue;
        };

        let matched = match store
            .find_directory_match(
                row.contact_phone.as_deref(),
                row.lat,
                row.lon,
                PROXIMITY_EPS_DEG,
            )
            .await?
        {
            Some(id) => Some(id),
            None => store.get_partner(row.user_id).await?.map(|p| p.user_id),
        };

        match matched {
            Some(existing) => {
                store.update_partner(row.record(existing)).await?;
                report.updated += 1;
            }
            None => {
                store
                    .insert_partner(row.record(row.user_id), KycStatus::NotSubmitted)
                    .await?;
                report.created += 1;
            }
        }
    }

    info!(
        target = "ecoloop.import",
        batch = %batch,
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        "partner directory import finished"
    );
    Ok(report)
}

struct Columns {
    user_id: usize,
    org_name: usize,
    partner_type: usize,
    city: Option<usize>,
    address: Option<usize>,
    lat: Option<usize>,
    lon: Option<usize>,
    service_radius_km: Option<usize>,
    contact_phone: Option<usize>,
}

fn parse_header(header: &str) -> Result<Columns, ImportError> {
    let names: Vec<String> = header
        .split(',')
        .map(|c| c.trim().to_lowercase())
        .collect();
    let position = |name: &str| names.iter().position(|c| c == name);
    let required = |name: &'static str| position(name).ok_or(ImportError::MissingColumn(name));

    Ok(Columns {
        user_id: required("user_id")?,
        org_name: required("org_name")?,
        partner_type: required("partner_type")?,
        city: position("city"),
        address: position("address"),
        lat: position("lat"),
        lon: position("lon"),
        service_radius_km: position("service_radius_km"),
        contact_phone: position("contact_phone"),
    })
}

struct ImportedRow {
    user_id: i64,
    org_name: String,
    partner_type: PartnerType,
    city: String,
    address: String,
    lat: Option<f64>,
    lon: Option<f64>,
    service_radius_km: f64,
    contact_phone: Option<String>,
}

impl ImportedRow {
    fn record(&self, user_id: i64) -> PartnerRecord<'_> {
        PartnerRecord {
            user_id,
            org_name: &self.org_name,
            partner_type: self.partner_type,
            city: &self.city,
            address: &self.address,
            lat: self.lat,
            lon: self.lon,
            service_radius_km: self.service_radius_km,
            contact_phone: self.contact_phone.as_deref(),
        }
    }
}

fn parse_row(columns: &Columns, line: &str) -> Option<ImportedRow> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let text = |idx: Option<usize>| -> String {
        idx.and_then(|i| fields.get(i))
            .map(|s| s.to_string())
            .unwrap_or_default()
    };
    let number = |idx: Option<usize>| -> Option<f64> {
        idx.and_then(|i| fields.get(i)).and_then(|s| s.parse().ok())
    };

    let user_id = fields
        .get(columns.user_id)?
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)?;
    let org_name = text(Some(columns.org_name));
    if org_name.is_empty() {
        return None;
    }
    let partner_type = PartnerType::from_str(fields.get(columns.partner_type)?)?;

    let contact_phone = Some(text(columns.contact_phone)).filter(|p| !p.is_empty());

    Some(ImportedRow {
        user_id,
        org_name,
        partner_type,
        city: text(columns.city),
        address: text(columns.address),
        lat: number(columns.lat),
        lon: number(columns.lon),
        service_radius_km: number(columns.service_radius_km)
            .filter(|r| *r > 0.0)
            .unwrap_or(DEFAULT_SERVICE_RADIUS_KM),
        contact_phone,
    })
}
