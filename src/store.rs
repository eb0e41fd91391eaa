//! SQLite persistence for listings and partners, plus the content-addressed
//! photo store.
//!
//! Concurrency rules live here as SQL, not in handler code: the unique
//! `(user_id, dedupe_key)` index arbitrates duplicate submissions, and the
//! lifecycle moves are conditional UPDATEs whose affected-row count tells the
//! caller whether it won.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    Decision, DeviceSpecs, EstimationResult, Intent, KycStatus, ListingStatus, PartnerProfile,
    PartnerType, Visibility,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate listing")]
    DuplicateListing,
    #[error("partner profile already exists")]
    DuplicatePartner,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const CREATE_LISTINGS: &str = "
CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    image_path TEXT NOT NULL,
    image_md5 TEXT NOT NULL,
    dedupe_key TEXT NOT NULL,
    result_json TEXT,
    status TEXT NOT NULL DEFAULT 'created',
    visibility TEXT NOT NULL DEFAULT 'visible',
    intent TEXT NOT NULL DEFAULT 'sell',
    decision TEXT,
    chosen_partner_id INTEGER,
    final_price INTEGER,
    final_rul_months INTEGER,
    outcome TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, dedupe_key)
)";

const CREATE_PARTNERS: &str = "
CREATE TABLE IF NOT EXISTS partners (
    user_id INTEGER PRIMARY KEY,
    org_name TEXT NOT NULL,
    partner_type TEXT NOT NULL,
    city TEXT NOT NULL DEFAULT '',
    address TEXT NOT NULL DEFAULT '',
    lat REAL,
    lon REAL,
    service_radius_km REAL NOT NULL DEFAULT 10.0,
    contact_phone TEXT,
    kyc_status TEXT NOT NULL DEFAULT 'not_submitted',
    created_at TEXT NOT NULL
)";

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_listings_user ON listings(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_listings_md5 ON listings(image_md5)",
];

/// Columns added after the first deployed schema. Failures here mean the
/// column already exists.
const MIGRATIONS: [&str; 7] = [
    "ALTER TABLE listings ADD COLUMN visibility TEXT NOT NULL DEFAULT 'visible'",
    "ALTER TABLE listings ADD COLUMN intent TEXT NOT NULL DEFAULT 'sell'",
    "ALTER TABLE listings ADD COLUMN decision TEXT",
    "ALTER TABLE listings ADD COLUMN chosen_partner_id INTEGER",
    "ALTER TABLE listings ADD COLUMN final_price INTEGER",
    "ALTER TABLE listings ADD COLUMN final_rul_months INTEGER",
    "ALTER TABLE listings ADD COLUMN outcome TEXT",
];

#[derive(Debug, Clone, FromRow)]
pub struct ListingRow {
    pub id: i64,
    pub user_id: i64,
    pub payload: String,
    pub image_path: String,
    pub image_md5: String,
    pub dedupe_key: String,
    pub result_json: Option<String>,
    pub status: String,
    pub visibility: String,
    pub intent: String,
    pub decision: Option<String>,
    pub chosen_partner_id: Option<i64>,
    pub final_price: Option<i64>,
    pub final_rul_months: Option<i64>,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ListingRow {
    pub fn status(&self) -> ListingStatus {
        ListingStatus::from_str(&self.status).unwrap_or_default()
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_str(&self.visibility).unwrap_or_default()
    }

    pub fn intent(&self) -> Intent {
        Intent::from_str(&self.intent).unwrap_or_default()
    }

    pub fn decision(&self) -> Option<Decision> {
        self.decision.as_deref().and_then(Decision::from_str)
    }

    pub fn specs(&self) -> Option<DeviceSpecs> {
        serde_json::from_str(&self.payload).ok()
    }

    pub fn result(&self) -> Option<EstimationResult> {
        self.result_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PartnerRow {
    pub user_id: i64,
    pub org_name: String,
    pub partner_type: String,
    pub city: String,
    pub address: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub service_radius_km: f64,
    pub contact_phone: Option<String>,
    pub kyc_status: String,
    pub created_at: DateTime<Utc>,
}

impl PartnerRow {
    pub fn partner_type(&self) -> PartnerType {
        PartnerType::from_str(&self.partner_type).unwrap_or(PartnerType::Recycler)
    }

    pub fn kyc_status(&self) -> KycStatus {
        KycStatus::from_str(&self.kyc_status).unwrap_or_default()
    }

    pub fn profile(&self) -> PartnerProfile {
        PartnerProfile {
            user_id: self.user_id,
            org_name: self.org_name.clone(),
            partner_type: self.partner_type(),
            city: self.city.clone(),
            address: self.address.clone(),
            lat: self.lat,
            lon: self.lon,
            service_radius_km: self.service_radius_km,
            contact_phone: self.contact_phone.clone(),
            kyc_status: self.kyc_status(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug)]
pub struct NewListing<'a> {
    pub user_id: i64,
    pub payload: &'a str,
    pub image_path: &'a str,
    pub image_md5: &'a str,
    pub dedupe_key: &'a str,
    pub result_json: &'a str,
    pub status: ListingStatus,
    pub intent: Intent,
    pub decision: Decision,
}

#[derive(Debug, Clone)]
pub struct PartnerRecord<'a> {
    pub user_id: i64,
    pub org_name: &'a str,
    pub partner_type: PartnerType,
    pub city: &'a str,
    pub address: &'a str,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub service_radius_km: f64,
    pub contact_phone: Option<&'a str>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database instance.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Raw pool handle for tests that stage failures with extra DDL.
    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_LISTINGS).execute(&self.pool).await?;
        sqlx::query(CREATE_PARTNERS).execute(&self.pool).await?;
        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for ddl in MIGRATIONS {
            if let Err(err) = sqlx::query(ddl).execute(&self.pool).await {
                debug!(target = "ecoloop.store", error = %err, "migration step skipped");
            }
        }
        Ok(())
    }

    // -------- Listings --------

    pub async fn insert_listing(&self, new: NewListing<'_>) -> Result<i64, StoreError> {
        let res = sqlx::query(
            "INSERT INTO listings
                (user_id, payload, image_path, image_md5, dedupe_key, result_json,
                 status, visibility, intent, decision, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'visible', ?, ?, ?)",
        )
        .bind(new.user_id)
        .bind(new.payload)
        .bind(new.image_path)
        .bind(new.image_md5)
        .bind(new.dedupe_key)
        .bind(new.result_json)
        .bind(new.status.as_str())
        .bind(new.intent.as_str())
        .bind(new.decision.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| duplicate_as(err, StoreError::DuplicateListing))?;
        Ok(res.last_insert_rowid())
    }

    pub async fn has_listing_key(&self, user_id: i64, dedupe_key: &str) -> Result<bool, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM listings WHERE user_id = ? AND dedupe_key = ?",
        )
        .bind(user_id)
        .bind(dedupe_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get_listing(&self, id: i64) -> Result<Option<ListingRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, ListingRow>("SELECT * FROM listings WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn listings_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<ListingRow>, StoreError> {
        Ok(sqlx::query_as::<_, ListingRow>(
            "SELECT * FROM listings WHERE user_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Deletes a listing the user owns and hands back the row so the caller
    /// can release the photo.
    pub async fn delete_listing(
        &self,
        id: i64,
        user_id: i64,
    ) -> Result<Option<ListingRow>, StoreError> {
        Ok(sqlx::query_as::<_, ListingRow>(
            "DELETE FROM listings WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Listings still referencing a photo hash. Photos are content-addressed
    /// and shared, so deletion is allowed only at zero.
    pub async fn count_image_refs(&self, image_md5: &str) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM listings WHERE image_md5 = ?")
                .bind(image_md5)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // -------- Lifecycle (conditional updates; the row count is the verdict) --------

    pub async fn try_accept(&self, listing_id: i64, partner_id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE listings SET status = 'in_progress', chosen_partner_id = ?
             WHERE id = ? AND chosen_partner_id IS NULL AND status != 'completed'",
        )
        .bind(partner_id)
        .bind(listing_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn try_reject(&self, listing_id: i64, partner_id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE listings SET status = 'created', chosen_partner_id = NULL
             WHERE id = ? AND status != 'completed'
               AND (chosen_partner_id IS NULL OR chosen_partner_id = ?)",
        )
        .bind(listing_id)
        .bind(partner_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn try_complete(
        &self,
        listing_id: i64,
        partner_id: i64,
        outcome: &str,
        final_price: Option<i64>,
        final_rul_months: Option<i64>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE listings SET status = 'completed', outcome = ?,
                    final_price = COALESCE(?, final_price),
                    final_rul_months = COALESCE(?, final_rul_months)
             WHERE id = ? AND chosen_partner_id = ? AND status != 'completed'",
        )
        .bind(outcome)
        .bind(final_price)
        .bind(final_rul_months)
        .bind(listing_id)
        .bind(partner_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_visibility(
        &self,
        listing_id: i64,
        from: Visibility,
        to: Visibility,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE listings SET visibility = ? WHERE id = ? AND visibility = ?")
            .bind(to.as_str())
            .bind(listing_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn mark_removed(&self, listing_id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE listings SET visibility = 'removed' WHERE id = ? AND visibility != 'removed'",
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn admin_listings(
        &self,
        visibility: Option<Visibility>,
        limit: i64,
    ) -> Result<Vec<ListingRow>, StoreError> {
        let rows = match visibility {
            Some(v) => {
                sqlx::query_as::<_, ListingRow>(
                    "SELECT * FROM listings WHERE visibility = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(v.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ListingRow>(
                    "SELECT * FROM listings ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    // -------- Leads --------

    /// Open pool leads matching the partner's specialty, plus everything the
    /// partner has already claimed (their active and finished jobs).
    pub async fn leads_for_partner(
        &self,
        partner_id: i64,
        partner_type: PartnerType,
    ) -> Result<Vec<ListingRow>, StoreError> {
        let type_clause = match partner_type {
            PartnerType::Repair => "(intent = 'repair' OR (intent = 'sell' AND decision = 'repair'))",
            PartnerType::Recycler => "intent = 'recycle'",
        };
        let sql = format!(
            "SELECT * FROM listings
             WHERE visibility = 'visible'
               AND (chosen_partner_id = ?
                    OR (chosen_partner_id IS NULL
                        AND status = 'shared_with_partner'
                        AND {type_clause}))
             ORDER BY created_at DESC, id DESC"
        );
        Ok(sqlx::query_as::<_, ListingRow>(&sql)
            .bind(partner_id)
            .fetch_all(&self.pool)
            .await?)
    }

    // -------- Partners --------

    pub async fn insert_partner(
        &self,
        record: PartnerRecord<'_>,
        kyc: KycStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO partners
                (user_id, org_name, partner_type, city, address, lat, lon,
                 service_radius_km, contact_phone, kyc_status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.user_id)
        .bind(record.org_name)
        .bind(record.partner_type.as_str())
        .bind(record.city)
        .bind(record.address)
        .bind(record.lat)
        .bind(record.lon)
        .bind(record.service_radius_km)
        .bind(record.contact_phone)
        .bind(kyc.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| duplicate_as(err, StoreError::DuplicatePartner))?;
        Ok(())
    }

    /// Profile edits never touch `kyc_status`; verification is admin-owned.
    pub async fn update_partner(&self, record: PartnerRecord<'_>) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE partners SET org_name = ?, partner_type = ?, city = ?, address = ?,
                    lat = ?, lon = ?, service_radius_km = ?, contact_phone = ?
             WHERE user_id = ?",
        )
        .bind(record.org_name)
        .bind(record.partner_type.as_str())
        .bind(record.city)
        .bind(record.address)
        .bind(record.lat)
        .bind(record.lon)
        .bind(record.service_radius_km)
        .bind(record.contact_phone)
        .bind(record.user_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_partner(&self, user_id: i64) -> Result<Option<PartnerRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, PartnerRow>("SELECT * FROM partners WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn partners(&self, kyc: Option<KycStatus>) -> Result<Vec<PartnerRow>, StoreError> {
        let rows = match kyc {
            Some(status) => {
                sqlx::query_as::<_, PartnerRow>(
                    "SELECT * FROM partners WHERE kyc_status = ?
                     ORDER BY created_at ASC, user_id ASC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PartnerRow>(
                    "SELECT * FROM partners ORDER BY created_at ASC, user_id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn set_kyc(&self, user_id: i64, status: KycStatus) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE partners SET kyc_status = ? WHERE user_id = ?")
            .bind(status.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn verify_all_partners(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("UPDATE partners SET kyc_status = 'verified' WHERE kyc_status != 'verified'")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Duplicate lookup for directory imports: exact phone match, or both
    /// coordinates within `eps` degrees.
    pub async fn find_directory_match(
        &self,
        contact_phone: Option<&str>,
        lat: Option<f64>,
        lon: Option<f64>,
        eps: f64,
    ) -> Result<Option<i64>, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM partners
             WHERE (contact_phone IS NOT NULL AND contact_phone = ?)
                OR (lat IS NOT NULL AND lon IS NOT NULL
                    AND ABS(lat - ?) <= ? AND ABS(lon - ?) <= ?)
             ORDER BY user_id ASC LIMIT 1",
        )
        .bind(contact_phone)
        .bind(lat)
        .bind(eps)
        .bind(lon)
        .bind(eps)
        .fetch_optional(&self.pool)
        .await?)
    }
}

fn duplicate_as(err: sqlx::Error, mapped: StoreError) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => mapped,
        _ => StoreError::Database(err),
    }
}

// -------- Photo store --------

/// Content-addressed photo directory: files are named by MD5 plus a
/// whitelisted extension and written at most once, so identical uploads
/// share bytes on disk.
#[derive(Clone)]
pub struct ImageStore {
    root: Arc<PathBuf>,
}

impl ImageStore {
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn file_name(image_md5: &str, original_name: Option<&str>) -> String {
        format!("{image_md5}{}", sanitized_ext(original_name))
    }

    /// Write-once save. An existing file wins; new content lands via a temp
    /// file and rename so readers never observe partial bytes.
    pub async fn save(&self, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.root.join(file_name);
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn remove(&self, file_name: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.root.join(file_name)).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn sanitized_ext(name: Option<&str>) -> &'static str {
    let ext = name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") => ".jpg",
        Some("jpeg") => ".jpeg",
        Some("png") => ".png",
        Some("webp") => ".webp",
        Some("bmp") => ".bmp",
        _ => ".jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing<'a>(user_id: i64, key: &'a str, intent: Intent, decision: Decision) -> NewListing<'a> {
        NewListing {
            user_id,
            payload: r#"{"category":"mobile","brand":"Apple","model":"iPhone 12"}"#,
            image_path: "abc.jpg",
            image_md5: "abc",
            dedupe_key: key,
            result_json: "{}",
            status: crate::lifecycle::initial_status(intent, decision),
            intent,
            decision,
        }
    }

    fn partner_record(user_id: i64, partner_type: PartnerType) -> PartnerRecord<'static> {
        PartnerRecord {
            user_id,
            org_name: "FixIt Hub",
            partner_type,
            city: "Bengaluru",
            address: "12 MG Road",
            lat: Some(12.97),
            lon: Some(77.59),
            service_radius_km: 25.0,
            contact_phone: Some("+91-9000000001"),
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_per_user() {
        let store = Store::in_memory().await.expect("store");
        store
            .insert_listing(listing(1, "key-a", Intent::Sell, Decision::Resell))
            .await
            .expect("first insert");

        let err = store
            .insert_listing(listing(1, "key-a", Intent::Sell, Decision::Resell))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateListing));

        // Same key under another user is a different listing.
        store
            .insert_listing(listing(2, "key-a", Intent::Sell, Decision::Resell))
            .await
            .expect("other user");
        assert!(store.has_listing_key(1, "key-a").await.expect("lookup"));
        assert!(!store.has_listing_key(1, "key-b").await.expect("lookup"));
    }

    #[tokio::test]
    async fn accept_has_a_single_winner() {
        let store = Store::in_memory().await.expect("store");
        let id = store
            .insert_listing(listing(1, "k", Intent::Repair, Decision::Repair))
            .await
            .expect("insert");

        assert!(store.try_accept(id, 50).await.expect("first accept"));
        assert!(!store.try_accept(id, 51).await.expect("second accept"));

        let row = store.get_listing(id).await.expect("get").expect("row");
        assert_eq!(row.status(), ListingStatus::InProgress);
        assert_eq!(row.chosen_partner_id, Some(50));
    }

    #[tokio::test]
    async fn reject_reopens_the_listing() {
        let store = Store::in_memory().await.expect("store");
        let id = store
            .insert_listing(listing(1, "k", Intent::Repair, Decision::Repair))
            .await
            .expect("insert");

        assert!(store.try_accept(id, 50).await.expect("accept"));
        // Another partner cannot reject a claimed listing.
        assert!(!store.try_reject(id, 99).await.expect("foreign reject"));
        assert!(store.try_reject(id, 50).await.expect("own reject"));

        let row = store.get_listing(id).await.expect("get").expect("row");
        assert_eq!(row.status(), ListingStatus::Created);
        assert_eq!(row.chosen_partner_id, None);

        // Freed listing can be claimed again.
        assert!(store.try_accept(id, 99).await.expect("reclaim"));
    }

    #[tokio::test]
    async fn complete_is_terminal_and_owner_only() {
        let store = Store::in_memory().await.expect("store");
        let id = store
            .insert_listing(listing(1, "k", Intent::Repair, Decision::Repair))
            .await
            .expect("insert");

        assert!(store.try_accept(id, 50).await.expect("accept"));
        assert!(
            !store
                .try_complete(id, 99, "repaired", None, None)
                .await
                .expect("foreign complete")
        );
        assert!(
            store
                .try_complete(id, 50, "repaired", Some(4200), None)
                .await
                .expect("complete")
        );

        let row = store.get_listing(id).await.expect("get").expect("row");
        assert_eq!(row.status(), ListingStatus::Completed);
        assert_eq!(row.outcome.as_deref(), Some("repaired"));
        assert_eq!(row.final_price, Some(4200));
        assert_eq!(row.final_rul_months, None);

        // Nothing moves a completed listing.
        assert!(
            !store
                .try_complete(id, 50, "repaired", None, None)
                .await
                .expect("recomplete")
        );
        assert!(!store.try_reject(id, 50).await.expect("reject"));
        assert!(!store.try_accept(id, 51).await.expect("accept"));
    }

    #[tokio::test]
    async fn visibility_moves_are_conditional() {
        let store = Store::in_memory().await.expect("store");
        let id = store
            .insert_listing(listing(1, "k", Intent::Sell, Decision::Resell))
            .await
            .expect("insert");

        assert!(
            store
                .set_visibility(id, Visibility::Visible, Visibility::Hidden)
                .await
                .expect("hide")
        );
        assert!(
            !store
                .set_visibility(id, Visibility::Visible, Visibility::Hidden)
                .await
                .expect("double hide")
        );
        assert!(
            store
                .set_visibility(id, Visibility::Hidden, Visibility::Visible)
                .await
                .expect("restore")
        );
        assert!(store.mark_removed(id).await.expect("remove"));
        assert!(!store.mark_removed(id).await.expect("double remove"));

        let hidden = store
            .admin_listings(Some(Visibility::Removed), 50)
            .await
            .expect("admin list");
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].id, id);
    }

    #[tokio::test]
    async fn leads_route_by_specialty_and_claims() {
        let store = Store::in_memory().await.expect("store");
        let repair_intent = store
            .insert_listing(listing(1, "a", Intent::Repair, Decision::Resell))
            .await
            .expect("insert");
        let recycle_intent = store
            .insert_listing(listing(1, "b", Intent::Recycle, Decision::Recycle))
            .await
            .expect("insert");
        let sell_repair = store
            .insert_listing(listing(1, "c", Intent::Sell, Decision::Repair))
            .await
            .expect("insert");
        // Sell listing the estimator scored as resell: stays out of the pool.
        store
            .insert_listing(listing(1, "d", Intent::Sell, Decision::Resell))
            .await
            .expect("insert");

        let repair_pool = store
            .leads_for_partner(50, PartnerType::Repair)
            .await
            .expect("repair leads");
        let ids: Vec<i64> = repair_pool.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sell_repair, repair_intent]);

        let recycle_pool = store
            .leads_for_partner(60, PartnerType::Recycler)
            .await
            .expect("recycler leads");
        assert_eq!(recycle_pool.len(), 1);
        assert_eq!(recycle_pool[0].id, recycle_intent);

        // Claimed leads leave the shared pool but stay on the claimer's desk.
        assert!(store.try_accept(repair_intent, 50).await.expect("accept"));
        let for_claimer = store
            .leads_for_partner(50, PartnerType::Repair)
            .await
            .expect("claimer leads");
        assert_eq!(for_claimer.len(), 2);
        let other = store
            .leads_for_partner(51, PartnerType::Repair)
            .await
            .expect("other leads");
        let other_ids: Vec<i64> = other.iter().map(|r| r.id).collect();
        assert_eq!(other_ids, vec![sell_repair]);
    }

    #[tokio::test]
    async fn hidden_listings_leave_the_pool() {
        let store = Store::in_memory().await.expect("store");
        let id = store
            .insert_listing(listing(1, "a", Intent::Repair, Decision::Repair))
            .await
            .expect("insert");
        store
            .set_visibility(id, Visibility::Visible, Visibility::Hidden)
            .await
            .expect("hide");
        let pool = store
            .leads_for_partner(50, PartnerType::Repair)
            .await
            .expect("leads");
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn partner_registration_is_unique_per_user() {
        let store = Store::in_memory().await.expect("store");
        store
            .insert_partner(partner_record(7, PartnerType::Repair), KycStatus::Submitted)
            .await
            .expect("insert");
        let err = store
            .insert_partner(partner_record(7, PartnerType::Repair), KycStatus::Submitted)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicatePartner));
    }

    #[tokio::test]
    async fn profile_updates_keep_kyc() {
        let store = Store::in_memory().await.expect("store");
        store
            .insert_partner(partner_record(7, PartnerType::Repair), KycStatus::Submitted)
            .await
            .expect("insert");
        store
            .set_kyc(7, KycStatus::Verified)
            .await
            .expect("verify");

        let mut record = partner_record(7, PartnerType::Recycler);
        record.org_name = "GreenCycle";
        assert!(store.update_partner(record).await.expect("update"));

        let row = store.get_partner(7).await.expect("get").expect("row");
        assert_eq!(row.org_name, "GreenCycle");
        assert_eq!(row.partner_type(), PartnerType::Recycler);
        assert_eq!(row.kyc_status(), KycStatus::Verified);
    }

    #[tokio::test]
    async fn verify_all_and_filtering() {
        let store = Store::in_memory().await.expect("store");
        store
            .insert_partner(partner_record(1, PartnerType::Repair), KycStatus::Submitted)
            .await
            .expect("insert");
        store
            .insert_partner(partner_record(2, PartnerType::Recycler), KycStatus::NotSubmitted)
            .await
            .expect("insert");

        assert_eq!(store.verify_all_partners().await.expect("verify all"), 2);
        assert_eq!(store.verify_all_partners().await.expect("idempotent"), 0);

        let verified = store
            .partners(Some(KycStatus::Verified))
            .await
            .expect("filter");
        assert_eq!(verified.len(), 2);
    }

    #[tokio::test]
    async fn directory_match_by_phone_or_proximity() {
        let store = Store::in_memory().await.expect("store");
        store
            .insert_partner(partner_record(7, PartnerType::Repair), KycStatus::NotSubmitted)
            .await
            .expect("insert");

        let by_phone = store
            .find_directory_match(Some("+91-9000000001"), None, None, 0.0005)
            .await
            .expect("lookup");
        assert_eq!(by_phone, Some(7));

        let by_coords = store
            .find_directory_match(None, Some(12.9702), Some(77.5898), 0.0005)
            .await
            .expect("lookup");
        assert_eq!(by_coords, Some(7));

        let miss = store
            .find_directory_match(Some("+91-8123456789"), Some(13.1), Some(77.9), 0.0005)
            .await
            .expect("lookup");
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn image_store_is_write_once() {
        let dir = std::env::temp_dir().join(format!("ecoloop-img-{}", Uuid::new_v4()));
        let images = ImageStore::open(&dir).await.expect("open");

        let name = ImageStore::file_name("5d41402abc4b2a76b9719d911017c592", Some("photo.PNG"));
        assert_eq!(name, "5d41402abc4b2a76b9719d911017c592.png");

        images.save(&name, b"first").await.expect("save");
        images.save(&name, b"second").await.expect("resave");
        let on_disk = tokio::fs::read(dir.join(&name)).await.expect("read");
        assert_eq!(on_disk, b"first");

        images.save("other.jpg", b"x").await.expect("save other");
        images.remove(&name).await.expect("remove");
        images.remove(&name).await.expect("remove again");
        assert!(!dir.join(&name).exists());

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[test]
    fn extension_whitelist() {
        assert_eq!(sanitized_ext(Some("a.jpeg")), ".jpeg");
        assert_eq!(sanitized_ext(Some("a.WEBP")), ".webp");
        assert_eq!(sanitized_ext(Some("archive.tar.gz")), ".jpg");
        assert_eq!(sanitized_ext(Some("noext")), ".jpg");
        assert_eq!(sanitized_ext(None), ".jpg");
    }
}
