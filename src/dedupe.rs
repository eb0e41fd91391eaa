//! Duplicate-listing fingerprints.
//!
//! A listing is identified by the owning user, the normalized brand/model
//! pair, and the MD5 of the uploaded photo. The derived key backs a unique
//! index, so the database stays the arbiter under concurrent submits.

use sha2::{Digest, Sha256};

pub fn image_md5(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Stable fingerprint for (user, brand, model, photo). Brand and model are
/// trimmed and lowercased so cosmetic retypes still collide.
pub fn listing_key(user_id: i64, brand: &str, model: &str, image_md5: &str) -> String {
    let raw = format!(
        "{}|{}|{}|{}",
        user_id,
        brand.trim().to_lowercase(),
        model.trim().to_lowercase(),
        image_md5
    );
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}
