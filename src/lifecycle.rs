//! Listing lifecycle rules.
//!
//! The guards here are advisory: handlers use them to produce friendly
//! errors, while the conditional UPDATEs in the store stay authoritative
//! under concurrency. Admin visibility is orthogonal to the partner-driven
//! flow and never blocks business progress.

use thiserror::Error;

use crate::models::{Decision, Intent, ListingStatus, Visibility};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("listing already completed")]
    AlreadyCompleted,
    #[error("listing already accepted by you")]
    AlreadyAccepted,
    #[error("listing is assigned to another partner")]
    AssignedToOther,
    #[error("listing has no assigned partner")]
    NotAssigned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VisibilityError {
    #[error("listing already hidden")]
    AlreadyHidden,
    #[error("listing already removed")]
    AlreadyRemoved,
    #[error("listing is not hidden")]
    NotHidden,
    #[error("removed listings cannot change visibility")]
    Removed,
}

/// Status a listing starts in. Repair and recycle intents go straight to the
/// partner pool; sell listings join it only when the estimator recommends a
/// repair.
pub fn initial_status(intent: Intent, decision: Decision) -> ListingStatus {
    match intent {
        Intent::Repair | Intent::Recycle => ListingStatus::SharedWithPartner,
        Intent::Sell if decision == Decision::Repair => ListingStatus::SharedWithPartner,
        Intent::Sell => ListingStatus::Created,
    }
}

pub fn accept(
    status: ListingStatus,
    chosen: Option<i64>,
    partner_id: i64,
) -> Result<(), TransitionError> {
    if status == ListingStatus::Completed {
        return Err(TransitionError::AlreadyCompleted);
    }
    match chosen {
        None => Ok(()),
        Some(existing) if existing == partner_id => Err(TransitionError::AlreadyAccepted),
        Some(_) => Err(TransitionError::AssignedToOther),
    }
}

pub fn reject(
    status: ListingStatus,
    chosen: Option<i64>,
    partner_id: i64,
) -> Result<(), TransitionError> {
    if status == ListingStatus::Completed {
        return Err(TransitionError::AlreadyCompleted);
    }
    match chosen {
        Some(existing) if existing != partner_id => Err(TransitionError::AssignedToOther),
        _ => Ok(()),
    }
}

pub fn complete(
    status: ListingStatus,
    chosen: Option<i64>,
    partner_id: i64,
) -> Result<(), TransitionError> {
    if status == ListingStatus::Completed {
        return Err(TransitionError::AlreadyCompleted);
    }
    match chosen {
        None => Err(TransitionError::NotAssigned),
        Some(existing) if existing == partner_id => Ok(()),
        Some(_) => Err(TransitionError::AssignedToOther),
    }
}

pub fn hide(current: Visibility) -> Result<Visibility, VisibilityError> {
    match current {
        Visibility::Visible => Ok(Visibility::Hidden),
        Visibility::Hidden => Err(VisibilityError::AlreadyHidden),
        Visibility::Removed => Err(VisibilityError::Removed),
    }
}

pub fn restore(current: Visibility) -> Result<Visibility, VisibilityError> {
    match current {
        Visibility::Hidden => Ok(Visibility::Visible),
        Visibility::Visible => Err(VisibilityError::NotHidden),
        Visibility::Removed => Err(VisibilityError::Removed),
    }
}

pub fn remove(current: Visibility) -> Result<Visibility, VisibilityError> {
    match current {
        Visibility::Removed => Err(VisibilityError::AlreadyRemoved),
        _ => Ok(Visibility::Removed),
    }
}

/// What callers see as the listing status: admin visibility wins over the
/// business state.
pub fn effective_status(status: ListingStatus, visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Removed => "removed",
        Visibility::Hidden => "hidden",
        Visibility::Visible => status.as_str(),
    }
}
