//! Worker document lifecycle.
//!
//! Stored statuses move `UNDER_REVIEW | IN_REVIEW -> APPROVED | REJECTED | IN_REVIEW`
//! and only through a reviewer. `PENDING` is never stored: it is what a
//! catalog type without any submission looks like (see [`DocumentSlot`]).
//! `EXPIRED` is never written either; it is derived at read time from the
//! expiry date against the business calendar's "today".

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{WorkerDocument, WorkerDocumentType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    UnderReview,
    InReview,
    Approved,
    Expired,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::UnderReview => "UNDER_REVIEW",
            DocumentStatus::InReview => "IN_REVIEW",
            DocumentStatus::Approved => "APPROVED",
            DocumentStatus::Expired => "EXPIRED",
            DocumentStatus::Rejected => "REJECTED",
        }
    }

    /// Statuses a reviewer may still act on.
    pub fn awaits_review(self) -> bool {
        matches!(self, DocumentStatus::UnderReview | DocumentStatus::InReview)
    }

    /// Statuses a reviewer may request.
    pub fn is_review_outcome(self) -> bool {
        matches!(
            self,
            DocumentStatus::InReview | DocumentStatus::Approved | DocumentStatus::Rejected
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = LifecycleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DocumentStatus::Pending),
            "UNDER_REVIEW" => Ok(DocumentStatus::UnderReview),
            "IN_REVIEW" => Ok(DocumentStatus::InReview),
            "APPROVED" => Ok(DocumentStatus::Approved),
            "EXPIRED" => Ok(DocumentStatus::Expired),
            "REJECTED" => Ok(DocumentStatus::Rejected),
            _ => Err(LifecycleError::UnknownStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("this document type requires a back file")]
    MissingBackFile,
    #[error("this document type requires an expiry date")]
    MissingExpiryDate,
    #[error("emission date must precede expiry date")]
    DatesOutOfOrder,
    #[error("unknown document status '{0}'")]
    UnknownStatus(String),
    #[error("status {0} cannot be set by a reviewer")]
    NotAReviewOutcome(DocumentStatus),
    #[error("cannot move document from {from} to {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
}

impl From<LifecycleError> for AppError {
    fn from(value: LifecycleError) -> Self {
        let message = value.to_string();
        match value {
            LifecycleError::MissingBackFile => AppError::validation("MissingBackFile", message),
            LifecycleError::MissingExpiryDate => {
                AppError::validation("MissingExpiryDate", message)
            }
            LifecycleError::DatesOutOfOrder => AppError::validation("InvalidDateRange", message),
            LifecycleError::UnknownStatus(_) | LifecycleError::NotAReviewOutcome(_) => {
                AppError::invalid_field("status", message)
            }
            LifecycleError::InvalidTransition { .. } => AppError::conflicting_transition(message),
        }
    }
}

/// Validates a reviewer-requested status change from `current`.
pub fn review_transition(
    current: DocumentStatus,
    requested: DocumentStatus,
) -> Result<DocumentStatus, LifecycleError> {
    if !requested.is_review_outcome() {
        return Err(LifecycleError::NotAReviewOutcome(requested));
    }
    if !current.awaits_review() {
        return Err(LifecycleError::InvalidTransition {
            from: current,
            to: requested,
        });
    }
    Ok(requested)
}

/// Checks a new submission against its catalog entry.
pub fn validate_submission(
    document_type: &WorkerDocumentType,
    has_back_file: bool,
    emission_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
) -> Result<(), LifecycleError> {
    if document_type.requires_front_back && !has_back_file {
        return Err(LifecycleError::MissingBackFile);
    }
    validate_dates(document_type, emission_date, expiry_date)
}

pub fn validate_dates(
    document_type: &WorkerDocumentType,
    emission_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
) -> Result<(), LifecycleError> {
    if document_type.requires_expiry_date && expiry_date.is_none() {
        return Err(LifecycleError::MissingExpiryDate);
    }
    if let (Some(emission), Some(expiry)) = (emission_date, expiry_date) {
        if emission >= expiry {
            return Err(LifecycleError::DatesOutOfOrder);
        }
    }
    Ok(())
}

/// Whole days until expiry; negative once the document has expired.
pub fn days_remaining(expiry_date: Option<NaiveDate>, today: NaiveDate) -> Option<i64> {
    expiry_date.map(|expiry| (expiry - today).num_days())
}

/// The status shown to clients: anything past its expiry date reads as expired.
pub fn effective_status(
    stored: DocumentStatus,
    expiry_date: Option<NaiveDate>,
    today: NaiveDate,
) -> DocumentStatus {
    match expiry_date {
        Some(expiry) if expiry < today => DocumentStatus::Expired,
        _ => stored,
    }
}

/// Latest submission per document type; later `created_at` wins, ties go to
/// the higher id so the choice is stable.
pub fn current_per_type(documents: Vec<WorkerDocument>) -> HashMap<Uuid, WorkerDocument> {
    let mut current: HashMap<Uuid, WorkerDocument> = HashMap::new();
    for document in documents {
        match current.get(&document.document_type_id) {
            Some(existing)
                if (existing.created_at, existing.id) >= (document.created_at, document.id) => {}
            _ => {
                current.insert(document.document_type_id, document);
            }
        }
    }
    current
}

#[derive(Debug, Clone)]
pub enum DocumentSlot {
    Missing,
    Present(WorkerDocument),
}

impl DocumentSlot {
    pub fn status(&self) -> DocumentStatus {
        match self {
            DocumentSlot::Missing => DocumentStatus::Pending,
            DocumentSlot::Present(document) => document
                .status
                .parse()
                .unwrap_or(DocumentStatus::UnderReview),
        }
    }

    pub fn document(&self) -> Option<&WorkerDocument> {
        match self {
            DocumentSlot::Missing => None,
            DocumentSlot::Present(document) => Some(document),
        }
    }
}

pub fn document_status_for_type(
    current: &HashMap<Uuid, WorkerDocument>,
    document_type_id: Uuid,
) -> DocumentSlot {
    current
        .get(&document_type_id)
        .cloned()
        .map(DocumentSlot::Present)
        .unwrap_or(DocumentSlot::Missing)
}

/// Field changes requested on an existing document. `None` means untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentChanges {
    pub status: Option<DocumentStatus>,
    pub admin_comments: Option<Option<String>>,
    pub emission_date: Option<Option<NaiveDate>>,
    pub expiry_date: Option<Option<NaiveDate>>,
}

impl DocumentChanges {
    /// Drops reviewer-only fields for non-admin callers and reports which
    /// ones were discarded.
    pub fn permitted_for(mut self, is_admin: bool) -> (Self, Vec<&'static str>) {
        let mut ignored = Vec::new();
        if !is_admin {
            if self.status.take().is_some() {
                ignored.push("status");
            }
            if self.admin_comments.take().is_some() {
                ignored.push("admin_comments");
            }
        }
        (self, ignored)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.admin_comments.is_none()
            && self.emission_date.is_none()
            && self.expiry_date.is_none()
    }
}

/// Reference zone that decides which calendar day "today" is.
#[derive(Debug, Clone, Copy)]
pub struct BusinessCalendar {
    offset: FixedOffset,
}

impl BusinessCalendar {
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or(Utc.fix());
        Self { offset }
    }

    pub fn today(&self) -> NaiveDate {
        self.today_at(Utc::now())
    }

    pub fn today_at(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}
