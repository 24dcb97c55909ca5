//! Job and quote negotiation.
//!
//! A job moves through five stages in order and never back:
//! `POR_REVISAR -> REVISION_EN_PROGRESO -> COTIZACION -> TRABAJO_EN_PROGRESO -> FINALIZADO`.
//! The first quote skips the review stage when nobody started one.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::error::AppError;

pub const DEFAULT_CURRENCY: &str = "CLP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    PorRevisar,
    RevisionEnProgreso,
    Cotizacion,
    TrabajoEnProgreso,
    Finalizado,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::PorRevisar,
        JobStatus::RevisionEnProgreso,
        JobStatus::Cotizacion,
        JobStatus::TrabajoEnProgreso,
        JobStatus::Finalizado,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::PorRevisar => "POR_REVISAR",
            JobStatus::RevisionEnProgreso => "REVISION_EN_PROGRESO",
            JobStatus::Cotizacion => "COTIZACION",
            JobStatus::TrabajoEnProgreso => "TRABAJO_EN_PROGRESO",
            JobStatus::Finalizado => "FINALIZADO",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = NegotiationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_uppercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| NegotiationError::UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Pending,
    Accepted,
    Rejected,
}

impl QuoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QuoteStatus::Pending => "PENDING",
            QuoteStatus::Accepted => "ACCEPTED",
            QuoteStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteStatus {
    type Err = NegotiationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(QuoteStatus::Pending),
            "ACCEPTED" => Ok(QuoteStatus::Accepted),
            "REJECTED" => Ok(QuoteStatus::Rejected),
            _ => Err(NegotiationError::UnknownStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("cannot {action} a job in status {from}")]
    InvalidTransition {
        from: JobStatus,
        action: &'static str,
    },
    #[error("quote is {0} and can no longer be accepted")]
    QuoteNotPending(QuoteStatus),
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("currency must be a three letter code, got '{0}'")]
    InvalidCurrency(String),
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

impl From<NegotiationError> for AppError {
    fn from(value: NegotiationError) -> Self {
        let message = value.to_string();
        match value {
            NegotiationError::InvalidTransition { .. } | NegotiationError::QuoteNotPending(_) => {
                AppError::conflicting_transition(message)
            }
            NegotiationError::NonPositiveAmount => AppError::invalid_field("amount", message),
            NegotiationError::InvalidCurrency(_) => AppError::invalid_field("currency", message),
            NegotiationError::UnknownStatus(_) => AppError::invalid_field("status", message),
        }
    }
}

/// Outcome of applying an action to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(JobStatus),
    Unchanged,
}

impl Transition {
    pub fn resulting(self, current: JobStatus) -> JobStatus {
        match self {
            Transition::Advance(next) => next,
            Transition::Unchanged => current,
        }
    }
}

pub fn start_review(current: JobStatus) -> Result<Transition, NegotiationError> {
    match current {
        JobStatus::PorRevisar => Ok(Transition::Advance(JobStatus::RevisionEnProgreso)),
        JobStatus::RevisionEnProgreso => Ok(Transition::Unchanged),
        from => Err(NegotiationError::InvalidTransition {
            from,
            action: "start review of",
        }),
    }
}

pub fn on_quote_submitted(current: JobStatus) -> Result<Transition, NegotiationError> {
    match current {
        JobStatus::PorRevisar | JobStatus::RevisionEnProgreso => {
            Ok(Transition::Advance(JobStatus::Cotizacion))
        }
        JobStatus::Cotizacion => Ok(Transition::Unchanged),
        from => Err(NegotiationError::InvalidTransition {
            from,
            action: "quote",
        }),
    }
}

/// Accepting always advances; there is no idempotent re-accept.
pub fn accept_quote(
    job_status: JobStatus,
    quote_status: QuoteStatus,
) -> Result<JobStatus, NegotiationError> {
    if job_status != JobStatus::Cotizacion {
        return Err(NegotiationError::InvalidTransition {
            from: job_status,
            action: "accept a quote for",
        });
    }
    if quote_status != QuoteStatus::Pending {
        return Err(NegotiationError::QuoteNotPending(quote_status));
    }
    Ok(JobStatus::TrabajoEnProgreso)
}

pub fn finish(current: JobStatus) -> Result<Transition, NegotiationError> {
    match current {
        JobStatus::TrabajoEnProgreso => Ok(Transition::Advance(JobStatus::Finalizado)),
        JobStatus::Finalizado => Ok(Transition::Unchanged),
        from => Err(NegotiationError::InvalidTransition {
            from,
            action: "finish",
        }),
    }
}

pub fn validate_amount(amount: i64) -> Result<i64, NegotiationError> {
    if amount > 0 {
        Ok(amount)
    } else {
        Err(NegotiationError::NonPositiveAmount)
    }
}

pub fn normalize_currency(currency: Option<&str>) -> Result<String, NegotiationError> {
    let currency = match currency.map(str::trim) {
        None | Some("") => return Ok(DEFAULT_CURRENCY.to_string()),
        Some(value) => value,
    };
    if currency.len() == 3 && currency.chars().all(|ch| ch.is_ascii_alphabetic()) {
        Ok(currency.to_ascii_uppercase())
    } else {
        Err(NegotiationError::InvalidCurrency(currency.to_string()))
    }
}
