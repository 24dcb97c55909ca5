//! Partial-update helpers. PATCH bodies arrive as JSON objects where a
//! missing key leaves a column alone and an explicit `null` clears it.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullableValue<T> {
    Omitted,
    Null,
    Value(T),
}

impl<T> NullableValue<T> {
    /// `None` when omitted, `Some(None)` when cleared.
    pub fn into_change(self) -> Option<Option<T>> {
        match self {
            NullableValue::Omitted => None,
            NullableValue::Null => Some(None),
            NullableValue::Value(value) => Some(Some(value)),
        }
    }
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue<String>, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(NullableValue::Null)
            } else {
                Ok(NullableValue::Value(trimmed.to_owned()))
            }
        }
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

pub fn classify_nullable_date(
    optional_value: Option<&Value>,
) -> Result<NullableValue<NaiveDate>, String> {
    match classify_nullable(optional_value)? {
        NullableValue::Omitted => Ok(NullableValue::Omitted),
        NullableValue::Null => Ok(NullableValue::Null),
        NullableValue::Value(raw) => parse_date(&raw).map(NullableValue::Value),
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("expected a YYYY-MM-DD date, got '{raw}'"))
}

/// Nullable text column change.
pub fn optional_text(body: &Map<String, Value>, field: &str) -> AppResult<Option<Option<String>>> {
    classify_nullable(body.get(field))
        .map(NullableValue::into_change)
        .map_err(|problem| AppError::invalid_field(field, problem))
}

/// Nullable date column change.
pub fn optional_date(
    body: &Map<String, Value>,
    field: &str,
) -> AppResult<Option<Option<NaiveDate>>> {
    classify_nullable_date(body.get(field))
        .map(NullableValue::into_change)
        .map_err(|problem| AppError::invalid_field(field, problem))
}

/// Non-nullable text column change: may be omitted but never cleared.
pub fn required_text(body: &Map<String, Value>, field: &str) -> AppResult<Option<String>> {
    match classify_nullable(body.get(field)) {
        Ok(NullableValue::Omitted) => Ok(None),
        Ok(NullableValue::Null) => Err(AppError::invalid_field(field, "must not be empty")),
        Ok(NullableValue::Value(value)) => Ok(Some(value)),
        Err(problem) => Err(AppError::invalid_field(field, problem)),
    }
}
