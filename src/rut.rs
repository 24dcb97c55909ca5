//! Chilean tax identifiers (RUT).
//!
//! A RUT is a body of up to nine digits followed by a verifier that is either
//! a digit or `K`, usually written `76.123.456-7`. Companies and workers are
//! deduplicated on the normalized form `76123456-7`.

use std::fmt;

use thiserror::Error;

use crate::error::AppError;

const MAX_BODY_DIGITS: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RutError {
    #[error("tax id must not be empty")]
    Empty,
    #[error("tax id must look like 12.345.678-5")]
    Format,
    #[error("tax id check digit does not match")]
    CheckDigit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rut {
    body: u32,
    verifier: char,
}

impl Rut {
    /// Parses the format only; the verifier is not checked against the body.
    pub fn parse(raw: &str) -> Result<Self, RutError> {
        let cleaned: String = raw
            .chars()
            .filter(|ch| !matches!(ch, '.' | ' '))
            .map(|ch| ch.to_ascii_uppercase())
            .collect();

        if cleaned.is_empty() {
            return Err(RutError::Empty);
        }

        let (body, verifier) = match cleaned.rsplit_once('-') {
            Some((body, verifier)) => (body.to_string(), verifier.to_string()),
            None => {
                let mut chars = cleaned.chars();
                let last = chars.next_back().map(String::from).unwrap_or_default();
                (chars.as_str().to_string(), last)
            }
        };

        if body.is_empty()
            || body.len() > MAX_BODY_DIGITS
            || !body.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(RutError::Format);
        }

        let mut verifier_chars = verifier.chars();
        let verifier = match (verifier_chars.next(), verifier_chars.next()) {
            (Some(ch), None) if ch.is_ascii_digit() || ch == 'K' => ch,
            _ => return Err(RutError::Format),
        };

        let body: u32 = body.parse().map_err(|_| RutError::Format)?;
        if body == 0 {
            return Err(RutError::Format);
        }

        Ok(Self { body, verifier })
    }

    /// Parses and additionally requires a valid mod-11 check digit.
    pub fn parse_strict(raw: &str) -> Result<Self, RutError> {
        let rut = Self::parse(raw)?;
        if rut.has_valid_check_digit() {
            Ok(rut)
        } else {
            Err(RutError::CheckDigit)
        }
    }

    pub fn parse_with(raw: &str, strict: bool) -> Result<Self, RutError> {
        if strict {
            Self::parse_strict(raw)
        } else {
            Self::parse(raw)
        }
    }

    pub fn expected_verifier(body: u32) -> char {
        let mut remaining = body;
        let mut factor = 2;
        let mut sum = 0;
        while remaining > 0 {
            sum += (remaining % 10) * factor;
            remaining /= 10;
            factor = if factor == 7 { 2 } else { factor + 1 };
        }

        match 11 - (sum % 11) {
            11 => '0',
            10 => 'K',
            digit => char::from_digit(digit, 10).unwrap_or('0'),
        }
    }

    pub fn has_valid_check_digit(&self) -> bool {
        Self::expected_verifier(self.body) == self.verifier
    }

    pub fn normalized(&self) -> String {
        format!("{}-{}", self.body, self.verifier)
    }

    /// Display form with thousands separators, e.g. `12.345.678-5`.
    pub fn formatted(&self) -> String {
        let digits = self.body.to_string();
        let mut grouped = String::with_capacity(digits.len() + 4);
        for (index, ch) in digits.chars().enumerate() {
            if index > 0 && (digits.len() - index) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(ch);
        }
        format!("{grouped}-{}", self.verifier)
    }
}

impl fmt::Display for Rut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl From<RutError> for AppError {
    fn from(value: RutError) -> Self {
        AppError::invalid_field("rut", value.to_string())
    }
}
