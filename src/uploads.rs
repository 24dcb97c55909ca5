//! File attachment gateway: validation, key generation and storage of
//! uploaded payloads.

use std::sync::atomic::{AtomicI64, Ordering};

use axum::extract::multipart::Field;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::storage::PutObject;

pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;
const MAX_FILENAME_CHARS: usize = 120;
const FALLBACK_FILENAME: &str = "file";
const GENERIC_MIME: &str = "application/octet-stream";

pub const IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
];

pub const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.text",
    "application/vnd.oasis.opendocument.spreadsheet",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("file must not be empty")]
    Empty,
    #[error("file exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("files of type '{0}' are not accepted")]
    UnsupportedMediaType(String),
}

impl From<UploadError> for AppError {
    fn from(value: UploadError) -> Self {
        match value {
            UploadError::Empty => AppError::invalid_field("file", "must not be empty"),
            UploadError::TooLarge { limit } => AppError::file_too_large(limit),
            UploadError::UnsupportedMediaType(mime) => AppError::unsupported_media_type(&mime),
        }
    }
}

/// A file read from a multipart field, not yet stored.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Result of putting an [`IncomingFile`] into object storage.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub checksum: String,
}

/// Falls back to the filename extension when the client sent nothing useful.
pub fn resolve_mime(declared: Option<&str>, filename: &str) -> String {
    let declared = declared
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != GENERIC_MIME);

    declared.unwrap_or_else(|| {
        mime_guess::from_path(filename)
            .first_raw()
            .unwrap_or(GENERIC_MIME)
            .to_string()
    })
}

pub fn validate_upload(size: usize, mime: &str, allowed: &[&str]) -> Result<(), UploadError> {
    if size == 0 {
        return Err(UploadError::Empty);
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge {
            limit: MAX_UPLOAD_BYTES,
        });
    }
    if !allowed.contains(&mime) {
        return Err(UploadError::UnsupportedMediaType(mime.to_string()));
    }
    Ok(())
}

/// Reduces a client-supplied name to something safe inside an object key.
pub fn sanitize_filename(name: &str) -> String {
    let last_segment = name.rsplit(['/', '\\']).next().unwrap_or("");
    let mapped: String = last_segment
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed: String = mapped
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();

    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed
    }
}

/// Hands out `{scope}/{millis}-{name}` keys. The millisecond component is
/// strictly increasing across the process even when calls land in the same
/// millisecond or the wall clock steps back.
#[derive(Debug, Default)]
pub struct ObjectKeyGenerator {
    last_millis: AtomicI64,
}

impl ObjectKeyGenerator {
    pub fn next_millis(&self) -> i64 {
        self.next_millis_from(Utc::now().timestamp_millis())
    }

    fn next_millis_from(&self, now: i64) -> i64 {
        let mut previous = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(previous + 1);
            match self.last_millis.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => previous = actual,
            }
        }
    }

    pub fn object_key(&self, scope: &str, filename: &str) -> String {
        let scope = scope.trim_matches('/');
        format!(
            "{scope}/{}-{}",
            self.next_millis(),
            sanitize_filename(filename)
        )
    }
}

pub fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let quoted: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' | '\r' | '\n' => '_',
            _ => ch,
        })
        .collect();

    let encoded = percent_encoding::utf8_percent_encode(&quoted, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{quoted}\"; filename*=UTF-8''{encoded}"
    ))
}

pub fn checksum_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub async fn read_file_field(field: Field<'_>) -> AppResult<IncomingFile> {
    let filename = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
    let content_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await.map_err(|err| {
        error!(error = %err, "failed to read uploaded file bytes");
        AppError::bad_request(format!("failed to read file bytes: {err}"))
    })?;

    Ok(IncomingFile {
        filename,
        content_type,
        bytes: bytes.to_vec(),
    })
}

pub async fn read_text_field(field: Field<'_>) -> AppResult<String> {
    let name = field.name().unwrap_or("field").to_string();
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(|err| AppError::invalid_field(&name, format!("could not be read: {err}")))
}

/// Validates and writes `file` under `scope`, returning the stored key.
pub async fn store(
    state: &AppState,
    scope: &str,
    file: IncomingFile,
    allowed: &[&str],
) -> AppResult<StoredObject> {
    let IncomingFile {
        filename,
        content_type,
        bytes,
    } = file;

    let mime_type = resolve_mime(content_type.as_deref(), &filename);
    validate_upload(bytes.len(), &mime_type, allowed)?;

    let key = state.object_keys.object_key(scope, &filename);
    let checksum = checksum_hex(&bytes);
    let size_bytes = bytes.len() as i64;

    state
        .storage
        .put_object(PutObject {
            key: key.clone(),
            bytes,
            content_type: Some(mime_type.clone()),
            content_disposition: inline_content_disposition(&filename),
        })
        .await
        .map_err(|err| {
            error!(error = %err, key = %key, "failed to store uploaded object");
            AppError::internal(format!("failed to store object: {err}"))
        })?;

    info!(key = %key, size_bytes, mime_type = %mime_type, "stored uploaded object");

    Ok(StoredObject {
        key,
        filename,
        mime_type,
        size_bytes,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_characters_only() {
        assert_eq!(sanitize_filename("contrato firmado.pdf"), "contrato_firmado.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\ana\\cédula.jpg"), "c_dula.jpg");
        assert_eq!(sanitize_filename("...hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("dir/"), "file");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(300) + ".pdf";
        assert_eq!(sanitize_filename(&long).chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn keys_are_unique_within_the_same_millisecond() {
        let generator = ObjectKeyGenerator::default();
        let first = generator.next_millis_from(1_700_000_000_000);
        let second = generator.next_millis_from(1_700_000_000_000);
        let after_clock_step_back = generator.next_millis_from(1_600_000_000_000);
        assert_eq!(first, 1_700_000_000_000);
        assert_eq!(second, first + 1);
        assert_eq!(after_clock_step_back, first + 2);
    }

    #[test]
    fn object_key_layout() {
        let generator = ObjectKeyGenerator::default();
        let key = generator.object_key("/workers/abc/documents/", "Licencia conducir.PDF");
        let (scope, name) = key.rsplit_once('/').unwrap();
        assert_eq!(scope, "workers/abc/documents");
        let (millis, filename) = name.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(filename, "Licencia_conducir.PDF");

        let other = generator.object_key("workers/abc/documents", "Licencia conducir.PDF");
        assert_ne!(key, other);
    }

    #[test]
    fn mime_resolution_prefers_a_specific_declared_type() {
        assert_eq!(resolve_mime(Some("image/png"), "photo.jpg"), "image/png");
        assert_eq!(
            resolve_mime(Some("application/octet-stream"), "contrato.pdf"),
            "application/pdf"
        );
        assert_eq!(
            resolve_mime(None, "planilla.xlsx"),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        assert_eq!(resolve_mime(Some("Application/PDF; charset=binary"), "x"), "application/pdf");
        assert_eq!(resolve_mime(None, "no-extension"), GENERIC_MIME);
    }

    #[test]
    fn validation_checks_size_and_type() {
        assert_eq!(
            validate_upload(0, "application/pdf", DOCUMENT_MIME_TYPES),
            Err(UploadError::Empty)
        );
        assert_eq!(
            validate_upload(MAX_UPLOAD_BYTES + 1, "application/pdf", DOCUMENT_MIME_TYPES),
            Err(UploadError::TooLarge {
                limit: MAX_UPLOAD_BYTES
            })
        );
        assert!(validate_upload(MAX_UPLOAD_BYTES, "application/pdf", DOCUMENT_MIME_TYPES).is_ok());
        assert_eq!(
            validate_upload(10, "application/x-msdownload", DOCUMENT_MIME_TYPES),
            Err(UploadError::UnsupportedMediaType(
                "application/x-msdownload".to_string()
            ))
        );
        assert!(validate_upload(10, "application/pdf", IMAGE_MIME_TYPES).is_err());
    }

    #[test]
    fn content_disposition_is_inline_and_encoded() {
        let header = inline_content_disposition("Examen \"final\".pdf").unwrap();
        assert!(header.starts_with("inline; filename=\"Examen _final_.pdf\""));
        assert!(header.contains("filename*=UTF-8''Examen%20%5Ffinal%5F%2Epdf"));
        assert!(inline_content_disposition("").is_none());
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
