use axum::body::Body;
use axum::extract::{Json, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use diesel::{prelude::*, PgConnection};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use super::jobs::visible_job;
use super::to_iso;
use crate::audit::{self, AuditEvent};
use crate::auth::{ClientContext, Principal, Role};
use crate::error::{AppError, AppResult};
use crate::models::{NewStoredFile, StoredFile};
use crate::schema::{companies, files, worker_documents, workers};
use crate::state::AppState;
use crate::tasks::enqueue_purge;
use crate::uploads::{self, inline_content_disposition, DOCUMENT_MIME_TYPES};

pub(crate) const STATUS_ACTIVE: &str = "ACTIVE";

#[derive(Serialize)]
pub struct FileResponse {
    pub id: Uuid,
    pub uploaded_by: Uuid,
    pub job_id: Option<Uuid>,
    pub filename: String,
    pub key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub version: i32,
    pub created_at: String,
}

impl From<StoredFile> for FileResponse {
    fn from(file: StoredFile) -> Self {
        Self {
            id: file.id,
            uploaded_by: file.uploaded_by,
            job_id: file.job_id,
            filename: file.filename,
            key: file.storage_key,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            checksum: file.checksum,
            version: file.version,
            created_at: to_iso(file.created_at),
        }
    }
}

/// Owners of the companies whose worker documents point at `key`.
fn document_owners(conn: &mut PgConnection, key: &str) -> AppResult<Vec<Uuid>> {
    Ok(worker_documents::table
        .inner_join(workers::table.inner_join(companies::table))
        .filter(
            worker_documents::front_file_key
                .eq(key)
                .or(worker_documents::back_file_key.eq(key)),
        )
        .select(companies::owner_id)
        .distinct()
        .load(conn)?)
}

/// Uploaders and admins can always read a file. Files backing a worker
/// document are otherwise limited to the company owner; anything else
/// follows job visibility.
fn ensure_readable(
    conn: &mut PgConnection,
    principal: &Principal,
    file: &StoredFile,
) -> AppResult<()> {
    if principal.is_admin() || file.uploaded_by == principal.user_id {
        return Ok(());
    }

    let owners = document_owners(conn, &file.storage_key)?;
    if !owners.is_empty() {
        return if owners.contains(&principal.user_id) {
            Ok(())
        } else {
            Err(AppError::not_found())
        };
    }

    match (principal.role, file.job_id) {
        (Role::Professional, _) => Ok(()),
        (_, Some(job_id)) => visible_job(conn, principal, job_id).map(|_| ()),
        _ => Err(AppError::not_found()),
    }
}

fn readable_file(
    conn: &mut PgConnection,
    principal: &Principal,
    file_id: Uuid,
) -> AppResult<StoredFile> {
    let file: StoredFile = files::table
        .find(file_id)
        .filter(files::status.eq(STATUS_ACTIVE))
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    ensure_readable(conn, principal, &file)?;
    Ok(file)
}

pub async fn upload_file(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileResponse>)> {
    let mut incoming = None;
    let mut job_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        match field.name() {
            Some("file") => incoming = Some(uploads::read_file_field(field).await?),
            Some("job_id") => {
                let raw = uploads::read_text_field(field).await?;
                if !raw.is_empty() {
                    job_id = Some(
                        Uuid::parse_str(&raw)
                            .map_err(|_| AppError::invalid_field("job_id", "must be a valid UUID"))?,
                    );
                }
            }
            _ => {}
        }
    }

    let incoming = incoming.ok_or_else(|| AppError::invalid_field("file", "is required"))?;

    if let Some(job_id) = job_id {
        let mut conn = state.db()?;
        let job = visible_job(&mut conn, &principal, job_id)?;
        if principal.role == Role::User && job.requester_id != principal.user_id {
            return Err(AppError::not_found());
        }
    }

    let scope = format!("users/{}/files", principal.user_id);
    let stored = uploads::store(&state, &scope, incoming, DOCUMENT_MIME_TYPES).await?;

    let new_file = NewStoredFile {
        id: Uuid::new_v4(),
        uploaded_by: principal.user_id,
        job_id,
        filename: stored.filename.clone(),
        storage_key: stored.key.clone(),
        mime_type: stored.mime_type.clone(),
        size_bytes: stored.size_bytes,
        checksum: stored.checksum.clone(),
        status: STATUS_ACTIVE.to_string(),
    };

    let mut conn = state.db()?;
    let file: StoredFile = match diesel::insert_into(files::table)
        .values(&new_file)
        .get_result(&mut conn)
    {
        Ok(file) => file,
        Err(err) => {
            if let Err(purge_err) = enqueue_purge(&mut conn, vec![stored.key], "file insert failed") {
                warn!(error = %purge_err, "failed to queue purge after file insert failure");
            }
            return Err(err.into());
        }
    };

    audit::record(
        &mut conn,
        AuditEvent::new(audit::FILE_UPLOADED, "file", file.id)
            .by(&principal, &client)
            .details(json!({
                "job_id": file.job_id,
                "mime_type": file.mime_type,
                "size_bytes": file.size_bytes,
                "checksum": file.checksum,
            })),
    );

    Ok((StatusCode::CREATED, Json(file.into())))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<FileResponse>> {
    let mut conn = state.db()?;
    let file = readable_file(&mut conn, &principal, file_id)?;
    Ok(Json(file.into()))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Response> {
    let file = {
        let mut conn = state.db()?;
        readable_file(&mut conn, &principal, file_id)?
    };

    let bytes = state
        .storage
        .get_object(&file.storage_key)
        .await
        .map_err(|err| {
            error!(%file_id, key = %file.storage_key, error = %err, "failed to read stored object");
            AppError::internal(format!("failed to read object: {err}"))
        })?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type.as_str())
        .header(header::CONTENT_LENGTH, bytes.len());
    if let Some(disposition) = inline_content_disposition(&file.filename) {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    builder
        .body(Body::from(bytes))
        .map_err(|err| AppError::internal(format!("failed to build download response: {err}")))
}
