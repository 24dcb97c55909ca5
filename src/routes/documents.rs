use std::time::Duration;

use axum::extract::{Json, Multipart, Path, State};
use axum::http::StatusCode;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::to_iso;
use crate::audit::{self, AuditEvent};
use crate::auth::{authorize, authorize_current, ClientContext, Principal, Role};
use crate::documents::{
    current_per_type, days_remaining, document_status_for_type, effective_status,
    review_transition, validate_dates, validate_submission, DocumentChanges, DocumentSlot,
    DocumentStatus,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    NewWorkerDocument, StoredFile, WorkerDocument, WorkerDocumentType,
};
use crate::schema::{companies, files, worker_document_types, worker_documents, workers};
use crate::state::AppState;
use crate::tasks::{enqueue_purge, orphaned_keys};
use crate::tenancy::{document_in_scope, worker_in_scope};
use crate::uploads::{self, IncomingFile, DOCUMENT_MIME_TYPES};
use crate::utils::json::{optional_date, optional_text, parse_date};

const REGISTRY_ROLES: &[Role] = &[Role::User, Role::Admin];
const RESOURCE: &str = "worker_document";

#[derive(Serialize)]
pub struct DocumentTypeResponse {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub requires_front_back: bool,
    pub requires_expiry_date: bool,
    pub order_index: i32,
}

impl From<WorkerDocumentType> for DocumentTypeResponse {
    fn from(value: WorkerDocumentType) -> Self {
        Self {
            id: value.id,
            code: value.code,
            name: value.name,
            requires_front_back: value.requires_front_back,
            requires_expiry_date: value.requires_expiry_date,
            order_index: value.order_index,
        }
    }
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub document_type_id: Uuid,
    pub status: String,
    pub effective_status: DocumentStatus,
    pub days_remaining: Option<i64>,
    pub emission_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub front_file_key: String,
    pub back_file_key: Option<String>,
    pub uploaded_by: Uuid,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<String>,
    pub admin_comments: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct DocumentSlotResponse {
    pub document_type: DocumentTypeResponse,
    pub status: DocumentStatus,
    pub effective_status: DocumentStatus,
    pub days_remaining: Option<i64>,
    pub document: Option<DocumentResponse>,
}

#[derive(Serialize)]
pub struct WorkerDocumentsResponse {
    pub worker_id: Uuid,
    pub slots: Vec<DocumentSlotResponse>,
    pub history: Vec<DocumentResponse>,
}

#[derive(Serialize)]
pub struct PendingDocumentResponse {
    pub document: DocumentResponse,
    pub document_type_name: String,
    pub worker_name: String,
    pub company_id: Uuid,
    pub company_name: String,
}

#[derive(Serialize)]
pub struct DownloadUrlResponse {
    pub front_url: String,
    pub back_url: Option<String>,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub worker_id: Uuid,
    pub document_type_id: Uuid,
    pub emission_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub front_file_id: Uuid,
    pub back_file_id: Option<Uuid>,
}

#[derive(AsChangeset)]
#[diesel(table_name = worker_documents)]
struct DocumentChangeset {
    status: Option<String>,
    admin_comments: Option<Option<String>>,
    emission_date: Option<Option<NaiveDate>>,
    expiry_date: Option<Option<NaiveDate>>,
    reviewed_by: Option<Option<Uuid>>,
    reviewed_at: Option<Option<NaiveDateTime>>,
    updated_at: NaiveDateTime,
}

fn to_document_response(document: WorkerDocument, today: NaiveDate) -> DocumentResponse {
    let stored = document
        .status
        .parse()
        .unwrap_or(DocumentStatus::UnderReview);
    DocumentResponse {
        id: document.id,
        worker_id: document.worker_id,
        document_type_id: document.document_type_id,
        effective_status: effective_status(stored, document.expiry_date, today),
        days_remaining: days_remaining(document.expiry_date, today),
        status: document.status,
        emission_date: document.emission_date,
        expiry_date: document.expiry_date,
        front_file_key: document.front_file_key,
        back_file_key: document.back_file_key,
        uploaded_by: document.uploaded_by,
        reviewed_by: document.reviewed_by,
        reviewed_at: document.reviewed_at.map(to_iso),
        admin_comments: document.admin_comments,
        created_at: to_iso(document.created_at),
        updated_at: to_iso(document.updated_at),
    }
}

fn to_slot_response(
    document_type: WorkerDocumentType,
    slot: DocumentSlot,
    today: NaiveDate,
) -> DocumentSlotResponse {
    let status = slot.status();
    match slot {
        DocumentSlot::Missing => DocumentSlotResponse {
            document_type: document_type.into(),
            status,
            effective_status: status,
            days_remaining: None,
            document: None,
        },
        DocumentSlot::Present(document) => {
            let response = to_document_response(document, today);
            DocumentSlotResponse {
                document_type: document_type.into(),
                status,
                effective_status: response.effective_status,
                days_remaining: response.days_remaining,
                document: Some(response),
            }
        }
    }
}

fn load_document_type(
    conn: &mut PgConnection,
    document_type_id: Uuid,
) -> AppResult<WorkerDocumentType> {
    worker_document_types::table
        .find(document_type_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::invalid_field("document_type_id", "unknown document type"))
}

fn insert_document(
    conn: &mut PgConnection,
    new_document: &NewWorkerDocument,
) -> AppResult<WorkerDocument> {
    Ok(diesel::insert_into(worker_documents::table)
        .values(new_document)
        .get_result(conn)?)
}

fn parse_optional_date(field: &str, raw: &str) -> AppResult<Option<NaiveDate>> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_date(raw)
        .map(Some)
        .map_err(|problem| AppError::invalid_field(field, problem))
}

fn parse_uuid_field(field: &str, raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::invalid_field(field, "must be a valid UUID"))
}

pub async fn list_types(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<DocumentTypeResponse>>> {
    let mut conn = state.db()?;
    let types: Vec<WorkerDocumentType> = worker_document_types::table
        .order(worker_document_types::order_index.asc())
        .load(&mut conn)?;
    Ok(Json(types.into_iter().map(Into::into).collect()))
}

/// One slot per catalog type plus the full submission history, newest first.
pub async fn list_for_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<WorkerDocumentsResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    worker_in_scope(&mut conn, &principal, worker_id)?;

    let types: Vec<WorkerDocumentType> = worker_document_types::table
        .order(worker_document_types::order_index.asc())
        .load(&mut conn)?;
    let history: Vec<WorkerDocument> = worker_documents::table
        .filter(worker_documents::worker_id.eq(worker_id))
        .order((worker_documents::created_at.desc(), worker_documents::id.desc()))
        .load(&mut conn)?;

    let today = state.calendar.today();
    let current = current_per_type(history.clone());
    let slots = types
        .into_iter()
        .map(|document_type| {
            let slot = document_status_for_type(&current, document_type.id);
            to_slot_response(document_type, slot, today)
        })
        .collect();

    Ok(Json(WorkerDocumentsResponse {
        worker_id,
        slots,
        history: history
            .into_iter()
            .map(|document| to_document_response(document, today))
            .collect(),
    }))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<DocumentResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    let (document, _, _) = document_in_scope(&mut conn, &principal, document_id)?;
    Ok(Json(to_document_response(document, state.calendar.today())))
}

/// Creates a submission from files previously uploaded through the files API.
pub async fn create_document(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    Json(payload): Json<CreateDocumentRequest>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    worker_in_scope(&mut conn, &principal, payload.worker_id)?;
    let document_type = load_document_type(&mut conn, payload.document_type_id)?;

    validate_submission(
        &document_type,
        payload.back_file_id.is_some(),
        payload.emission_date,
        payload.expiry_date,
    )?;

    let mut own_file = |file_id: Uuid, field: &str| -> AppResult<StoredFile> {
        files::table
            .find(file_id)
            .filter(files::uploaded_by.eq(principal.user_id))
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| AppError::invalid_field(field, "file not found"))
    };
    let front = own_file(payload.front_file_id, "front_file_id")?;
    let back = payload
        .back_file_id
        .map(|file_id| own_file(file_id, "back_file_id"))
        .transpose()?;

    let new_document = NewWorkerDocument {
        id: Uuid::new_v4(),
        worker_id: payload.worker_id,
        document_type_id: document_type.id,
        status: DocumentStatus::UnderReview.as_str().to_string(),
        emission_date: payload.emission_date,
        expiry_date: payload.expiry_date,
        front_file_key: front.storage_key,
        back_file_key: back.map(|file| file.storage_key),
        uploaded_by: principal.user_id,
    };
    let document = insert_document(&mut conn, &new_document)?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::DOCUMENT_SUBMITTED, RESOURCE, document.id)
            .by(&principal, &client)
            .details(json!({
                "worker_id": document.worker_id,
                "document_type": document_type.code,
                "source": "files",
            })),
    );

    Ok((
        StatusCode::CREATED,
        Json(to_document_response(document, state.calendar.today())),
    ))
}

pub async fn upload_document(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    authorize(&principal, REGISTRY_ROLES)?;

    let mut worker_id: Option<Uuid> = None;
    let mut document_type_id: Option<Uuid> = None;
    let mut emission_date: Option<NaiveDate> = None;
    let mut expiry_date: Option<NaiveDate> = None;
    let mut front: Option<IncomingFile> = None;
    let mut back: Option<IncomingFile> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        match field.name() {
            Some("file") => front = Some(uploads::read_file_field(field).await?),
            Some("file_back") => {
                let file = uploads::read_file_field(field).await?;
                if !file.bytes.is_empty() {
                    back = Some(file);
                }
            }
            Some("worker_id") => {
                let raw = uploads::read_text_field(field).await?;
                worker_id = Some(parse_uuid_field("worker_id", &raw)?);
            }
            Some("document_type_id") => {
                let raw = uploads::read_text_field(field).await?;
                document_type_id = Some(parse_uuid_field("document_type_id", &raw)?);
            }
            Some("emission_date") => {
                let raw = uploads::read_text_field(field).await?;
                emission_date = parse_optional_date("emission_date", &raw)?;
            }
            Some("expiry_date") => {
                let raw = uploads::read_text_field(field).await?;
                expiry_date = parse_optional_date("expiry_date", &raw)?;
            }
            _ => {}
        }
    }

    let worker_id = worker_id.ok_or_else(|| AppError::invalid_field("worker_id", "is required"))?;
    let document_type_id = document_type_id
        .ok_or_else(|| AppError::invalid_field("document_type_id", "is required"))?;
    let front = front.ok_or_else(|| AppError::invalid_field("file", "is required"))?;

    let document_type = {
        let mut conn = state.db()?;
        worker_in_scope(&mut conn, &principal, worker_id)?;
        load_document_type(&mut conn, document_type_id)?
    };

    validate_submission(&document_type, back.is_some(), emission_date, expiry_date)?;
    for file in std::iter::once(&front).chain(back.as_ref()) {
        let mime = uploads::resolve_mime(file.content_type.as_deref(), &file.filename);
        uploads::validate_upload(file.bytes.len(), &mime, DOCUMENT_MIME_TYPES)?;
    }

    let scope = format!("workers/{worker_id}/documents");
    let front = uploads::store(&state, &scope, front, DOCUMENT_MIME_TYPES).await?;
    let back = match back {
        Some(file) => Some(uploads::store(&state, &scope, file, DOCUMENT_MIME_TYPES).await?),
        None => None,
    };

    let new_document = NewWorkerDocument {
        id: Uuid::new_v4(),
        worker_id,
        document_type_id,
        status: DocumentStatus::UnderReview.as_str().to_string(),
        emission_date,
        expiry_date,
        front_file_key: front.key.clone(),
        back_file_key: back.as_ref().map(|stored| stored.key.clone()),
        uploaded_by: principal.user_id,
    };

    let mut conn = state.db()?;
    let document = match insert_document(&mut conn, &new_document) {
        Ok(document) => document,
        Err(err) => {
            let keys = std::iter::once(front.key)
                .chain(back.map(|stored| stored.key))
                .collect();
            if let Err(purge_err) = enqueue_purge(&mut conn, keys, "document insert failed") {
                warn!(error = %purge_err, "failed to queue purge after document insert failure");
            }
            return Err(err);
        }
    };

    audit::record(
        &mut conn,
        AuditEvent::new(audit::DOCUMENT_SUBMITTED, RESOURCE, document.id)
            .by(&principal, &client)
            .details(json!({
                "worker_id": worker_id,
                "document_type": document_type.code,
                "has_back": document.back_file_key.is_some(),
                "size_bytes": front.size_bytes,
            })),
    );
    info!(document_id = %document.id, %worker_id, document_type = %document_type.code, "document uploaded");

    Ok((
        StatusCode::CREATED,
        Json(to_document_response(document, state.calendar.today())),
    ))
}

/// Owners may edit dates. Status and comments come from admins only and are
/// dropped silently for everyone else.
pub async fn update_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
    Json(body): Json<Map<String, Value>>,
) -> AppResult<Json<DocumentResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;

    let status = match body.get("status") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(raw.parse::<DocumentStatus>()?),
        Some(other) => {
            return Err(AppError::invalid_field(
                "status",
                format!("expected string, got {other}"),
            ))
        }
    };
    let requested = DocumentChanges {
        status,
        admin_comments: optional_text(&body, "admin_comments")?,
        emission_date: optional_date(&body, "emission_date")?,
        expiry_date: optional_date(&body, "expiry_date")?,
    };

    let mut conn = state.db()?;
    let (document, _, _) = document_in_scope(&mut conn, &principal, document_id)?;

    let is_admin = if principal.is_admin() {
        authorize_current(&mut conn, &principal, &[Role::Admin]).is_ok()
    } else {
        false
    };
    let (changes, ignored) = requested.permitted_for(is_admin);
    if !ignored.is_empty() {
        debug!(%document_id, user_id = %principal.user_id, ?ignored, "ignored reviewer-only fields");
    }

    let today = state.calendar.today();
    if changes.is_empty() {
        return Ok(Json(to_document_response(document, today)));
    }

    let document_type: WorkerDocumentType = worker_document_types::table
        .find(document.document_type_id)
        .first(&mut conn)?;
    let emission = changes.emission_date.unwrap_or(document.emission_date);
    let expiry = changes.expiry_date.unwrap_or(document.expiry_date);
    if changes.emission_date.is_some() || changes.expiry_date.is_some() {
        validate_dates(&document_type, emission, expiry)?;
    }

    let current: DocumentStatus = document
        .status
        .parse()
        .map_err(|err| AppError::internal(format!("stored document status invalid: {err}")))?;
    let next = changes
        .status
        .map(|requested| review_transition(current, requested))
        .transpose()?;

    let now = Utc::now().naive_utc();
    let reviewed = next.is_some() || changes.admin_comments.is_some();
    let changeset = DocumentChangeset {
        status: next.map(|status| status.as_str().to_string()),
        admin_comments: changes.admin_comments.clone(),
        emission_date: changes.emission_date,
        expiry_date: changes.expiry_date,
        reviewed_by: reviewed.then_some(Some(principal.user_id)),
        reviewed_at: reviewed.then_some(Some(now)),
        updated_at: now,
    };

    // Guarded on the status we read so a concurrent review cannot be overwritten.
    let updated: WorkerDocument = diesel::update(
        worker_documents::table
            .filter(worker_documents::id.eq(document.id))
            .filter(worker_documents::status.eq(&document.status)),
    )
    .set(&changeset)
    .get_result(&mut conn)
    .optional()?
    .ok_or_else(|| {
        AppError::conflicting_transition("document was modified by another request")
    })?;

    let action = if next.is_some() {
        audit::DOCUMENT_REVIEWED
    } else {
        audit::DOCUMENT_UPDATED
    };
    audit::record(
        &mut conn,
        AuditEvent::new(action, RESOURCE, updated.id)
            .by(&principal, &client)
            .details(json!({
                "from": current.as_str(),
                "to": updated.status,
                "fields": body.keys().collect::<Vec<_>>(),
                "ignored": ignored,
            })),
    );

    Ok(Json(to_document_response(updated, today)))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<StatusCode> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    let (document, worker, _) = document_in_scope(&mut conn, &principal, document_id)?;
    let is_admin =
        principal.is_admin() && authorize_current(&mut conn, &principal, &[Role::Admin]).is_ok();

    let keys: Vec<String> = std::iter::once(document.front_file_key.clone())
        .chain(document.back_file_key.clone())
        .collect();

    // Keys shared with another document or an active file stay in storage.
    let inline_deletes = conn.transaction::<_, AppError, _>(|conn| {
        diesel::delete(worker_documents::table.find(document.id)).execute(conn)?;
        if is_admin {
            return Ok(orphaned_keys(conn, keys.clone())?);
        }
        enqueue_purge(conn, keys.clone(), "document deleted")
            .map_err(|err| AppError::internal(format!("failed to queue object purge: {err}")))?;
        Ok(Vec::new())
    })?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::DOCUMENT_DELETED, RESOURCE, document.id)
            .by(&principal, &client)
            .details(json!({ "worker_id": worker.id, "keys": keys })),
    );
    drop(conn);

    for key in &inline_deletes {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(%document_id, key = %key, error = %err, "failed to delete document object");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Review queue: everything still awaiting a reviewer, oldest first.
pub async fn list_pending(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<Vec<PendingDocumentResponse>>> {
    let mut conn = state.db()?;
    authorize_current(&mut conn, &principal, &[Role::Admin])?;

    let rows: Vec<(WorkerDocument, String, String, String, Uuid, String)> =
        worker_documents::table
            .inner_join(worker_document_types::table)
            .inner_join(workers::table.inner_join(companies::table))
            .filter(worker_documents::status.eq_any([
                DocumentStatus::UnderReview.as_str(),
                DocumentStatus::InReview.as_str(),
            ]))
            .order(worker_documents::created_at.asc())
            .select((
                worker_documents::all_columns,
                worker_document_types::name,
                workers::first_name,
                workers::last_name,
                companies::id,
                companies::name,
            ))
            .load(&mut conn)?;

    let today = state.calendar.today();
    let response = rows
        .into_iter()
        .map(
            |(document, type_name, first_name, last_name, company_id, company_name)| {
                PendingDocumentResponse {
                    document: to_document_response(document, today),
                    document_type_name: type_name,
                    worker_name: format!("{first_name} {last_name}"),
                    company_id,
                    company_name,
                }
            },
        )
        .collect();

    Ok(Json(response))
}

pub async fn download_url(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<DownloadUrlResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let document = {
        let mut conn = state.db()?;
        document_in_scope(&mut conn, &principal, document_id)?.0
    };

    let expires_in = state.config.download_url_expiry_seconds;
    let presign = |key: String| {
        let storage = state.storage.clone();
        async move {
            storage
                .presign_get_object(&key, Duration::from_secs(expires_in))
                .await
                .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))
        }
    };

    let front_url = presign(document.front_file_key).await?;
    let back_url = match document.back_file_key {
        Some(key) => Some(presign(key).await?),
        None => None,
    };

    Ok(Json(DownloadUrlResponse {
        front_url,
        back_url,
        expires_in,
    }))
}
