use axum::{
    extract::{Json, Multipart, Path, Query, State},
    http::StatusCode,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::to_iso;
use crate::{
    audit::{self, AuditEvent},
    auth::{authorize, ClientContext, Principal, Role},
    error::{AppError, AppResult},
    models::{NewWorker, Worker, WorkerDocument},
    rut::Rut,
    schema::{worker_documents, workers},
    state::AppState,
    tasks::enqueue_purge,
    tenancy::{company_in_scope, worker_in_scope},
    uploads::{self, IMAGE_MIME_TYPES},
    utils::json::{optional_text, required_text},
};

const REGISTRY_ROLES: &[Role] = &[Role::User, Role::Admin];
const WORKER_STATUSES: &[&str] = &["ACTIVE", "INACTIVE"];
const RESOURCE: &str = "worker";

#[derive(Deserialize)]
pub struct WorkerListQuery {
    pub company_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateWorkerRequest {
    pub company_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub rut: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub position: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = workers)]
struct WorkerChangeset {
    first_name: Option<String>,
    last_name: Option<String>,
    rut: Option<String>,
    email: Option<Option<String>>,
    phone: Option<Option<String>>,
    position: Option<Option<String>>,
    status: Option<String>,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    pub company_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub rut: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub position: Option<String>,
    pub profile_photo_key: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Worker> for WorkerResponse {
    fn from(worker: Worker) -> Self {
        Self {
            id: worker.id,
            company_id: worker.company_id,
            first_name: worker.first_name,
            last_name: worker.last_name,
            rut: worker.rut,
            email: worker.email,
            phone: worker.phone,
            position: worker.position,
            profile_photo_key: worker.profile_photo_key,
            status: worker.status,
            created_at: to_iso(worker.created_at),
            updated_at: to_iso(worker.updated_at),
        }
    }
}

fn required(field: &str, value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(AppError::invalid_field(field, "is required"))
    } else {
        Ok(trimmed.to_string())
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn duplicate_rut() -> AppError {
    AppError::conflict("DuplicateWorkerRut", "a worker with this RUT already exists in the company")
}

/// Every storage key a worker's rows point at.
fn owned_object_keys(worker: &Worker, documents: &[WorkerDocument]) -> Vec<String> {
    documents
        .iter()
        .flat_map(|doc| std::iter::once(doc.front_file_key.clone()).chain(doc.back_file_key.clone()))
        .chain(worker.profile_photo_key.clone())
        .collect()
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<WorkerListQuery>,
    principal: Principal,
) -> AppResult<Json<Vec<WorkerResponse>>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let company_id = query
        .company_id
        .ok_or_else(|| AppError::invalid_field("company_id", "is required"))?;

    let mut conn = state.db()?;
    company_in_scope(&mut conn, &principal, company_id)?;

    let rows: Vec<Worker> = workers::table
        .filter(workers::company_id.eq(company_id))
        .order((workers::last_name.asc(), workers::first_name.asc()))
        .load(&mut conn)?;

    Ok(Json(rows.into_iter().map(WorkerResponse::from).collect()))
}

pub async fn create_worker(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    Json(payload): Json<CreateWorkerRequest>,
) -> AppResult<(StatusCode, Json<WorkerResponse>)> {
    authorize(&principal, REGISTRY_ROLES)?;

    let first_name = required("first_name", &payload.first_name)?;
    let last_name = required("last_name", &payload.last_name)?;
    let rut = Rut::parse_with(&required("rut", &payload.rut)?, state.config.strict_rut_validation)?;

    let mut conn = state.db()?;
    let company = company_in_scope(&mut conn, &principal, payload.company_id)?;

    let new_worker = NewWorker {
        id: Uuid::new_v4(),
        company_id: company.id,
        first_name,
        last_name,
        rut: rut.normalized(),
        email: optional(payload.email),
        phone: optional(payload.phone),
        position: optional(payload.position),
        status: "ACTIVE".to_string(),
    };

    let worker: Worker = match diesel::insert_into(workers::table)
        .values(&new_worker)
        .get_result(&mut conn)
    {
        Ok(worker) => worker,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(duplicate_rut());
        }
        Err(err) => return Err(err.into()),
    };

    audit::record(
        &mut conn,
        AuditEvent::new(audit::WORKER_CREATED, RESOURCE, worker.id)
            .by(&principal, &client)
            .details(json!({ "company_id": company.id, "rut": worker.rut })),
    );
    info!(worker_id = %worker.id, company_id = %company.id, "worker created");

    Ok((StatusCode::CREATED, Json(worker.into())))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<WorkerResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    let (worker, _) = worker_in_scope(&mut conn, &principal, worker_id)?;
    Ok(Json(worker.into()))
}

pub async fn update_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
    Json(body): Json<Map<String, Value>>,
) -> AppResult<Json<WorkerResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;

    let rut = required_text(&body, "rut")?
        .map(|raw| Rut::parse_with(&raw, state.config.strict_rut_validation))
        .transpose()?
        .map(|rut| rut.normalized());

    let status = required_text(&body, "status")?
        .map(|status| {
            let status = status.to_ascii_uppercase();
            if WORKER_STATUSES.contains(&status.as_str()) {
                Ok(status)
            } else {
                Err(AppError::invalid_field("status", "must be ACTIVE or INACTIVE"))
            }
        })
        .transpose()?;

    let changes = WorkerChangeset {
        first_name: required_text(&body, "first_name")?,
        last_name: required_text(&body, "last_name")?,
        rut,
        email: optional_text(&body, "email")?,
        phone: optional_text(&body, "phone")?,
        position: optional_text(&body, "position")?,
        status,
        updated_at: Utc::now().naive_utc(),
    };

    let mut conn = state.db()?;
    worker_in_scope(&mut conn, &principal, worker_id)?;

    let worker: Worker = match diesel::update(workers::table.find(worker_id))
        .set(&changes)
        .get_result(&mut conn)
    {
        Ok(worker) => worker,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(duplicate_rut());
        }
        Err(err) => return Err(err.into()),
    };

    let fields: Vec<&String> = body.keys().collect();
    audit::record(
        &mut conn,
        AuditEvent::new(audit::WORKER_UPDATED, RESOURCE, worker.id)
            .by(&principal, &client)
            .details(json!({ "fields": fields })),
    );

    Ok(Json(worker.into()))
}

/// Hard delete. Documents go with the worker in one transaction; the objects
/// they referenced are handed to the purge task.
pub async fn delete_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<StatusCode> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    let (worker, company) = worker_in_scope(&mut conn, &principal, worker_id)?;

    let removed_documents = conn.transaction::<_, AppError, _>(|conn| {
        let documents: Vec<WorkerDocument> = worker_documents::table
            .filter(worker_documents::worker_id.eq(worker.id))
            .load(conn)?;

        diesel::delete(worker_documents::table.filter(worker_documents::worker_id.eq(worker.id)))
            .execute(conn)?;
        diesel::delete(workers::table.find(worker.id)).execute(conn)?;

        let keys = owned_object_keys(&worker, &documents);
        enqueue_purge(conn, keys, "worker deleted")
            .map_err(|err| AppError::internal(format!("failed to queue object purge: {err}")))?;

        Ok(documents.len())
    })?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::WORKER_DELETED, RESOURCE, worker.id)
            .by(&principal, &client)
            .details(json!({ "company_id": company.id, "documents_removed": removed_documents })),
    );
    info!(%worker_id, removed_documents, "worker deleted");

    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_photo(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
    mut multipart: Multipart,
) -> AppResult<Json<WorkerResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    {
        let mut conn = state.db()?;
        worker_in_scope(&mut conn, &principal, worker_id)?;
    }

    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() == Some("file") {
            file = Some(uploads::read_file_field(field).await?);
        }
    }
    let file = file.ok_or_else(|| AppError::invalid_field("file", "is required"))?;

    let scope = format!("workers/{worker_id}/photo");
    let stored = uploads::store(&state, &scope, file, IMAGE_MIME_TYPES).await?;

    let mut conn = state.db()?;
    let previous: Option<String> = workers::table
        .find(worker_id)
        .select(workers::profile_photo_key)
        .first(&mut conn)?;

    let worker: Worker = diesel::update(workers::table.find(worker_id))
        .set((
            workers::profile_photo_key.eq(Some(stored.key.clone())),
            workers::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;

    if let Err(err) = enqueue_purge(&mut conn, previous.into_iter().collect(), "photo replaced") {
        warn!(%worker_id, error = %err, "failed to queue purge of replaced photo");
    }

    audit::record(
        &mut conn,
        AuditEvent::new(audit::WORKER_PHOTO_UPLOADED, RESOURCE, worker.id)
            .by(&principal, &client)
            .details(json!({ "key": stored.key, "size_bytes": stored.size_bytes })),
    );

    Ok(Json(worker.into()))
}
