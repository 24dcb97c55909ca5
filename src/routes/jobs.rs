use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::files::{FileResponse, STATUS_ACTIVE as FILE_STATUS_ACTIVE};
use super::to_iso;
use crate::audit::{self, AuditEvent};
use crate::auth::{authorize, ClientContext, Principal, Role};
use crate::error::{AppError, AppResult};
use crate::models::{Job, NewJob, NewQuote, Quote, StoredFile};
use crate::negotiation::{self, JobStatus, QuoteStatus, Transition, DEFAULT_CURRENCY};
use crate::schema::{files, jobs, quotes};
use crate::state::AppState;
use crate::tasks::document_keys;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;
const RESOURCE_JOB: &str = "job";
const RESOURCE_QUOTE: &str = "quote";

#[derive(Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateQuoteRequest {
    pub amount: i64,
    pub currency: Option<String>,
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub professional_id: Option<Uuid>,
    pub quote_amount: Option<i64>,
    pub quote_currency: String,
    pub accepted_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            requester_id: job.requester_id,
            title: job.title,
            description: job.description,
            status: job.status,
            professional_id: job.professional_id,
            quote_amount: job.quote_amount,
            quote_currency: job.quote_currency,
            accepted_at: job.accepted_at.map(to_iso),
            finished_at: job.finished_at.map(to_iso),
            created_at: to_iso(job.created_at),
            updated_at: to_iso(job.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct QuoteResponse {
    pub id: Uuid,
    pub job_id: Uuid,
    pub professional_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub message: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Quote> for QuoteResponse {
    fn from(quote: Quote) -> Self {
        Self {
            id: quote.id,
            job_id: quote.job_id,
            professional_id: quote.professional_id,
            amount: quote.amount,
            currency: quote.currency,
            message: quote.message,
            status: quote.status,
            created_at: to_iso(quote.created_at),
            updated_at: to_iso(quote.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct JobDetailResponse {
    pub job: JobResponse,
    pub files: Vec<FileResponse>,
    pub quotes: Vec<QuoteResponse>,
}

#[derive(AsChangeset)]
#[diesel(table_name = jobs)]
struct JobChangeset {
    status: String,
    professional_id: Option<Option<Uuid>>,
    quote_amount: Option<Option<i64>>,
    quote_currency: Option<String>,
    accepted_at: Option<Option<NaiveDateTime>>,
    finished_at: Option<Option<NaiveDateTime>>,
    updated_at: NaiveDateTime,
}

impl JobChangeset {
    fn to(next: JobStatus) -> Self {
        Self {
            status: next.as_str().to_string(),
            professional_id: None,
            quote_amount: None,
            quote_currency: None,
            accepted_at: None,
            finished_at: None,
            updated_at: Utc::now().naive_utc(),
        }
    }
}

fn stored_status(job: &Job) -> AppResult<JobStatus> {
    job.status
        .parse()
        .map_err(|err| AppError::internal(format!("stored job status invalid: {err}")))
}

/// Applies `changes` only if the job is still in `expected`.
fn guarded_update(
    conn: &mut PgConnection,
    job_id: Uuid,
    expected: JobStatus,
    changes: &JobChangeset,
) -> AppResult<Job> {
    diesel::update(
        jobs::table
            .filter(jobs::id.eq(job_id))
            .filter(jobs::status.eq(expected.as_str())),
    )
    .set(changes)
    .get_result(conn)
    .optional()?
    .ok_or_else(|| AppError::conflicting_transition("job was modified by another request"))
}

/// Requesters only see their own jobs; professionals and admins see all.
pub(crate) fn visible_job(
    conn: &mut PgConnection,
    principal: &Principal,
    job_id: Uuid,
) -> AppResult<Job> {
    let job: Job = jobs::table
        .find(job_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    match principal.role {
        Role::User if job.requester_id != principal.user_id => Err(AppError::not_found()),
        _ => Ok(job),
    }
}

fn load_detail(
    conn: &mut PgConnection,
    principal: &Principal,
    job: Job,
) -> AppResult<JobDetailResponse> {
    let attached: Vec<StoredFile> = files::table
        .filter(files::job_id.eq(job.id))
        .order(files::created_at.asc())
        .load(conn)?;

    let mut quote_query = quotes::table
        .filter(quotes::job_id.eq(job.id))
        .order(quotes::created_at.asc())
        .into_boxed();
    if principal.role == Role::Professional {
        quote_query = quote_query.filter(quotes::professional_id.eq(principal.user_id));
    }
    let job_quotes: Vec<Quote> = quote_query.load(conn)?;

    Ok(JobDetailResponse {
        job: job.into(),
        files: attached.into_iter().map(FileResponse::from).collect(),
        quotes: job_quotes.into_iter().map(QuoteResponse::from).collect(),
    })
}

pub async fn list_jobs(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<JobListQuery>,
) -> AppResult<Json<Vec<JobResponse>>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let mut query = jobs::table
        .order((jobs::created_at.desc(), jobs::id.desc()))
        .limit(limit)
        .into_boxed();
    if principal.role == Role::User {
        query = query.filter(jobs::requester_id.eq(principal.user_id));
    }
    if let Some(status) = status {
        query = query.filter(jobs::status.eq(status.as_str()));
    }

    let mut conn = state.db()?;
    let rows: Vec<Job> = query.load(&mut conn)?;
    Ok(Json(rows.into_iter().map(JobResponse::from).collect()))
}

/// Files named in `file_ids` are attached only when the caller uploaded
/// them; the rest are skipped.
pub async fn create_job(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    Json(payload): Json<CreateJobRequest>,
) -> AppResult<(StatusCode, Json<JobDetailResponse>)> {
    authorize(&principal, &[Role::User])?;

    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::invalid_field("title", "is required"));
    }
    let description = payload
        .description
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let new_job = NewJob {
        id: Uuid::new_v4(),
        requester_id: principal.user_id,
        title,
        description,
        status: JobStatus::PorRevisar.as_str().to_string(),
        quote_currency: DEFAULT_CURRENCY.to_string(),
    };

    let mut conn = state.db()?;
    let (job, adopted) = conn.transaction::<_, AppError, _>(|conn| {
        let job: Job = diesel::insert_into(jobs::table)
            .values(&new_job)
            .get_result(conn)?;

        let adopted = if payload.file_ids.is_empty() {
            0
        } else {
            // Only loose files: not on another job and not backing a document.
            let candidates: Vec<(Uuid, String)> = files::table
                .filter(files::id.eq_any(&payload.file_ids))
                .filter(files::uploaded_by.eq(principal.user_id))
                .filter(files::job_id.is_null())
                .filter(files::status.eq(FILE_STATUS_ACTIVE))
                .select((files::id, files::storage_key))
                .for_update()
                .load(conn)?;
            let keys: Vec<String> = candidates.iter().map(|(_, key)| key.clone()).collect();
            let in_documents = document_keys(conn, &keys)?;
            let loose: Vec<Uuid> = candidates
                .into_iter()
                .filter(|(_, key)| !in_documents.contains(key))
                .map(|(id, _)| id)
                .collect();

            diesel::update(files::table.filter(files::id.eq_any(&loose)))
                .set((
                    files::job_id.eq(job.id),
                    files::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?
        };
        Ok((job, adopted))
    })?;

    let skipped = payload.file_ids.len().saturating_sub(adopted);
    if skipped > 0 {
        debug!(job_id = %job.id, skipped, "skipped files the requester cannot attach");
    }

    audit::record(
        &mut conn,
        AuditEvent::new(audit::JOB_CREATED, RESOURCE_JOB, job.id)
            .by(&principal, &client)
            .details(json!({ "files_attached": adopted, "files_skipped": skipped })),
    );
    info!(job_id = %job.id, requester_id = %principal.user_id, "job created");

    let detail = load_detail(&mut conn, &principal, job)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<JobDetailResponse>> {
    let mut conn = state.db()?;
    let job = visible_job(&mut conn, &principal, job_id)?;
    Ok(Json(load_detail(&mut conn, &principal, job)?))
}

pub async fn start_review(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<Json<JobResponse>> {
    authorize(&principal, &[Role::Professional, Role::Admin])?;
    let mut conn = state.db()?;
    let job = visible_job(&mut conn, &principal, job_id)?;
    let current = stored_status(&job)?;

    let job = match negotiation::start_review(current)? {
        Transition::Unchanged => job,
        Transition::Advance(next) => {
            let job = guarded_update(&mut conn, job.id, current, &JobChangeset::to(next))?;
            audit::record(
                &mut conn,
                AuditEvent::new(audit::JOB_REVIEW_STARTED, RESOURCE_JOB, job.id)
                    .by(&principal, &client)
                    .details(json!({ "from": current.as_str(), "to": next.as_str() })),
            );
            job
        }
    };

    Ok(Json(job.into()))
}

pub async fn create_quote(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
    Json(payload): Json<CreateQuoteRequest>,
) -> AppResult<(StatusCode, Json<QuoteResponse>)> {
    authorize(&principal, &[Role::Professional])?;
    let amount = negotiation::validate_amount(payload.amount)?;
    let currency = negotiation::normalize_currency(payload.currency.as_deref())?;
    let message = payload
        .message
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let mut conn = state.db()?;
    let job = visible_job(&mut conn, &principal, job_id)?;
    let current = stored_status(&job)?;
    let transition = negotiation::on_quote_submitted(current)?;

    let new_quote = NewQuote {
        id: Uuid::new_v4(),
        job_id: job.id,
        professional_id: principal.user_id,
        amount,
        currency,
        message,
        status: QuoteStatus::Pending.as_str().to_string(),
    };

    let quote = conn.transaction::<_, AppError, _>(|conn| {
        if let Transition::Advance(next) = transition {
            guarded_update(conn, job.id, current, &JobChangeset::to(next))?;
        }
        let quote: Quote = diesel::insert_into(quotes::table)
            .values(&new_quote)
            .get_result(conn)?;
        Ok(quote)
    })?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::QUOTE_SUBMITTED, RESOURCE_QUOTE, quote.id)
            .by(&principal, &client)
            .details(json!({
                "job_id": job.id,
                "amount": quote.amount,
                "currency": quote.currency,
                "job_status": transition.resulting(current).as_str(),
            })),
    );
    info!(job_id = %job.id, quote_id = %quote.id, "quote submitted");

    Ok((StatusCode::CREATED, Json(quote.into())))
}

/// Accepts one quote, assigns its professional and rejects the remaining
/// pending quotes in the same transaction.
pub async fn accept_quote(
    State(state): State<AppState>,
    Path((job_id, quote_id)): Path<(Uuid, Uuid)>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<Json<JobDetailResponse>> {
    authorize(&principal, &[Role::User])?;
    let mut conn = state.db()?;
    let job = visible_job(&mut conn, &principal, job_id)?;
    if job.requester_id != principal.user_id {
        return Err(AppError::not_found());
    }

    let quote: Quote = quotes::table
        .find(quote_id)
        .filter(quotes::job_id.eq(job.id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    let quote_status: QuoteStatus = quote
        .status
        .parse()
        .map_err(|err| AppError::internal(format!("stored quote status invalid: {err}")))?;

    let current = stored_status(&job)?;
    let next = negotiation::accept_quote(current, quote_status)?;

    let now = Utc::now().naive_utc();
    let changes = JobChangeset {
        professional_id: Some(Some(quote.professional_id)),
        quote_amount: Some(Some(quote.amount)),
        quote_currency: Some(quote.currency.clone()),
        accepted_at: Some(Some(now)),
        ..JobChangeset::to(next)
    };

    let (job, rejected) = conn.transaction::<_, AppError, _>(|conn| {
        let job = guarded_update(conn, job.id, current, &changes)?;

        let accepted = diesel::update(
            quotes::table
                .filter(quotes::id.eq(quote.id))
                .filter(quotes::status.eq(QuoteStatus::Pending.as_str())),
        )
        .set((
            quotes::status.eq(QuoteStatus::Accepted.as_str()),
            quotes::updated_at.eq(now),
        ))
        .execute(conn)?;
        if accepted == 0 {
            return Err(AppError::conflicting_transition(
                "quote was modified by another request",
            ));
        }

        let rejected = diesel::update(
            quotes::table
                .filter(quotes::job_id.eq(job.id))
                .filter(quotes::id.ne(quote.id))
                .filter(quotes::status.eq(QuoteStatus::Pending.as_str())),
        )
        .set((
            quotes::status.eq(QuoteStatus::Rejected.as_str()),
            quotes::updated_at.eq(now),
        ))
        .execute(conn)?;

        Ok((job, rejected))
    })?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::QUOTE_ACCEPTED, RESOURCE_JOB, job.id)
            .by(&principal, &client)
            .details(json!({
                "quote_id": quote.id,
                "professional_id": quote.professional_id,
                "amount": quote.amount,
                "currency": quote.currency,
                "rejected_quotes": rejected,
            })),
    );
    info!(job_id = %job.id, quote_id = %quote.id, rejected, "quote accepted");

    Ok(Json(load_detail(&mut conn, &principal, job)?))
}

pub async fn finish_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<Json<JobResponse>> {
    authorize(&principal, &[Role::Professional, Role::Admin])?;
    let mut conn = state.db()?;
    let job = visible_job(&mut conn, &principal, job_id)?;
    if !principal.is_admin() && job.professional_id != Some(principal.user_id) {
        return Err(AppError::forbidden());
    }

    let current = stored_status(&job)?;
    let job = match negotiation::finish(current)? {
        Transition::Unchanged => job,
        Transition::Advance(next) => {
            let changes = JobChangeset {
                finished_at: Some(Some(Utc::now().naive_utc())),
                ..JobChangeset::to(next)
            };
            let job = guarded_update(&mut conn, job.id, current, &changes)?;
            audit::record(
                &mut conn,
                AuditEvent::new(audit::JOB_FINISHED, RESOURCE_JOB, job.id)
                    .by(&principal, &client)
                    .details(json!({ "professional_id": job.professional_id })),
            );
            info!(job_id = %job.id, "job finished");
            job
        }
    };

    Ok(Json(job.into()))
}
