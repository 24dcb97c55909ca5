use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::to_iso;
use crate::{
    audit::{self, AuditEvent},
    auth::{authorize, ClientContext, Principal, Role},
    error::{AppError, AppResult},
    models::{Company, NewCompany},
    rut::Rut,
    schema::companies,
    state::AppState,
    tenancy::company_in_scope,
    utils::json::{optional_text, required_text},
};

const REGISTRY_ROLES: &[Role] = &[Role::User, Role::Admin];
pub const COMPANY_STATUSES: &[&str] = &["ACTIVE", "INACTIVE", "SUSPENDED"];
const STATUS_INACTIVE: &str = "INACTIVE";
const RESOURCE: &str = "company";

#[derive(Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
    pub rut: String,
    pub city: String,
    pub region: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub contact_name: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = companies)]
struct CompanyChangeset {
    name: Option<String>,
    rut: Option<String>,
    city: Option<String>,
    region: Option<String>,
    address: Option<Option<String>>,
    phone: Option<Option<String>>,
    email: Option<Option<String>>,
    contact_name: Option<Option<String>>,
    status: Option<String>,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct CompanyResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub rut: String,
    pub rut_formatted: String,
    pub city: String,
    pub region: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub contact_name: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Company> for CompanyResponse {
    fn from(company: Company) -> Self {
        let rut_formatted = Rut::parse(&company.rut)
            .map(|rut| rut.formatted())
            .unwrap_or_else(|_| company.rut.clone());
        Self {
            id: company.id,
            owner_id: company.owner_id,
            name: company.name,
            rut: company.rut,
            rut_formatted,
            city: company.city,
            region: company.region,
            address: company.address,
            phone: company.phone,
            email: company.email,
            contact_name: company.contact_name,
            status: company.status,
            created_at: to_iso(company.created_at),
            updated_at: to_iso(company.updated_at),
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
    AppError::conflict("DuplicateTaxId", "a company with this RUT is already registered")
}

pub async fn list_companies(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<Vec<CompanyResponse>>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;

    let rows: Vec<Company> = companies::table
        .filter(companies::owner_id.eq(principal.user_id))
        .order(companies::created_at.asc())
        .load(&mut conn)?;

    Ok(Json(rows.into_iter().map(CompanyResponse::from).collect()))
}

pub async fn create_company(
    State(state): State<AppState>,
    principal: Principal,
    client: ClientContext,
    Json(payload): Json<CreateCompanyRequest>,
) -> AppResult<(StatusCode, Json<CompanyResponse>)> {
    authorize(&principal, REGISTRY_ROLES)?;

    let name = required("name", &payload.name)?;
    let rut = Rut::parse_with(&required("rut", &payload.rut)?, state.config.strict_rut_validation)?;
    let city = required("city", &payload.city)?;
    let region = required("region", &payload.region)?;

    let new_company = NewCompany {
        id: Uuid::new_v4(),
        owner_id: principal.user_id,
        name,
        rut: rut.normalized(),
        city,
        region,
        address: optional(payload.address),
        phone: optional(payload.phone),
        email: optional(payload.email),
        contact_name: optional(payload.contact_name),
        status: "ACTIVE".to_string(),
    };

    let mut conn = state.db()?;
    let company: Company = match diesel::insert_into(companies::table)
        .values(&new_company)
        .get_result(&mut conn)
    {
        Ok(company) => company,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            debug!(owner_id = %principal.user_id, rut = %new_company.rut, "duplicate company rut");
            return Err(duplicate_rut());
        }
        Err(err) => return Err(err.into()),
    };

    audit::record(
        &mut conn,
        AuditEvent::new(audit::COMPANY_CREATED, RESOURCE, company.id)
            .by(&principal, &client)
            .details(json!({ "rut": company.rut, "name": company.name })),
    );
    info!(company_id = %company.id, owner_id = %company.owner_id, "company created");

    Ok((StatusCode::CREATED, Json(company.into())))
}

pub async fn get_company(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    principal: Principal,
) -> AppResult<Json<CompanyResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    let company = company_in_scope(&mut conn, &principal, company_id)?;
    Ok(Json(company.into()))
}

pub async fn update_company(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
    Json(body): Json<Map<String, Value>>,
) -> AppResult<Json<CompanyResponse>> {
    authorize(&principal, REGISTRY_ROLES)?;

    let rut = required_text(&body, "rut")?
        .map(|raw| Rut::parse_with(&raw, state.config.strict_rut_validation))
        .transpose()?
        .map(|rut| rut.normalized());

    let status = match required_text(&body, "status")? {
        Some(_) if !principal.is_admin() => {
            debug!(user_id = %principal.user_id, "ignoring company status change from non-admin");
            None
        }
        Some(status) => {
            let status = status.to_ascii_uppercase();
            if !COMPANY_STATUSES.contains(&status.as_str()) {
                return Err(AppError::invalid_field(
                    "status",
                    format!("must be one of {}", COMPANY_STATUSES.join(", ")),
                ));
            }
            Some(status)
        }
        None => None,
    };

    let changes = CompanyChangeset {
        name: required_text(&body, "name")?,
        rut,
        city: required_text(&body, "city")?,
        region: required_text(&body, "region")?,
        address: optional_text(&body, "address")?,
        phone: optional_text(&body, "phone")?,
        email: optional_text(&body, "email")?,
        contact_name: optional_text(&body, "contact_name")?,
        status,
        updated_at: Utc::now().naive_utc(),
    };

    let mut conn = state.db()?;
    company_in_scope(&mut conn, &principal, company_id)?;

    let company: Company = match diesel::update(companies::table.find(company_id))
        .set(&changes)
        .get_result(&mut conn)
    {
        Ok(company) => company,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(duplicate_rut());
        }
        Err(err) => return Err(err.into()),
    };

    let fields: Vec<&String> = body.keys().collect();
    audit::record(
        &mut conn,
        AuditEvent::new(audit::COMPANY_UPDATED, RESOURCE, company.id)
            .by(&principal, &client)
            .details(json!({ "fields": fields })),
    );

    Ok(Json(company.into()))
}

/// Soft delete: the company and its workers stay queryable.
pub async fn delete_company(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    principal: Principal,
    client: ClientContext,
) -> AppResult<StatusCode> {
    authorize(&principal, REGISTRY_ROLES)?;
    let mut conn = state.db()?;
    company_in_scope(&mut conn, &principal, company_id)?;

    diesel::update(companies::table.find(company_id))
        .set((
            companies::status.eq(STATUS_INACTIVE),
            companies::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    audit::record(
        &mut conn,
        AuditEvent::new(audit::COMPANY_DEACTIVATED, RESOURCE, company_id).by(&principal, &client),
    );
    info!(%company_id, "company deactivated");

    Ok(StatusCode::NO_CONTENT)
}
