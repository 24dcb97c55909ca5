//! Ownership checks for the registry. Everything under a company is visible
//! to its owner and to admins; anyone else gets `NotFound`, whether or not
//! the row exists.

use diesel::{prelude::*, PgConnection};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{Company, Worker, WorkerDocument};
use crate::schema::{companies, worker_documents, workers};

pub fn can_access(principal: &Principal, owner_id: Uuid) -> bool {
    principal.is_admin() || principal.user_id == owner_id
}

pub fn company_in_scope(
    conn: &mut PgConnection,
    principal: &Principal,
    company_id: Uuid,
) -> AppResult<Company> {
    let company: Company = companies::table
        .find(company_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if can_access(principal, company.owner_id) {
        Ok(company)
    } else {
        Err(AppError::not_found())
    }
}

pub fn worker_in_scope(
    conn: &mut PgConnection,
    principal: &Principal,
    worker_id: Uuid,
) -> AppResult<(Worker, Company)> {
    let (worker, company): (Worker, Company) = workers::table
        .inner_join(companies::table)
        .filter(workers::id.eq(worker_id))
        .select((workers::all_columns, companies::all_columns))
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if can_access(principal, company.owner_id) {
        Ok((worker, company))
    } else {
        Err(AppError::not_found())
    }
}

pub fn document_in_scope(
    conn: &mut PgConnection,
    principal: &Principal,
    document_id: Uuid,
) -> AppResult<(WorkerDocument, Worker, Company)> {
    let (document, worker, company): (WorkerDocument, Worker, Company) = worker_documents::table
        .inner_join(workers::table.inner_join(companies::table))
        .filter(worker_documents::id.eq(document_id))
        .select((
            worker_documents::all_columns,
            workers::all_columns,
            companies::all_columns,
        ))
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if can_access(principal, company.owner_id) {
        Ok((document, worker, company))
    } else {
        Err(AppError::not_found())
    }
}
