use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = companies)]
#[diesel(belongs_to(User, foreign_key = owner_id))]
pub struct Company {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub rut: String,
    pub city: String,
    pub region: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub contact_name: Option<String>,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = companies)]
pub struct NewCompany {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub rut: String,
    pub city: String,
    pub region: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub contact_name: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = workers)]
#[diesel(belongs_to(Company))]
pub struct Worker {
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
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workers)]
pub struct NewWorker {
    pub id: Uuid,
    pub company_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub rut: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub position: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = worker_document_types)]
pub struct WorkerDocumentType {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub requires_front_back: bool,
    pub requires_expiry_date: bool,
    pub order_index: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = worker_documents)]
#[diesel(belongs_to(Worker))]
#[diesel(belongs_to(WorkerDocumentType, foreign_key = document_type_id))]
pub struct WorkerDocument {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub document_type_id: Uuid,
    pub status: String,
    pub emission_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub front_file_key: String,
    pub back_file_key: Option<String>,
    pub uploaded_by: Uuid,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub admin_comments: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = worker_documents)]
pub struct NewWorkerDocument {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub document_type_id: Uuid,
    pub status: String,
    pub emission_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub front_file_key: String,
    pub back_file_key: Option<String>,
    pub uploaded_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub professional_id: Option<Uuid>,
    pub quote_amount: Option<i64>,
    pub quote_currency: String,
    pub accepted_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub quote_currency: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = quotes)]
#[diesel(belongs_to(Job))]
pub struct Quote {
    pub id: Uuid,
    pub job_id: Uuid,
    pub professional_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub message: Option<String>,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = quotes)]
pub struct NewQuote {
    pub id: Uuid,
    pub job_id: Uuid,
    pub professional_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub message: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = files)]
pub struct StoredFile {
    pub id: Uuid,
    pub uploaded_by: Uuid,
    pub job_id: Option<Uuid>,
    pub filename: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub version: i32,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = files)]
pub struct NewStoredFile {
    pub id: Uuid,
    pub uploaded_by: Uuid,
    pub job_id: Option<Uuid>,
    pub filename: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub status: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = tasks)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}
