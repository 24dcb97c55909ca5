//! Append-only audit trail. Nothing in the service reads it back.

use diesel::{prelude::*, PgConnection};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::auth::{ClientContext, Principal};
use crate::models::NewAuditLog;
use crate::schema::audit_logs;

pub const COMPANY_CREATED: &str = "company.created";
pub const COMPANY_UPDATED: &str = "company.updated";
pub const COMPANY_DEACTIVATED: &str = "company.deactivated";
pub const WORKER_CREATED: &str = "worker.created";
pub const WORKER_UPDATED: &str = "worker.updated";
pub const WORKER_DELETED: &str = "worker.deleted";
pub const WORKER_PHOTO_UPLOADED: &str = "worker.photo_uploaded";
pub const DOCUMENT_SUBMITTED: &str = "document.submitted";
pub const DOCUMENT_UPDATED: &str = "document.updated";
pub const DOCUMENT_REVIEWED: &str = "document.reviewed";
pub const DOCUMENT_DELETED: &str = "document.deleted";
pub const JOB_CREATED: &str = "job.created";
pub const JOB_REVIEW_STARTED: &str = "job.review_started";
pub const QUOTE_SUBMITTED: &str = "quote.submitted";
pub const QUOTE_ACCEPTED: &str = "quote.accepted";
pub const JOB_FINISHED: &str = "job.finished";
pub const FILE_UPLOADED: &str = "file.uploaded";

#[derive(Debug, Clone)]
pub struct AuditEvent {
    actor_id: Option<Uuid>,
    action: &'static str,
    resource_type: &'static str,
    resource_id: Option<Uuid>,
    details: Value,
    ip: Option<String>,
    user_agent: Option<String>,
}

impl AuditEvent {
    pub fn new(action: &'static str, resource_type: &'static str, resource_id: Uuid) -> Self {
        Self {
            actor_id: None,
            action,
            resource_type,
            resource_id: Some(resource_id),
            details: json!({}),
            ip: None,
            user_agent: None,
        }
    }

    pub fn by(mut self, principal: &Principal, client: &ClientContext) -> Self {
        self.actor_id = Some(principal.user_id);
        self.ip = client.ip.clone();
        self.user_agent = client.user_agent.clone();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    fn into_row(self) -> NewAuditLog {
        NewAuditLog {
            id: Uuid::new_v4(),
            actor_id: self.actor_id,
            action: self.action.to_string(),
            resource_type: self.resource_type.to_string(),
            resource_id: self.resource_id,
            details: self.details,
            ip: self.ip,
            user_agent: self.user_agent,
        }
    }
}

/// Writes the entry in its own savepoint so a failure never aborts the
/// caller's transaction; failures are only logged.
pub fn record(conn: &mut PgConnection, event: AuditEvent) {
    let action = event.action;
    let resource_id = event.resource_id;
    let row = event.into_row();

    let result = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(audit_logs::table)
            .values(&row)
            .execute(conn)
    });

    if let Err(err) = result {
        warn!(
            action,
            resource_id = ?resource_id,
            error = %err,
            "failed to write audit log entry"
        );
    }
}
