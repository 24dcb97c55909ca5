//! Postgres-backed queue for background work that must not run inside a
//! request, such as reclaiming storage objects orphaned by deletes.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewTask, Task};
use crate::schema::{files, tasks, worker_documents, workers};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const TASK_PURGE_OBJECTS: &str = "purge-storage-objects";

const FILE_STATUS_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type TaskQueueResult<T> = Result<T, TaskQueueError>;

/// Storage keys left behind by a relational delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeObjectsPayload {
    pub keys: Vec<String>,
    pub reason: String,
}

pub fn enqueue_task(
    conn: &mut PgConnection,
    task_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> TaskQueueResult<Task> {
    let new_task = NewTask {
        id: Uuid::new_v4(),
        task_type: task_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };

    let task = diesel::insert_into(tasks::table)
        .values(&new_task)
        .get_result(conn)?;
    Ok(task)
}

/// Keys among `keys` that back a worker document, front or back.
pub fn document_keys(conn: &mut PgConnection, keys: &[String]) -> QueryResult<HashSet<String>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let fronts: Vec<String> = worker_documents::table
        .filter(worker_documents::front_file_key.eq_any(keys))
        .select(worker_documents::front_file_key)
        .load(conn)?;
    let backs: Vec<Option<String>> = worker_documents::table
        .filter(worker_documents::back_file_key.eq_any(keys))
        .select(worker_documents::back_file_key)
        .load(conn)?;
    Ok(fronts.into_iter().chain(backs.into_iter().flatten()).collect())
}

/// Keys among `keys` that a live row still points at: a worker document,
/// a worker photo or an active file.
pub fn referenced_keys(
    conn: &mut PgConnection,
    keys: &[String],
) -> QueryResult<HashSet<String>> {
    let mut referenced = HashSet::new();
    if keys.is_empty() {
        return Ok(referenced);
    }

    referenced.extend(document_keys(conn, keys)?);
    let photos: Vec<Option<String>> = workers::table
        .filter(workers::profile_photo_key.eq_any(keys))
        .select(workers::profile_photo_key)
        .load(conn)?;
    let stored: Vec<String> = files::table
        .filter(files::storage_key.eq_any(keys))
        .filter(files::status.eq(FILE_STATUS_ACTIVE))
        .select(files::storage_key)
        .load(conn)?;

    referenced.extend(photos.into_iter().flatten());
    referenced.extend(stored);
    Ok(referenced)
}

/// Drops the keys some other row still needs.
pub fn orphaned_keys(conn: &mut PgConnection, keys: Vec<String>) -> QueryResult<Vec<String>> {
    let referenced = referenced_keys(conn, &keys)?;
    let mut seen = HashSet::new();
    Ok(keys
        .into_iter()
        .filter(|key| !referenced.contains(key) && seen.insert(key.clone()))
        .collect())
}

/// Queues a purge of the keys no live row references, unless none are left.
/// Call it after the owning rows are gone, in the same transaction.
pub fn enqueue_purge(
    conn: &mut PgConnection,
    keys: Vec<String>,
    reason: &str,
) -> TaskQueueResult<Option<Task>> {
    let keys = orphaned_keys(conn, keys)?;
    if keys.is_empty() {
        return Ok(None);
    }
    let payload = serde_json::to_value(PurgeObjectsPayload {
        keys,
        reason: reason.to_string(),
    })?;
    enqueue_task(conn, TASK_PURGE_OBJECTS, payload, None).map(Some)
}

pub fn reserve_task(conn: &mut PgConnection, task_types: &[&str]) -> TaskQueueResult<Option<Task>> {
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let task = tasks::table
            .filter(tasks::status.eq(STATUS_QUEUED))
            .filter(tasks::run_after.le(now))
            .filter(tasks::task_type.eq_any(task_types))
            .order(tasks::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Task>(conn)
            .optional()?;

        match task {
            Some(task) => {
                let reserved = diesel::update(tasks::table.find(task.id))
                    .set((
                        tasks::status.eq(STATUS_PROCESSING),
                        tasks::attempts.eq(task.attempts + 1),
                        tasks::updated_at.eq(now),
                    ))
                    .get_result::<Task>(conn)?;
                Ok::<_, diesel::result::Error>(Some(reserved))
            }
            None => Ok(None),
        }
    })
    .map_err(TaskQueueError::from)
}

pub fn mark_task_succeeded(conn: &mut PgConnection, task_id: Uuid) -> TaskQueueResult<()> {
    diesel::update(tasks::table.find(task_id))
        .set((
            tasks::status.eq(STATUS_SUCCEEDED),
            tasks::last_error.eq::<Option<String>>(None),
            tasks::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_task_after(
    conn: &mut PgConnection,
    task_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> TaskQueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

    diesel::update(tasks::table.find(task_id))
        .set((
            tasks::status.eq(STATUS_QUEUED),
            tasks::run_after.eq(next_run.naive_utc()),
            tasks::last_error.eq(Some(error_message.to_string())),
            tasks::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_task_failed(
    conn: &mut PgConnection,
    task_id: Uuid,
    error_message: &str,
) -> TaskQueueResult<()> {
    diesel::update(tasks::table.find(task_id))
        .set((
            tasks::status.eq(STATUS_FAILED),
            tasks::last_error.eq(Some(error_message.to_string())),
            tasks::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}
