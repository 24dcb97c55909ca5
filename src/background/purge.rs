use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    models::Task,
    state::AppState,
    tasks::{PurgeObjectsPayload, TASK_PURGE_OBJECTS},
};

use super::{TaskExecution, TaskHandler};

const MAX_ATTEMPTS: i32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Deletes storage objects whose owning rows are already gone.
pub struct PurgeObjectsTask;

impl PurgeObjectsTask {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PurgeObjectsTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for PurgeObjectsTask {
    fn task_type(&self) -> &'static str {
        TASK_PURGE_OBJECTS
    }

    async fn handle(&self, state: Arc<AppState>, task: Task) -> TaskExecution {
        let payload: PurgeObjectsPayload = match serde_json::from_value(task.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return TaskExecution::Failed {
                    error: format!("invalid purge payload: {err}"),
                }
            }
        };

        let mut failures = Vec::new();
        for key in &payload.keys {
            if let Err(err) = state.storage.delete_object(key).await {
                warn!(task_id = %task.id, key = %key, error = %err, "failed to delete object");
                failures.push(key.clone());
            }
        }

        info!(
            task_id = %task.id,
            reason = %payload.reason,
            requested = payload.keys.len(),
            failed = failures.len(),
            "purge pass finished"
        );

        outcome(task.attempts, &failures)
    }
}

fn outcome(attempts: i32, failures: &[String]) -> TaskExecution {
    if failures.is_empty() {
        return TaskExecution::Success;
    }
    let error = format!("could not delete {} object(s): {}", failures.len(), failures.join(", "));
    if attempts >= MAX_ATTEMPTS {
        TaskExecution::Failed { error }
    } else {
        TaskExecution::Retry {
            delay: RETRY_DELAY,
            error,
        }
    }
}
