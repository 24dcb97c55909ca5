use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    models::Task,
    state::AppState,
    tasks::{mark_task_failed, mark_task_succeeded, reserve_task, retry_task_after, TaskQueueError},
};

pub mod purge;

#[derive(Debug, PartialEq, Eq)]
pub enum TaskExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, task: Task) -> TaskExecution;
}

pub struct TaskRunner {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn TaskHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.task_type(), handler))
            .collect();
        Self {
            state,
            handlers,
            poll_interval,
        }
    }

    pub async fn run(&self) {
        info!(task_types = ?self.handlers.keys().collect::<Vec<_>>(), "task runner started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "task runner tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Runs at most one task. Returns whether a task was found.
    pub async fn tick(&self) -> Result<bool, TaskQueueError> {
        let task_types: Vec<&str> = self.handlers.keys().copied().collect();
        if task_types.is_empty() {
            return Ok(false);
        }

        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                error!(%err, "failed to obtain database connection in task runner");
                return Ok(false);
            }
        };

        let Some(task) = reserve_task(&mut conn, &task_types)? else {
            return Ok(false);
        };
        drop(conn);

        let Some(handler) = self.handlers.get(task.task_type.as_str()) else {
            error!(task_type = %task.task_type, "no handler registered for task type");
            if let Ok(mut conn) = self.state.db() {
                mark_task_failed(&mut conn, task.id, "no handler registered")?;
            }
            return Ok(true);
        };

        let task_id = task.id;
        let task_type = task.task_type.clone();
        let outcome = handler.handle(self.state.clone(), task).await;

        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                error!(%task_id, %err, "failed to record task outcome due to pool error");
                return Ok(true);
            }
        };

        match outcome {
            TaskExecution::Success => {
                mark_task_succeeded(&mut conn, task_id)?;
                info!(%task_id, %task_type, "task completed");
            }
            TaskExecution::Retry { delay, error } => {
                warn!(%task_id, %task_type, %error, "task will retry");
                retry_task_after(&mut conn, task_id, delay, &error)?;
            }
            TaskExecution::Failed { error } => {
                error!(%task_id, %task_type, %error, "task failed");
                mark_task_failed(&mut conn, task_id, &error)?;
            }
        }

        Ok(true)
    }
}

pub fn default_handlers() -> Vec<Arc<dyn TaskHandler>> {
    vec![Arc::new(purge::PurgeObjectsTask::new())]
}
