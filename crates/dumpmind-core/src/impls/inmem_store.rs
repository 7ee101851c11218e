//! InMemoryTaskStore - 開発・テスト用の TaskStore
//!
//! # 実装詳細
//! - `tokio::sync::Mutex` over a single state struct
//! - every transition happens inside one lock scope, which makes `claim` an
//!   atomic check-and-set

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{Completion, Task, TaskId, TaskStatus, WorkerId};
use crate::observability::TaskCounts;
use crate::ports::{Claim, StoreError, TaskStore};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order, for `list` and `claim_next`.
    order: Vec<TaskId>,
}

impl StoreState {
    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn claim(
        &mut self,
        id: &TaskId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let task = self.get_mut(id)?;
        if !task.status().is_claimable() {
            return Ok(Claim::Conflict {
                status: task.status(),
                worker_id: task.worker_id().cloned(),
            });
        }
        task.start(worker.clone(), now)?;
        Ok(Claim::Claimed(task.clone()))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(task.id()) {
            return Err(StoreError::AlreadyExists(task.id().clone()));
        }
        debug!(task_id = %task.id(), task_type = %task.task_type(), "task created");
        state.order.push(task.id().clone());
        state.tasks.insert(task.id().clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| status.is_none_or(|s| t.status() == s))
            .cloned()
            .collect())
    }

    async fn claim(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let mut state = self.state.lock().await;
        state.claim(id, worker, now)
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let next = state
            .order
            .iter()
            .find(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.status().is_claimable())
            })
            .cloned();

        match next {
            Some(id) => match state.claim(&id, worker, now)? {
                Claim::Claimed(task) => Ok(Some(task)),
                Claim::Conflict { .. } => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn succeed(
        &self,
        id: &TaskId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        task.succeed(completion, now)?;
        Ok(task.clone())
    }

    async fn fail(
        &self,
        id: &TaskId,
        cause: String,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        task.fail(cause, now)?;
        Ok(task.clone())
    }

    async fn counts_by_status(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.values().map(Task::status).collect())
    }
}
