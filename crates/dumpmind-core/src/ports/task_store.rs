//! TaskStore port - Task の正本（source of truth）
//!
//! The store owns every state transition. `claim` is the only point where
//! workers synchronise with each other: it must be an atomic
//! compare-and-set on `(id, status = pending)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    Completion, ReproError, Task, TaskId, TaskStatus, TransitionError, WorkerId,
};
use crate::observability::TaskCounts;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("store backend: {0}")]
    Backend(String),
}

impl From<StoreError> for ReproError {
    fn from(e: StoreError) -> Self {
        ReproError::Store(e.to_string())
    }
}

/// Outcome of a claim attempt.
///
/// Losing a race is a normal signal, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This worker now owns the task (status is `running`).
    Claimed(Task),
    /// Somebody else got there first, or the task is no longer pending.
    Conflict {
        status: TaskStatus,
        worker_id: Option<WorkerId>,
    },
}

impl Claim {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Claim::Claimed(_))
    }
}

/// Task persistence.
///
/// # 設計原則
/// - 状態遷移は `Task` のメソッド経由のみ（invariant はドメイン側で保証）
/// - claim は単一の critical section で check-and-set
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// All tasks, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError>;

    /// Atomic `pending -> running`.
    async fn claim(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError>;

    /// Claim the oldest pending task, if any.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    async fn succeed(
        &self,
        id: &TaskId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    async fn fail(
        &self,
        id: &TaskId,
        cause: String,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    async fn counts_by_status(&self) -> Result<TaskCounts, StoreError>;
}
