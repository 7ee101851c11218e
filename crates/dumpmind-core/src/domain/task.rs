//! Task record and its transitions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{Revision, TaskId, WorkerId};
use super::outcome::Completion;
use super::sources::TaskSources;
use super::state::TaskStatus;

/// The kind of work requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Build, inject the reproducer, boot, and collect a crash dump.
    GetVmcore,

    /// Apply a fix patch to the source tree and rebuild.
    PatchApply,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::GetVmcore => "get-vmcore",
            TaskType::PatchApply => "patch-apply",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get-vmcore" => Ok(TaskType::GetVmcore),
            "patch-apply" => Ok(TaskType::PatchApply),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One reproduction request.
///
/// Design:
/// - Single source of truth for a task's state.
/// - State transitions via methods (not direct field access), so the
///   timestamp invariants hold by construction:
///   `started_at` is set iff status != Pending,
///   `finished_at` is set iff status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    #[serde(rename = "type")]
    task_type: TaskType,
    status: TaskStatus,

    /// Kernel source revision to build.
    revision: Revision,

    /// Compiler identifier (`gcc-12`, `clang-15`, `gcc-default`).
    toolchain: String,

    /// Downloads and patch text staged before the build.
    #[serde(default, skip_serializing_if = "TaskSources::is_empty")]
    sources: TaskSources,

    #[serde(default)]
    worker_id: Option<WorkerId>,

    /// Error message or summary; empty until terminal.
    #[serde(default)]
    result: String,

    #[serde(default)]
    artifact_path: Option<PathBuf>,
    #[serde(default)]
    artifact_name: Option<String>,

    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        revision: Revision,
        toolchain: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            revision,
            toolchain: toolchain.into(),
            sources: TaskSources::default(),
            worker_id: None,
            result: String::new(),
            artifact_path: None,
            artifact_name: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Attach what the fetch stage should pull in.
    pub fn with_sources(mut self, sources: TaskSources) -> Self {
        self.sources = sources;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn toolchain(&self) -> &str {
        &self.toolchain
    }

    pub fn sources(&self) -> &TaskSources {
        &self.sources
    }

    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.worker_id.as_ref()
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn artifact_path(&self) -> Option<&PathBuf> {
        self.artifact_path.as_ref()
    }

    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn illegal(&self, to: TaskStatus) -> TransitionError {
        TransitionError {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Pending -> Running. Records the claiming worker and start time.
    pub fn start(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.is_claimable() {
            return Err(self.illegal(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker);
        self.started_at = Some(now);
        Ok(())
    }

    /// Running -> Success.
    pub fn succeed(
        &mut self,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Running {
            return Err(self.illegal(TaskStatus::Success));
        }
        self.status = TaskStatus::Success;
        self.result = completion.summary;
        if let Some(artifact) = completion.artifact {
            self.artifact_path = Some(artifact.path);
            self.artifact_name = Some(artifact.name);
        }
        self.finished_at = Some(now);
        Ok(())
    }

    /// Running -> Failed.
    pub fn fail(
        &mut self,
        cause: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Running {
            return Err(self.illegal(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.result = cause.into();
        self.finished_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::Artifact;
    use chrono::TimeZone;

    fn t(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, sec).unwrap()
    }

    fn pending() -> Task {
        Task::new(
            TaskId::parse("abc123").unwrap(),
            TaskType::GetVmcore,
            Revision::parse("deadbeef").unwrap(),
            "gcc-12",
            t(0),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::parse("worker-1").unwrap()
    }

    fn assert_timestamp_invariants(task: &Task) {
        assert_eq!(
            task.started_at().is_some(),
            task.status() != TaskStatus::Pending
        );
        assert_eq!(task.finished_at().is_some(), task.status().is_terminal());
    }

    #[test]
    fn new_task_is_pending_without_timestamps() {
        let task = pending();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.worker_id().is_none());
        assert!(task.result().is_empty());
        assert_timestamp_invariants(&task);
    }

    #[test]
    fn start_records_worker_and_time() {
        let mut task = pending();
        task.start(worker(), t(1)).unwrap();

        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.worker_id(), Some(&worker()));
        assert_eq!(task.started_at(), Some(t(1)));
        assert_timestamp_invariants(&task);
    }

    #[test]
    fn start_twice_is_rejected_and_keeps_first_claim() {
        let mut task = pending();
        task.start(worker(), t(1)).unwrap();

        let err = task
            .start(WorkerId::parse("worker-2").unwrap(), t(2))
            .unwrap_err();
        assert_eq!(err.from, TaskStatus::Running);
        assert_eq!(task.worker_id(), Some(&worker()));
        assert_eq!(task.started_at(), Some(t(1)));
    }

    #[test]
    fn succeed_sets_artifact_and_finish_time() {
        let mut task = pending();
        task.start(worker(), t(1)).unwrap();
        task.succeed(
            Completion::with_artifact(Artifact::at("/w/abc123/build/vmcore"), "vmcore extracted"),
            t(5),
        )
        .unwrap();

        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(task.artifact_name(), Some("vmcore"));
        assert_eq!(task.finished_at(), Some(t(5)));
        assert_timestamp_invariants(&task);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut task = pending();
        task.start(worker(), t(1)).unwrap();
        task.fail("BuildFailed: boom", t(2)).unwrap();

        assert!(task.succeed(Completion::no_crash(), t(3)).is_err());
        assert!(task.fail("again", t(3)).is_err());
        assert!(task.start(worker(), t(3)).is_err());
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.result(), "BuildFailed: boom");
        assert_eq!(task.finished_at(), Some(t(2)));
    }

    #[test]
    fn pending_cannot_finish_directly() {
        let mut task = pending();
        assert!(task.succeed(Completion::no_crash(), t(1)).is_err());
        assert!(task.fail("x", t(1)).is_err());
        assert_timestamp_invariants(&task);
    }

    #[test]
    fn task_type_uses_wire_names() {
        assert_eq!("get-vmcore".parse::<TaskType>(), Ok(TaskType::GetVmcore));
        assert_eq!(
            serde_json::to_string(&TaskType::PatchApply).unwrap(),
            "\"patch-apply\""
        );
        assert!("reboot".parse::<TaskType>().is_err());
    }
}
