//! TaskOrchestrator - Task の状態機械と pipeline の実行
//!
//! # フロー
//! 1. claim (`pending -> running`, atomic in the store)
//! 2. resolve toolchain
//! 3. stage sources: patch text, downloads (`SourceFetcher`, when configured)
//! 4. apply patch (`patch-apply` only)
//! 5. build, bounded by the build timeout
//! 6. mount session #1: inject headers + reproducer
//! 7. triggering boot (`Reproducer`, when configured)
//! 8. mount session #2: collect vmcore, even when the boot reported an error
//! 9. relocate console log
//! 10. `running -> success | failed`
//!
//! This is the only place that turns a `ReproError` into a terminal status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, error, info, info_span, warn};

use crate::cancel::CancelSignal;
use crate::domain::{
    Artifact, Completion, ReproError, Revision, Task, TaskId, TaskStatus, TaskType, WorkerId,
};
use crate::extract::ArtifactExtractor;
use crate::mount::MountManager;
use crate::ports::{
    Claim, Clock, IdGenerator, KernelBuilder, PatchState, Reproducer, SourceFetcher, TaskStore,
};
use crate::report::TaskRequest;
use crate::toolchain::{ToolchainDescriptor, ToolchainResolver};
use crate::workspace::{WorkspacePaths, blocking};

/// Result of `TaskOrchestrator::run`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// This worker ran the task; it is now terminal.
    Finished(Task),
    /// Another worker owns the task, or it already finished.
    Conflict {
        status: TaskStatus,
        worker_id: Option<WorkerId>,
    },
}

pub struct TaskOrchestrator {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) resolver: ToolchainResolver,
    pub(crate) builder: Arc<dyn KernelBuilder>,
    pub(crate) mounts: MountManager,
    pub(crate) extractor: ArtifactExtractor,
    pub(crate) reproducer: Option<Arc<dyn Reproducer>>,
    pub(crate) fetcher: Option<Arc<dyn SourceFetcher>>,
    pub(crate) workspace_root: PathBuf,
    pub(crate) template_image: Option<PathBuf>,
    pub(crate) build_timeout: Duration,
}

impl TaskOrchestrator {
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub fn resolver(&self) -> &ToolchainResolver {
        &self.resolver
    }

    pub fn paths(&self, id: &TaskId, revision: &Revision) -> WorkspacePaths {
        WorkspacePaths::new(&self.workspace_root, id, revision)
    }

    /// Register a new pending task with a generated id.
    pub async fn submit(
        &self,
        task_type: TaskType,
        revision: Revision,
        toolchain: &str,
    ) -> Result<Task, ReproError> {
        let id = self.ids.generate_task_id();
        self.create(id, task_type, revision, toolchain).await
    }

    /// Register a new pending task under a caller-chosen id.
    pub async fn create(
        &self,
        id: TaskId,
        task_type: TaskType,
        revision: Revision,
        toolchain: &str,
    ) -> Result<Task, ReproError> {
        let task = Task::new(id, task_type, revision, toolchain, self.clock.now());
        self.store.create(task.clone()).await?;
        Ok(task)
    }

    /// Register a task built from a crash report, download locations included.
    pub async fn create_request(&self, request: TaskRequest) -> Result<Task, ReproError> {
        let task = Task::new(
            request.id,
            request.task_type,
            request.revision,
            &request.toolchain,
            self.clock.now(),
        )
        .with_sources(request.sources);
        self.store.create(task.clone()).await?;
        Ok(task)
    }

    /// Claim `id` for `worker` and run it to a terminal status.
    pub async fn run(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        cancel: &CancelSignal,
    ) -> Result<RunOutcome, ReproError> {
        match self.store.claim(id, worker, self.clock.now()).await? {
            Claim::Claimed(task) => Ok(RunOutcome::Finished(self.execute(task, cancel).await?)),
            Claim::Conflict { status, worker_id } => {
                info!(task_id = %id, %status, "task already claimed");
                Ok(RunOutcome::Conflict { status, worker_id })
            }
        }
    }

    /// Run an already claimed task and record the terminal status.
    ///
    /// Only store errors are returned; pipeline errors end up in the task.
    pub async fn execute(&self, task: Task, cancel: &CancelSignal) -> Result<Task, ReproError> {
        let span = info_span!("task", task_id = %task.id(), task_type = %task.task_type());
        async {
            info!(revision = %task.revision(), toolchain = task.toolchain(), "task started");
            let outcome = self.pipeline(&task, cancel).await;
            let now = self.clock.now();
            let finished = match outcome {
                Ok(completion) => {
                    info!(summary = %completion.summary, "task succeeded");
                    self.store.succeed(task.id(), completion, now).await?
                }
                Err(e) => {
                    error!(error = %e, kind = %e.kind(), "task failed");
                    self.store.fail(task.id(), e.to_task_result(), now).await?
                }
            };
            Ok::<_, ReproError>(finished)
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&self, task: &Task, cancel: &CancelSignal) -> Result<Completion, ReproError> {
        cancel.check()?;
        let paths = self.paths(task.id(), task.revision());
        let layout = paths.clone();
        blocking(move || layout.create_dirs()).await?;

        let toolchain = self.resolver.resolve(task.toolchain())?;
        self.stage_sources(task, &paths, cancel).await?;

        if task.task_type() == TaskType::PatchApply {
            cancel.check()?;
            if self.builder.apply_patch(&paths).await? == PatchState::AlreadyApplied {
                warn!("patch was already applied to the source tree");
            }
        }

        let kernel = self.build(&paths, &toolchain, cancel).await?;
        self.mount_and_inject(&paths, cancel).await?;

        let boot = match &self.reproducer {
            Some(reproducer) => {
                cancel.check()?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReproError::Cancelled),
                    r = reproducer.reproduce(task, &paths) => r,
                }
            }
            None => Ok(()),
        };

        // a crashed VM often never exits cleanly, so collect before judging the boot
        let vmcore = self.extract_artifacts(&paths, cancel).await?;
        if let Err(e) = boot {
            if vmcore.is_none() {
                return Err(e);
            }
            warn!(error = %e, "reproducer reported an error after leaving a crash dump");
        }
        Ok(match (task.task_type(), vmcore) {
            (TaskType::GetVmcore, Some(dump)) => {
                Completion::with_artifact(dump, "vmcore collected")
            }
            (TaskType::GetVmcore, None) => Completion::no_crash(),
            (TaskType::PatchApply, Some(dump)) => {
                Completion::with_artifact(dump, "crash still reproduces with the patch applied")
            }
            (TaskType::PatchApply, None) => Completion::with_artifact(
                Artifact::at(kernel),
                "patch applied; no crash observed",
            ),
        })
    }

    /// Write the patch text and fetch whatever the workspace is missing.
    async fn stage_sources(
        &self,
        task: &Task,
        paths: &WorkspacePaths,
        cancel: &CancelSignal,
    ) -> Result<(), ReproError> {
        let sources = task.sources();
        if let Some(patch) = &sources.patch {
            if !paths.patch_path.is_file() {
                let write = format!("write {}", paths.patch_path.display());
                tokio::fs::write(&paths.patch_path, patch)
                    .await
                    .map_err(|e| ReproError::io(write, e))?;
            }
        }
        if !sources.has_remote() {
            return Ok(());
        }
        let Some(fetcher) = &self.fetcher else {
            warn!("task has download locations but no fetcher is configured");
            return Ok(());
        };
        cancel.check()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReproError::Cancelled),
            r = fetcher.fetch(sources, paths) => r,
        }
    }

    async fn build(
        &self,
        paths: &WorkspacePaths,
        toolchain: &ToolchainDescriptor,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, ReproError> {
        cancel.check()?;
        let build = tokio::time::timeout(self.build_timeout, self.builder.build(paths, toolchain));
        let artifacts = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReproError::Cancelled),
            r = build => r.map_err(|_| ReproError::BuildTimeout(self.build_timeout))??,
        };
        info!(kernel = %artifacts.kernel_image.display(), "kernel built");
        Ok(artifacts.kernel_image)
    }

    /// Prepare the task image and inject headers and the reproducer.
    ///
    /// Idempotent for a given workspace.
    pub async fn mount_and_inject(
        &self,
        paths: &WorkspacePaths,
        cancel: &CancelSignal,
    ) -> Result<(), ReproError> {
        let layout = paths.clone();
        blocking(move || layout.create_dirs()).await?;
        if let Some(template) = &self.template_image {
            self.extractor.prepare_image(template, paths).await?;
        }

        let extractor = &self.extractor;
        self.mounts
            .with_mount(&paths.image_path, &paths.mount_dir, cancel, |root| async move {
                extractor.inject_headers(&root, paths).await?;
                extractor.inject_trigger(&root, paths).await?;
                Ok(())
            })
            .await
    }

    /// Extraction-only session: collect a vmcore and relocate the log.
    ///
    /// `None` means no crash was observed. Idempotent for a given workspace.
    pub async fn extract_artifacts(
        &self,
        paths: &WorkspacePaths,
        cancel: &CancelSignal,
    ) -> Result<Option<Artifact>, ReproError> {
        let extractor = &self.extractor;
        let vmcore = self
            .mounts
            .with_mount(&paths.image_path, &paths.mount_dir, cancel, |root| async move {
                extractor.collect_vmcore(&root, paths).await
            })
            .await?;
        if self.extractor.relocate_log(paths).await?.is_none() {
            info!("no console log to relocate");
        }
        Ok(vmcore)
    }
}
