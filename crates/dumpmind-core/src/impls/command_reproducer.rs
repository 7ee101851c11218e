//! CommandReproducer - 外部プログラムで VM を起動する Reproducer
//!
//! The program gets the task context through its environment:
//!
//! | variable       | value                         |
//! |----------------|-------------------------------|
//! | `TASK_ID`      | task id                       |
//! | `REVISION`     | kernel revision               |
//! | `KERNEL_IMAGE` | `build/arch/x86_64/boot/bzImage` |
//! | `DISK_IMAGE`   | `image/debian.img`            |
//! | `LOG_PATH`     | `image/vm.log`                |
//!
//! stdout and stderr are appended to `LOG_PATH`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{ReproError, Task};
use crate::ports::Reproducer;
use crate::process::Cmd;
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone)]
pub struct CommandReproducer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReproducer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Reproducer for CommandReproducer {
    async fn reproduce(&self, task: &Task, paths: &WorkspacePaths) -> Result<(), ReproError> {
        let cmd = Cmd::new(&self.program)
            .args(&self.args)
            .env("TASK_ID", task.id().as_str())
            .env("REVISION", task.revision().as_str())
            .env("KERNEL_IMAGE", paths.kernel_image())
            .env("DISK_IMAGE", &paths.image_path)
            .env("LOG_PATH", &paths.log_path)
            .current_dir(&paths.work_dir)
            .error_msg(format!("{} failed", self.program.display()));

        info!(task_id = %task.id(), program = %self.program.display(), "booting reproducer");
        match tokio::time::timeout(self.timeout, cmd.run_logged(&paths.log_path)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ReproError::ReproductionFailed(e.to_string())),
            Err(_) => Err(ReproError::ReproductionFailed(format!(
                "no result after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Revision, TaskId, TaskType};
    use chrono::Utc;

    fn setup() -> (tempfile::TempDir, Task, WorkspacePaths) {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::new(
            TaskId::parse("abc123").unwrap(),
            TaskType::GetVmcore,
            Revision::parse("deadbeef").unwrap(),
            "gcc-12",
            Utc::now(),
        );
        let paths = WorkspacePaths::new(dir.path(), task.id(), task.revision());
        paths.create_dirs().unwrap();
        (dir, task, paths)
    }

    #[tokio::test]
    async fn environment_and_output_reach_the_log() {
        let (_dir, task, paths) = setup();
        let r = CommandReproducer::new(
            "sh",
            vec!["-c".into(), "echo $TASK_ID $REVISION; echo boom >&2".into()],
            Duration::from_secs(10),
        );

        r.reproduce(&task, &paths).await.unwrap();

        let log = std::fs::read_to_string(&paths.log_path).unwrap();
        assert!(log.contains("abc123 deadbeef"));
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reproduction_failed() {
        let (_dir, task, paths) = setup();
        let r = CommandReproducer::new("false", vec![], Duration::from_secs(10));
        let err = r.reproduce(&task, &paths).await.unwrap_err();
        assert!(matches!(err, ReproError::ReproductionFailed(_)));
    }

    #[tokio::test]
    async fn timeout_is_reproduction_failed() {
        let (_dir, task, paths) = setup();
        let r = CommandReproducer::new("sleep", vec!["30".into()], Duration::from_millis(50));
        let err = r.reproduce(&task, &paths).await.unwrap_err();
        assert!(matches!(err, ReproError::ReproductionFailed(ref m) if m.contains("no result")));
    }
}
