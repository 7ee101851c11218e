//! Crash report ingestion - syzbot の bug JSON から task を作る
//!
//! A report names the kernel commit, the compiler it was built with, the
//! kernel config, a C reproducer and (for fixed bugs) the fix patch. The
//! report itself is never stored: it is turned into a [`TaskRequest`] whose
//! [`TaskSources`] the fetch stage pulls in before the build.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SourceSettings;
use crate::domain::{IdError, Revision, TaskId, TaskSources, TaskType};
use crate::toolchain::CompilerId;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot read report {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("report {0} lists no crashes")]
    NoCrashes(String),

    #[error("report {report}: {source}")]
    InvalidId {
        report: String,
        #[source]
        source: IdError,
    },

    #[error("report {report}: unsupported compiler '{description}'")]
    UnsupportedCompiler { report: String, description: String },

    #[error("report {0} has no fix patch")]
    NoPatch(String),
}

/// syzbot bug export (the `/bug?json=1` shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CrashReport {
    pub version: i32,
    pub title: String,
    pub id: String,
    pub status: String,
    pub fix_commits: Vec<FixCommit>,
    pub crashes: Vec<Crash>,
    #[serde(rename = "parent_of_fix_commit")]
    pub parent_of_fix_commit: String,
    pub patch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixCommit {
    pub title: String,
    pub link: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Crash {
    pub title: String,
    pub syz_reproducer: String,
    pub c_reproducer: String,
    pub kernel_config: String,
    pub kernel_source_git: String,
    pub kernel_source_commit: String,
    pub compiler_description: String,
    pub architecture: String,
}

/// Everything `TaskOrchestrator::create_request` needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub id: TaskId,
    pub task_type: TaskType,
    pub revision: Revision,
    pub toolchain: String,
    pub sources: TaskSources,
}

impl CrashReport {
    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let json = std::fs::read_to_string(path).map_err(|source| ReportError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let report = Self::from_json(&json)?;
        info!(report = %report.id, path = %path.display(), "crash report loaded");
        Ok(report)
    }

    /// The crash to reproduce: the first one with a C reproducer, else the
    /// first one.
    pub fn primary_crash(&self) -> Option<&Crash> {
        self.crashes
            .iter()
            .find(|c| !c.c_reproducer.is_empty())
            .or_else(|| self.crashes.first())
    }

    /// Turn the report into a task request.
    ///
    /// The task id is the report id. `patch-apply` requires a fix patch.
    pub fn to_request(
        &self,
        task_type: TaskType,
        urls: &SourceSettings,
    ) -> Result<TaskRequest, ReportError> {
        let crash = self
            .primary_crash()
            .ok_or_else(|| ReportError::NoCrashes(self.id.clone()))?;
        let invalid = |source| ReportError::InvalidId {
            report: self.id.clone(),
            source,
        };
        let id = TaskId::parse(self.id.as_str()).map_err(invalid)?;
        let revision = Revision::parse(crash.kernel_source_commit.as_str()).map_err(invalid)?;
        let toolchain = CompilerId::from_description(&crash.compiler_description)
            .map_err(|_| ReportError::UnsupportedCompiler {
                report: self.id.clone(),
                description: crash.compiler_description.clone(),
            })?
            .to_string();

        let patch = non_empty(&self.patch).map(str::to_string);
        if task_type == TaskType::PatchApply && patch.is_none() {
            return Err(ReportError::NoPatch(self.id.clone()));
        }

        let sources = TaskSources {
            kernel_archive: Some(format!("{}{}.tar.gz", urls.kernel_archive_base, revision)),
            kernel_config: non_empty(&crash.kernel_config)
                .map(|link| attachment_url(&urls.syzbot_base, link)),
            reproducer: non_empty(&crash.c_reproducer)
                .map(|link| attachment_url(&urls.syzbot_base, link)),
            patch,
        };
        debug!(report = %self.id, %revision, %toolchain, "report mapped to task");
        Ok(TaskRequest {
            id,
            task_type,
            revision,
            toolchain,
            sources,
        })
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// syzbot links are relative (`/text?tag=ReproC&x=...`); absolute ones are
/// kept.
fn attachment_url(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        link.trim_start_matches('/')
    )
}
