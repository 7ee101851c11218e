//! Outcome model: what a finished pipeline hands back to the orchestrator.
//!
//! This module does not know about stores or workers. It only describes the
//! shape of a successful run so the state machine can record it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A file produced by a task run (relocated vmcore, rebuilt bzImage, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub name: String,
}

impl Artifact {
    /// Name the artifact after the final path component.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Successful end of a pipeline.
///
/// `artifact` is `None` for a `get-vmcore` run in which the kernel did not
/// crash: that is still a success, just one without a dump to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    pub summary: String,
}

pub const NO_CRASH_OBSERVED: &str = "no crash observed";

impl Completion {
    pub fn with_artifact(artifact: Artifact, summary: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact),
            summary: summary.into(),
        }
    }

    pub fn no_crash() -> Self {
        Self {
            artifact: None,
            summary: NO_CRASH_OBSERVED.to_string(),
        }
    }
}
