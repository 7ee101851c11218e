//! Inputs a task pulls in before it builds.
//!
//! A task submitted by hand expects its workspace to be populated already.
//! One created from a crash report carries the download locations here, and
//! the fetch stage fills in whatever the workspace is still missing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSources {
    /// `.tar.gz` of the kernel tree at the task's revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_archive: Option<String>,

    /// Kernel config the crash was reported with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_config: Option<String>,

    /// C source of the reproducer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproducer: Option<String>,

    /// Fix patch text, written to `patch.diff` as is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl TaskSources {
    /// Anything that has to come over the network.
    pub fn has_remote(&self) -> bool {
        self.kernel_archive.is_some() || self.kernel_config.is_some() || self.reproducer.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_remote() && self.patch.is_none()
    }
}
