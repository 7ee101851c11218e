//! KernelBuilder port - カーネルビルドの境界
//!
//! The build system is an external collaborator. The orchestrator only
//! needs two things from it: apply a fix patch, and produce a kernel image
//! plus an installed header tree.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::ReproError;
use crate::toolchain::ToolchainDescriptor;
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Applied,
    /// The patch was already in the tree (a previous run applied it).
    AlreadyApplied,
}

/// Outputs of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArtifacts {
    pub kernel_image: PathBuf,
    pub headers_dir: PathBuf,
}

#[async_trait]
pub trait KernelBuilder: Send + Sync {
    /// Apply `paths.patch_path` to the source tree.
    ///
    /// Conflicts fail with `ReproError::PatchConflict`.
    async fn apply_patch(&self, paths: &WorkspacePaths) -> Result<PatchState, ReproError>;

    /// Configure and build the kernel, then install headers.
    async fn build(
        &self,
        paths: &WorkspacePaths,
        toolchain: &ToolchainDescriptor,
    ) -> Result<KernelArtifacts, ReproError>;
}
