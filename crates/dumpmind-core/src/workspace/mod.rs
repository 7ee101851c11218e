//! Workspace layout: the deterministic set of paths owned by one task.
//!
//! ```text
//! <root>/<id>/
//!     build/                 kernel O= directory, final home of vmcore + vm.log
//!     install/include/       headers_install output
//!     linux-<revision>/      kernel source tree
//!     image/debian.img       per-task copy of the template image
//!     image/mnt/             transient mount point
//!     image/vm.log           console log of the triggering boot
//!     bug                    reproducer binary injected into the image
//!     patch.diff             fix patch for patch-apply tasks
//!     config                 kernel config the crash was reported with
//! ```
//!
//! Computing paths never touches the filesystem. Creating directories is a
//! separate, idempotent step.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::domain::{ReproError, Revision, TaskId};

pub const IMAGE_FILE_NAME: &str = "debian.img";
pub const LOG_FILE_NAME: &str = "vm.log";
pub const VMCORE_FILE_NAME: &str = "vmcore";
pub const TRIGGER_FILE_NAME: &str = "bug";

/// Kernel image location relative to the build directory.
pub const KERNEL_IMAGE_REL: &str = "arch/x86_64/boot/bzImage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspacePaths {
    pub work_dir: PathBuf,
    pub build_dir: PathBuf,
    pub install_dir: PathBuf,
    pub src_dir: PathBuf,
    pub image_dir: PathBuf,
    pub image_path: PathBuf,
    pub mount_dir: PathBuf,
    pub log_path: PathBuf,
    pub trigger_path: PathBuf,
    pub patch_path: PathBuf,
    pub kernel_config_path: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: &Path, id: &TaskId, revision: &Revision) -> Self {
        let work_dir = root.join(id.as_str());
        let image_dir = work_dir.join("image");
        Self {
            build_dir: work_dir.join("build"),
            install_dir: work_dir.join("install"),
            src_dir: work_dir.join(format!("linux-{revision}")),
            image_path: image_dir.join(IMAGE_FILE_NAME),
            mount_dir: image_dir.join("mnt"),
            log_path: image_dir.join(LOG_FILE_NAME),
            trigger_path: work_dir.join(TRIGGER_FILE_NAME),
            patch_path: work_dir.join("patch.diff"),
            kernel_config_path: work_dir.join("config"),
            image_dir,
            work_dir,
        }
    }

    /// `build/arch/x86_64/boot/bzImage`
    pub fn kernel_image(&self) -> PathBuf {
        self.build_dir.join(KERNEL_IMAGE_REL)
    }

    /// `install/include`, populated by `make headers_install`.
    pub fn headers_dir(&self) -> PathBuf {
        self.install_dir.join("include")
    }

    /// Final location of a relocated crash dump.
    pub fn vmcore_dest(&self) -> PathBuf {
        self.build_dir.join(VMCORE_FILE_NAME)
    }

    /// Final location of the relocated console log.
    pub fn log_dest(&self) -> PathBuf {
        self.build_dir.join(LOG_FILE_NAME)
    }

    /// Create every directory the pipeline writes into. Safe to call again on a
    /// partially prepared workspace.
    pub fn create_dirs(&self) -> Result<(), ReproError> {
        for dir in [
            &self.work_dir,
            &self.build_dir,
            &self.install_dir,
            &self.image_dir,
            &self.mount_dir,
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

/// Create `path` (and parents) if missing.
///
/// Ok when the directory already exists; `DirectoryCreateError` when creation
/// fails or something that is not a directory sits at `path`.
pub fn ensure_dir(path: &Path) -> Result<(), ReproError> {
    if path.is_dir() {
        return Ok(());
    }
    debug!(path = %path.display(), "creating directory");
    std::fs::create_dir_all(path).map_err(|source| ReproError::DirectoryCreateError {
        path: path.to_path_buf(),
        source,
    })
}

/// Run blocking filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ReproError>
where
    F: FnOnce() -> Result<T, ReproError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReproError::io("blocking task aborted", std::io::Error::other(e)))?
}
