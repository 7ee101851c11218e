//! Image Mount Manager
//!
//! `with_mount` owns one Mount Session: the image is loop-mounted, the body
//! runs against the mounted root, and the mount is released before the call
//! returns. Release happens on every path: normal return, body error,
//! cancellation, and the whole future being dropped.
//!
//! Error precedence after the body has run:
//!
//! | body  | unmount | result                         |
//! |-------|---------|--------------------------------|
//! | Ok    | Ok      | body value                     |
//! | Ok    | Err     | body value, unmount logged     |
//! | Err   | Ok      | body error                     |
//! | Err   | Err     | body error, unmount logged     |

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::domain::ReproError;
use crate::ports::Mounter;
use crate::workspace::ensure_dir;

/// The mounted filesystem root, handed to the session body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedRoot {
    root: PathBuf,
}

impl MountedRoot {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// A root that is not backed by a mount, for exercising session bodies.
    #[cfg(test)]
    pub(crate) fn for_tests(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Resolve an image-absolute path (`/var/crash/vmcore`) under the root.
    ///
    /// `.` is dropped; `..` is refused so the result never leaves the root.
    pub fn join(&self, rel: impl AsRef<Path>) -> Result<PathBuf, ReproError> {
        let rel = rel.as_ref();
        let mut out = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ReproError::io(
                        format!("{} escapes the mounted root", rel.display()),
                        std::io::Error::from(std::io::ErrorKind::InvalidInput),
                    ));
                }
            }
        }
        Ok(out)
    }
}

#[derive(Clone)]
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
}

impl MountManager {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self { mounter }
    }

    pub async fn with_mount<T, F, Fut>(
        &self,
        image: &Path,
        mount_dir: &Path,
        cancel: &CancelSignal,
        body: F,
    ) -> Result<T, ReproError>
    where
        F: FnOnce(MountedRoot) -> Fut,
        Fut: Future<Output = Result<T, ReproError>>,
    {
        if !tokio::fs::metadata(image)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Err(ReproError::ImageNotFound(image.to_path_buf()));
        }
        cancel.check()?;
        ensure_dir(mount_dir)?;

        let mount_failed = |reason: String| ReproError::MountFailed {
            image: image.to_path_buf(),
            mount_dir: mount_dir.to_path_buf(),
            reason,
        };

        let stale = self
            .mounter
            .is_mounted(mount_dir)
            .await
            .map_err(|e| mount_failed(format!("cannot inspect mount table: {e}")))?;
        if stale {
            warn!(mount_dir = %mount_dir.display(), "stale mount from a previous run, unmounting");
            self.mounter
                .unmount(mount_dir)
                .await
                .map_err(|e| mount_failed(format!("stale mount could not be released: {e}")))?;
        }

        // Armed before the mount call: the mount may complete even if this
        // future is dropped while waiting on it.
        let mut guard = SessionGuard {
            mounter: Arc::clone(&self.mounter),
            mount_dir: mount_dir.to_path_buf(),
            armed: true,
        };
        if let Err(e) = self.mounter.mount(image, mount_dir).await {
            guard.armed = false;
            return Err(mount_failed(e.to_string()));
        }
        info!(image = %image.display(), mount_dir = %mount_dir.display(), "image mounted");

        let root = MountedRoot {
            root: mount_dir.to_path_buf(),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReproError::Cancelled),
            r = body(root) => r,
        };

        match (result, guard.release().await) {
            (result, Ok(())) => result,
            (Ok(value), Err(e)) => {
                warn!(error = %e, "unmount failed after a successful session; keeping the result");
                Ok(value)
            }
            (Err(original), Err(e)) => {
                warn!(error = %e, cause = %original, "unmount failed after a failed session");
                Err(original)
            }
        }
    }
}

/// Unmounts on drop unless `release` already did.
struct SessionGuard {
    mounter: Arc<dyn Mounter>,
    mount_dir: PathBuf,
    armed: bool,
}

impl SessionGuard {
    async fn release(mut self) -> Result<(), ReproError> {
        self.armed = false;
        self.mounter
            .unmount(&self.mount_dir)
            .await
            .map_err(|e| ReproError::UnmountFailed {
                mount_dir: self.mount_dir.clone(),
                reason: e.to_string(),
            })?;
        debug!(mount_dir = %self.mount_dir.display(), "image unmounted");
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(mount_dir = %self.mount_dir.display(), "mount session abandoned, unmounting");
        let mounter = Arc::clone(&self.mounter);
        let mount_dir = std::mem::take(&mut self.mount_dir);
        let unmount = move || {
            if let Err(e) = mounter.unmount_blocking(&mount_dir) {
                warn!(error = %e, mount_dir = %mount_dir.display(), "unmount on drop failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(unmount);
            }
            Err(_) => unmount(),
        }
    }
}
