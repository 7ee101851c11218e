//! InMemoryMountTable - テスト用の Mounter
//!
//! Keeps a set of "mounted" directories instead of touching the kernel.
//! Failures can be injected per operation, and every call is counted so
//! tests can assert what the mount manager did.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::ports::{MountError, Mounter};

#[derive(Debug, Default)]
pub struct InMemoryMountTable {
    mounted: Mutex<HashSet<PathBuf>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

impl InMemoryMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `mount` fail, like a corrupt image would.
    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unmounts(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Pretend a previous run left `dir` mounted.
    pub fn insert_stale(&self, dir: &Path) {
        self.table().insert(dir.to_path_buf());
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.table().contains(dir)
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn mount_calls(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.mounted.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, dir: &Path) -> Result<(), MountError> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(MountError::Command(format!(
                "umount: {}: target is busy",
                dir.display()
            )));
        }
        if !self.table().remove(dir) {
            return Err(MountError::Command(format!(
                "umount: {}: not mounted",
                dir.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for InMemoryMountTable {
    async fn is_mounted(&self, mount_dir: &Path) -> Result<bool, MountError> {
        Ok(self.contains(mount_dir))
    }

    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), MountError> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(MountError::Command(format!(
                "mount: {}: wrong fs type, bad option, bad superblock",
                image.display()
            )));
        }
        if !self.table().insert(mount_dir.to_path_buf()) {
            return Err(MountError::Command(format!(
                "mount: {}: already mounted",
                mount_dir.display()
            )));
        }
        Ok(())
    }

    async fn unmount(&self, mount_dir: &Path) -> Result<(), MountError> {
        self.remove(mount_dir)
    }

    fn unmount_blocking(&self, mount_dir: &Path) -> Result<(), MountError> {
        self.remove(mount_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_mount_state() {
        let table = InMemoryMountTable::new();
        let dir = Path::new("/w/abc123/image/mnt");

        table.mount(Path::new("/w/img"), dir).await.unwrap();
        assert!(table.is_mounted(dir).await.unwrap());
        assert!(table.mount(Path::new("/w/img"), dir).await.is_err());

        table.unmount(dir).await.unwrap();
        assert!(table.is_empty());
        assert!(table.unmount(dir).await.is_err());
        assert_eq!(table.mount_calls(), 2);
        assert_eq!(table.unmount_calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures() {
        let table = InMemoryMountTable::new();
        let dir = Path::new("/mnt");

        table.fail_mounts(true);
        assert!(table.mount(Path::new("/img"), dir).await.is_err());
        assert!(table.is_empty());

        table.fail_mounts(false);
        table.mount(Path::new("/img"), dir).await.unwrap();
        table.fail_unmounts(true);
        assert!(table.unmount(dir).await.is_err());
        assert!(table.contains(dir));
    }
}
