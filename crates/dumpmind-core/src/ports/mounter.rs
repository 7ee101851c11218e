//! Mounter port - loop mount の抽象化
//!
//! The mount manager only talks to the kernel mount table through this
//! trait, so its cleanup guarantees can be checked against an in-memory
//! table in tests.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mounted(&self, mount_dir: &Path) -> Result<bool, MountError>;

    /// Loop-mount `image` at `mount_dir`.
    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), MountError>;

    async fn unmount(&self, mount_dir: &Path) -> Result<(), MountError>;

    /// Synchronous unmount, used from `Drop` when a session future is
    /// abandoned before it could clean up.
    fn unmount_blocking(&self, mount_dir: &Path) -> Result<(), MountError>;
}
