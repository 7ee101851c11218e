//! Reproducer port - トリガー起動
//!
//! Boots the freshly built kernel against the injected image so the trigger
//! can run. Optional: without one, the boot happens out-of-band and
//! artifacts are collected later.

use async_trait::async_trait;

use crate::domain::{ReproError, Task};
use crate::workspace::WorkspacePaths;

#[async_trait]
pub trait Reproducer: Send + Sync {
    /// Returns once the boot is over; the image must not be in use afterwards.
    async fn reproduce(&self, task: &Task, paths: &WorkspacePaths) -> Result<(), ReproError>;
}
