//! SourceFetcher port - ソースと添付ファイルの取得
//!
//! Populates the parts of a workspace that come from elsewhere: the kernel
//! tree, the reported kernel config and the reproducer binary. Anything
//! already present is left alone, so a rerun only fetches what is missing.

use async_trait::async_trait;

use crate::domain::{ReproError, TaskSources};
use crate::workspace::WorkspacePaths;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch every remote item of `sources` that `paths` does not have yet.
    ///
    /// Failures are `ReproError::FetchFailed`.
    async fn fetch(
        &self,
        sources: &TaskSources,
        paths: &WorkspacePaths,
    ) -> Result<(), ReproError>;
}
