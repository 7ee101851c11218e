//! Errors - エラー型と分類
//!
//! Every failure the pipeline can hit is a `ReproError`. The orchestrator is
//! the only place that turns one into a terminal task status; it renders the
//! `ErrorKind` name in front of the message so a failed task's `result` can be
//! matched on without parsing free text.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ImageNotFound,
    MountFailed,
    UnmountFailed,
    HeaderCopyFailed,
    TriggerCopyFailed,
    DirectoryCreateError,
    FetchFailed,
    UnsupportedToolchain,
    BuildFailed,
    BuildTimeout,
    PatchConflict,
    ReproductionFailed,
    Cancelled,
    Io,
    Store,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ImageNotFound => "ImageNotFound",
            ErrorKind::MountFailed => "MountFailed",
            ErrorKind::UnmountFailed => "UnmountFailed",
            ErrorKind::HeaderCopyFailed => "HeaderCopyFailed",
            ErrorKind::TriggerCopyFailed => "TriggerCopyFailed",
            ErrorKind::DirectoryCreateError => "DirectoryCreateError",
            ErrorKind::FetchFailed => "FetchFailed",
            ErrorKind::UnsupportedToolchain => "UnsupportedToolchain",
            ErrorKind::BuildFailed => "BuildFailed",
            ErrorKind::BuildTimeout => "BuildTimeout",
            ErrorKind::PatchConflict => "PatchConflict",
            ErrorKind::ReproductionFailed => "ReproductionFailed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "Io",
            ErrorKind::Store => "Store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReproError {
    #[error("disk image not found at {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("failed to mount {} at {}: {reason}", image.display(), mount_dir.display())]
    MountFailed {
        image: PathBuf,
        mount_dir: PathBuf,
        reason: String,
    },

    #[error("failed to unmount {}: {reason}", mount_dir.display())]
    UnmountFailed { mount_dir: PathBuf, reason: String },

    #[error("kernel headers could not be injected: {0}")]
    HeaderCopyFailed(String),

    #[error("reproducer could not be injected: {0}")]
    TriggerCopyFailed(String),

    #[error("cannot create directory {}: {source}", path.display())]
    DirectoryCreateError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not fetch {what}: {reason}")]
    FetchFailed { what: String, reason: String },

    #[error("unsupported toolchain '{0}'")]
    UnsupportedToolchain(String),

    #[error("kernel build failed: {0}")]
    BuildFailed(String),

    #[error("kernel build exceeded {}s", .0.as_secs())]
    BuildTimeout(Duration),

    #[error("patch {} does not apply: {reason}", patch.display())]
    PatchConflict { patch: PathBuf, reason: String },

    #[error("reproduction run failed: {0}")]
    ReproductionFailed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task store: {0}")]
    Store(String),
}

impl ReproError {
    /// Attach a description of what was being done to an I/O error.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ReproError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReproError::ImageNotFound(_) => ErrorKind::ImageNotFound,
            ReproError::MountFailed { .. } => ErrorKind::MountFailed,
            ReproError::UnmountFailed { .. } => ErrorKind::UnmountFailed,
            ReproError::HeaderCopyFailed(_) => ErrorKind::HeaderCopyFailed,
            ReproError::TriggerCopyFailed(_) => ErrorKind::TriggerCopyFailed,
            ReproError::DirectoryCreateError { .. } => ErrorKind::DirectoryCreateError,
            ReproError::FetchFailed { .. } => ErrorKind::FetchFailed,
            ReproError::UnsupportedToolchain(_) => ErrorKind::UnsupportedToolchain,
            ReproError::BuildFailed(_) => ErrorKind::BuildFailed,
            ReproError::BuildTimeout(_) => ErrorKind::BuildTimeout,
            ReproError::PatchConflict { .. } => ErrorKind::PatchConflict,
            ReproError::ReproductionFailed(_) => ErrorKind::ReproductionFailed,
            ReproError::Cancelled => ErrorKind::Cancelled,
            ReproError::Io { .. } => ErrorKind::Io,
            ReproError::Store(_) => ErrorKind::Store,
        }
    }

    /// Text stored in a failed task's `result` field.
    pub fn to_task_result(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_result_is_prefixed_with_the_kind() {
        let err = ReproError::ImageNotFound(PathBuf::from("/w/abc123/image/debian.img"));
        let text = err.to_task_result();
        assert!(text.starts_with("ImageNotFound: "));
        assert!(text.contains("/w/abc123/image/debian.img"));
    }

    #[test]
    fn timeout_reports_seconds() {
        let err = ReproError::BuildTimeout(Duration::from_secs(90));
        assert_eq!(err.kind(), ErrorKind::BuildTimeout);
        assert_eq!(err.to_string(), "kernel build exceeded 90s");
    }
}
