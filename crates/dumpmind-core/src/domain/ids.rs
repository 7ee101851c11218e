//! Domain identifiers (strongly-typed IDs).
//!
//! Task and worker identities are opaque strings. They end up as directory
//! names under the workspace root, so construction validates that they are a
//! single, non-empty path component.
//!
//! ## Phantom Type パターン
//! `Id<T>` shares one implementation between `TaskId` and `WorkerId` while the
//! marker type keeps them apart at compile time.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} '{value}' is not a single path component")]
    NotAPathComponent { kind: &'static str, value: String },
}

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Human-readable name used in validation errors.
    fn kind() -> &'static str;

    /// Prefix used when an id is generated rather than supplied.
    fn prefix() -> &'static str;
}

/// Generic opaque identifier.
pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Validate and wrap an externally supplied identifier.
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        check_component(T::kind(), &value)?;
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    /// Build an id from a freshly generated ULID.
    pub fn from_ulid(ulid: ulid::Ulid) -> Self {
        Self {
            value: format!("{}{}", T::prefix(), ulid.to_string().to_lowercase()),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

fn check_component(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if value == "." || value == ".." || value.contains('/') || value.contains('\0') {
        return Err(IdError::NotAPathComponent {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

// derive だと T に余計な bound が付くので手で実装する
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", T::kind(), self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(value).map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
pub enum Task {}

impl IdMarker for Task {
    fn kind() -> &'static str {
        "task id"
    }

    fn prefix() -> &'static str {
        ""
    }
}

/// Worker のマーカー型
pub enum Worker {}

impl IdMarker for Worker {
    fn kind() -> &'static str {
        "worker id"
    }

    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a Task (one reproduction request).
pub type TaskId = Id<Task>;

/// Identifier of the worker process executing a task.
pub type WorkerId = Id<Worker>;

/// Kernel source revision (commit hash or tag).
///
/// Used to name the source directory (`linux-<revision>`), so it follows the
/// same single-component rule as ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        check_component("revision", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[test]
    fn supplied_ids_keep_their_value() {
        let id = TaskId::parse("abc123").unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
    }

    #[rstest]
    #[case::empty("")]
    #[case::dot(".")]
    #[case::dotdot("..")]
    #[case::nested("a/b")]
    fn path_unsafe_ids_are_rejected(#[case] raw: &str) {
        assert!(TaskId::parse(raw).is_err());
        assert!(Revision::parse(raw).is_err());
    }

    #[test]
    fn generated_ids_carry_the_marker_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let worker = WorkerId::from_ulid(Ulid::new());

        assert!(!task.as_str().is_empty());
        assert!(worker.as_str().starts_with("worker-"));
        // let _: TaskId = worker; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TaskId::parse("abc123").unwrap();
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"abc123\"");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);

        let bad: Result<TaskId, _> = serde_json::from_str("\"../etc\"");
        assert!(bad.is_err());
    }
}
