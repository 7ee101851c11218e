//! Domain model (ids, task record, status, outcomes, errors).

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod sources;
pub mod state;
pub mod task;

pub use errors::{ErrorKind, ReproError};
pub use ids::{IdError, Revision, TaskId, WorkerId};
pub use outcome::{Artifact, Completion, NO_CRASH_OBSERVED};
pub use sources::TaskSources;
pub use state::TaskStatus;
pub use task::{Task, TaskType, TransitionError};
