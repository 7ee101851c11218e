//! Ports - 抽象化レイヤー
//!
//! 外部システム（task 永続化, mount table, kernel build, VM 起動, ダウンロード）への
//! インターフェース。実装は `impls` と `build` にある。

pub mod clock;
pub mod id_generator;
pub mod kernel_build;
pub mod mounter;
pub mod reproducer;
pub mod source_fetcher;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kernel_build::{KernelArtifacts, KernelBuilder, PatchState};
pub use self::mounter::{MountError, Mounter};
pub use self::reproducer::Reproducer;
pub use self::source_fetcher::SourceFetcher;
pub use self::task_store::{Claim, StoreError, TaskStore};
