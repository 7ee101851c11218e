//! App - アプリケーション層
//!
//! ports を組み合わせて task を実行する。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: 構築とワイヤリング（fail-fast）
//! - **TaskOrchestrator**: 状態機械と pipeline
//! - **WorkerGroup**: pending task を消化するワーカー群

pub mod builder;
pub mod orchestrator;
pub mod worker_loop;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::orchestrator::{RunOutcome, TaskOrchestrator};
pub use self::worker_loop::{DEFAULT_POLL_INTERVAL, WorkerGroup};
