//! Port implementations.
//!
//! - `InMemoryTaskStore`: task store for single-process runs and tests
//! - `LoopMounter`: real loop mounts via `mount`/`umount`
//! - `InMemoryMountTable`: mount table fake for tests
//! - `CommandReproducer`: boots the kernel through an external program
//! - `HttpFetcher`: downloads kernel source, config and reproducer

pub mod command_reproducer;
pub mod http_fetcher;
pub mod inmem_store;
pub mod loop_mount;
pub mod mount_table;

pub use command_reproducer::CommandReproducer;
pub use http_fetcher::HttpFetcher;
pub use inmem_store::InMemoryTaskStore;
pub use loop_mount::LoopMounter;
pub use mount_table::InMemoryMountTable;
