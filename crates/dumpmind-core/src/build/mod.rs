//! Kernel build driver: `.config` handling and the `make` invocations.

pub mod kconfig;
pub mod make;

pub use make::MakeKernelBuilder;
