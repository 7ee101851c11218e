//! dumpmind-core
//!
//! Kernel crash reproduction as discrete tasks: build a kernel at a given
//! revision, inject headers and a reproducer into a disk image, and collect
//! the crash dump the triggering boot leaves behind.
//!
//! # モジュール構成
//! - **domain**: Task、状態、ID、エラー
//! - **workspace**: task ごとのディレクトリ構成
//! - **toolchain**: compiler identifier の解決
//! - **build**: `make` による kernel build
//! - **mount**: loop mount の session 管理
//! - **extract**: image への注入と artifact の回収
//! - **report**: syzbot crash report の取り込み
//! - **ports / impls**: 抽象化と実装
//! - **app**: orchestrator、worker
//! - **config**: settings.toml

pub mod app;
pub mod build;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod extract;
pub mod impls;
pub mod mount;
pub mod observability;
pub mod ports;
pub mod process;
pub mod report;
pub mod toolchain;
pub mod workspace;
