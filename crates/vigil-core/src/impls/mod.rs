//! Impls - ports の実装
//!
//! - **FileTaskStore**: タスクごとのディレクトリに永続化する本番用ストア
//! - **FileProfileStore**: 所有者ごとの保存済みスキャン設定
//! - **InMemoryTaskStore**: テスト・一時利用向けのストア
//! - **TokioCommandRunner**: `tokio::process` によるサブプロセス実行
//! - **CommandProbe**: エンジンのバージョン取得

pub mod command_probe;
pub mod file_profile_store;
pub mod file_store;
pub mod memory_store;
pub mod process_runner;

pub use self::command_probe::CommandProbe;
pub use self::file_profile_store::FileProfileStore;
pub use self::file_store::{FileTaskStore, LoadReport};
pub use self::memory_store::InMemoryTaskStore;
pub use self::process_runner::TokioCommandRunner;
