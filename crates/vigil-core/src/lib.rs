//! vigil-core
//!
//! Core building blocks for the vigil scan orchestrator.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, owner, task, scan config, profile, result, query, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, ProfileStore, CommandRunner, EngineProbe, Clock, IdGenerator）
//! - **impls**: ports の実装（FileTaskStore, FileProfileStore, InMemoryTaskStore, TokioCommandRunner, CommandProbe）
//! - **app**: アプリケーションロジック（builder, scheduler, log hub, lifecycle, service, profiles）
//! - **config**: 環境変数からの設定
//! - **observability**: 状態ごとの件数

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{App, AppBuilder, BuildError, LogStream, ProfileService, ScanService};
pub use config::{Config, ConfigError};
pub use domain::{
    ConfigProfile, ErrorKind, Owner, ScanRequest, ScanTask, TaskId, TaskStatus, VigilError,
};
