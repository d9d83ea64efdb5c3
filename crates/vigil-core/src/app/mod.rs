//! App - アプリケーション層
//!
//! - builder: 部品のワイヤリングと起動・停止
//! - scheduler: 同時実行数を制限したスキャン実行
//! - log_hub: タスク出力のライブ配信
//! - lifecycle: クラッシュ復旧と保持期間による掃除
//! - service: 外部に公開する操作
//! - profiles: 保存済みスキャン設定
//! - status: キュー状況の見積もり
//! - invocation: エンジンのコマンドライン組み立て

pub mod builder;
pub mod invocation;
pub mod lifecycle;
pub mod log_hub;
pub mod profiles;
pub mod scheduler;
pub mod service;
pub mod status;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::lifecycle::{RetentionSweeper, SweepReport, recover_interrupted};
pub use self::log_hub::{ListenerId, LogHub, LogListener, Replay};
pub use self::profiles::{ProfilePolicy, ProfileService};
pub use self::scheduler::{Scheduler, SchedulerDeps, SchedulerSettings};
pub use self::service::{DeleteSummary, LogStream, ScanService};
pub use self::status::QueueStatus;
