//! Ports - 抽象化レイヤー
//!
//! 外部のもの（ディスク、サブプロセス、時計）へのインターフェース。
//! スケジューラやサービスは trait だけを見て、実装は `impls` に置く。

pub mod clock;
pub mod command_runner;
pub mod engine_probe;
pub mod id_generator;
pub mod profile_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::command_runner::{CommandOutput, CommandRunner, LineSink};
pub use self::engine_probe::{DisabledProbe, EngineProbe};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::profile_store::ProfileStore;
pub use self::task_store::TaskStore;
