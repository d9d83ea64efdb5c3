//! CommandRunner port - 外部コマンド実行の抽象化
//!
//! 本番は `impls::process_runner::TokioCommandRunner`、テストでは台本どおりに
//! 行を流す偽物を使う。

use async_trait::async_trait;

use crate::domain::VigilError;

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Callback invoked once per output line, stdout and stderr interleaved in
/// the order they were produced.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// CommandRunner はサブプロセスを起動して出力を集める
///
/// # 契約
/// - stdout と stderr は並行に読む（片方が詰まって止まらないように）
/// - 起動失敗は `ExecutionFailed`
/// - 戻り値の future を drop したらプロセスも終わらせる（タイムアウトはこれで実現）
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        on_line: LineSink<'_>,
    ) -> Result<CommandOutput, VigilError>;
}
