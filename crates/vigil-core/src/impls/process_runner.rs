//! Subprocess runner on top of `tokio::process`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::domain::VigilError;
use crate::ports::{CommandOutput, CommandRunner, LineSink};

/// Production `CommandRunner`.
///
/// The child is spawned with `kill_on_drop`, so dropping the future returned
/// by `run` (for example when a deadline fires) terminates the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Read `reader` line by line, forwarding each line and collecting all of
/// them. Invalid UTF-8 is replaced rather than ending the stream.
async fn pump<R>(reader: R, on_line: LineSink<'_>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        on_line(line);
        collected.push_str(line);
        collected.push('\n');
    }
    Ok(collected)
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        on_line: LineSink<'_>,
    ) -> Result<CommandOutput, VigilError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VigilError::ExecutionFailed(format!("failed to start {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VigilError::ExecutionFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| VigilError::ExecutionFailed("stderr not captured".into()))?;

        let (stdout, stderr) = tokio::join!(pump(stdout, on_line), pump(stderr, on_line));
        let status = child.wait().await?;

        Ok(CommandOutput {
            stdout: stdout?,
            stderr: stderr?,
            exit_code: status.code(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let seen = Mutex::new(Vec::new());
        let on_line = |line: &str| seen.lock().unwrap().push(line.to_string());

        let out = TokioCommandRunner
            .run("sh", &sh("echo one; echo two 1>&2; echo three; exit 3"), &on_line)
            .await
            .unwrap();

        assert_eq!(out.stdout, "one\nthree\n");
        assert_eq!(out.stderr, "two\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_failure() {
        let err = TokioCommandRunner
            .run("definitely-not-a-real-binary-vigil", &[], &|_: &str| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn dropping_the_future_stops_the_process() {
        let started = std::time::Instant::now();
        let res = tokio::time::timeout(
            Duration::from_millis(200),
            TokioCommandRunner.run("sh", &sh("sleep 30"), &|_: &str| {}),
        )
        .await;
        assert!(res.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
