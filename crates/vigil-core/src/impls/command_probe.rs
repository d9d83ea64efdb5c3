//! Engine probe that asks the engine binary for its version.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{EngineVersion, VigilError};
use crate::ports::{CommandRunner, EngineProbe};

/// Runs `<engine> version --format json` and parses the answer.
pub struct CommandProbe {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl CommandProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

#[async_trait]
impl EngineProbe for CommandProbe {
    async fn probe(&self) -> Result<EngineVersion, VigilError> {
        let args = ["version", "--format", "json"].map(String::from);
        let output = self.runner.run(&self.program, &args, &|_: &str| {}).await?;
        if !output.success() {
            return Err(VigilError::ExecutionFailed(format!(
                "{} version exited with {:?}: {}",
                self.program,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use crate::testing::Script;

    #[tokio::test]
    async fn parses_version_json() {
        let runner = ScriptedRunner::new(vec![Script::succeed(
            r#"{"Version":"0.49.0","VulnerabilityDB":{"Version":2}}"#,
        )]);
        let probe = CommandProbe::new(Arc::new(runner.clone()), "trivy");

        let version = probe.probe().await.unwrap();
        assert_eq!(version.version, "0.49.0");
        assert_eq!(version.vulnerability_db.unwrap().version, 2);

        let calls = runner.calls();
        assert_eq!(calls[0].0, "trivy");
        assert_eq!(calls[0].1, vec!["version", "--format", "json"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let runner = ScriptedRunner::new(vec![Script::exit(1, "boom")]);
        let probe = CommandProbe::new(Arc::new(runner), "trivy");
        let err = probe.probe().await.unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::ExecutionFailed);
    }
}
