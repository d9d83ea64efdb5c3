//! EngineProbe port - スキャンエンジンのバージョン取得

use async_trait::async_trait;

use crate::domain::{EngineVersion, VigilError};

/// Reports the engine's version and database metadata.
///
/// Failures are never fatal to a scan; the caller logs them and moves on.
#[async_trait]
pub trait EngineProbe: Send + Sync {
    async fn probe(&self) -> Result<EngineVersion, VigilError>;
}

/// Probe that never reports anything. Used when probing is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProbe;

#[async_trait]
impl EngineProbe for DisabledProbe {
    async fn probe(&self) -> Result<EngineVersion, VigilError> {
        Err(VigilError::ExecutionFailed("engine probe disabled".into()))
    }
}
