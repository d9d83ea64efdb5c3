//! ProfileStore port - 所有者ごとの保存済みスキャン設定
//!
//! # 実装
//! - `impls::file_profile_store::FileProfileStore`: 1 設定 1 ファイル

use async_trait::async_trait;

use crate::domain::{ConfigProfile, Owner, VigilError};

/// ProfileStore は名前付きの設定と「最後に使った設定」を保持する
///
/// 名前の検証とポリシー（パスワード、サイズ、件数）は呼び出し側が行う。
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Profile names of `owner`, sorted.
    async fn list(&self, owner: &Owner) -> Result<Vec<String>, VigilError>;

    async fn get(&self, owner: &Owner, name: &str) -> Result<Option<ConfigProfile>, VigilError>;

    /// Create or replace.
    async fn save(&self, owner: &Owner, name: &str, profile: &ConfigProfile)
    -> Result<(), VigilError>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, owner: &Owner, name: &str) -> Result<bool, VigilError>;

    async fn last_used(&self, owner: &Owner) -> Result<Option<String>, VigilError>;

    /// `None` clears the marker.
    async fn set_last_used(&self, owner: &Owner, name: Option<&str>) -> Result<(), VigilError>;
}
