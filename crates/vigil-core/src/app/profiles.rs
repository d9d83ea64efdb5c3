//! ProfileService - 保存済みスキャン設定の操作
//!
//! 名前の検証とポリシーはここで適用し、ストアには検証済みの値だけを渡す。
//! 変更系の操作はひとつの Mutex で直列化する（件数チェックと保存の間に割り込ませない）。

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::{ConfigProfile, Owner, VigilError, validate_profile_name};
use crate::ports::ProfileStore;

pub const DEFAULT_PROFILE_MAX_SIZE: usize = 4096;
pub const DEFAULT_PROFILE_MAX_COUNT: usize = 1000;

/// Limits applied when saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilePolicy {
    /// When false, passwords are stripped on save and on read.
    pub allow_password: bool,
    /// Size of the stored JSON, in bytes.
    pub max_size: usize,
    /// Profiles per owner.
    pub max_count: usize,
}

impl Default for ProfilePolicy {
    fn default() -> Self {
        Self {
            allow_password: false,
            max_size: DEFAULT_PROFILE_MAX_SIZE,
            max_count: DEFAULT_PROFILE_MAX_COUNT,
        }
    }
}

pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
    policy: ProfilePolicy,
    writes: Mutex<()>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn ProfileStore>, policy: ProfilePolicy) -> Self {
        Self {
            store,
            policy,
            writes: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> ProfilePolicy {
        self.policy
    }

    pub async fn list(&self, owner: &Owner) -> Result<Vec<String>, VigilError> {
        self.store.list(owner).await
    }

    pub async fn get(&self, owner: &Owner, name: &str) -> Result<ConfigProfile, VigilError> {
        validate_profile_name(name)?;
        let mut profile = self
            .store
            .get(owner, name)
            .await?
            .ok_or_else(|| VigilError::ProfileNotFound(name.to_string()))?;
        if !self.policy.allow_password {
            profile.password = None;
        }
        Ok(profile)
    }

    /// Create or replace `name`, then mark it as last used.
    ///
    /// Returns what was stored, which differs from `profile` when the
    /// password was dropped.
    pub async fn save(
        &self,
        owner: &Owner,
        name: &str,
        mut profile: ConfigProfile,
    ) -> Result<ConfigProfile, VigilError> {
        validate_profile_name(name)?;
        if !self.policy.allow_password && profile.password.take().is_some() {
            tracing::info!(owner = %owner.as_str(), profile = name, "password dropped from saved profile");
        }
        let size = serde_json::to_vec_pretty(&profile)?.len();
        if size > self.policy.max_size {
            return Err(VigilError::InvalidInput(format!(
                "profile is {size} bytes, the limit is {} bytes",
                self.policy.max_size
            )));
        }

        let _guard = self.writes.lock().await;
        if self.store.get(owner, name).await?.is_none() {
            let count = self.store.list(owner).await?.len();
            if count >= self.policy.max_count {
                return Err(VigilError::InvalidInput(format!(
                    "profile limit of {} reached",
                    self.policy.max_count
                )));
            }
        }
        self.store.save(owner, name, &profile).await?;
        if let Err(e) = self.store.set_last_used(owner, Some(name)).await {
            tracing::warn!(owner = %owner.as_str(), profile = name, error = %e, "could not record last used profile");
        }
        tracing::info!(owner = %owner.as_str(), profile = name, size, "profile saved");
        Ok(profile)
    }

    /// Deleting a missing profile is not an error.
    pub async fn delete(&self, owner: &Owner, name: &str) -> Result<(), VigilError> {
        validate_profile_name(name)?;
        let _guard = self.writes.lock().await;
        if !self.store.delete(owner, name).await? {
            return Ok(());
        }
        if self.store.last_used(owner).await?.as_deref() == Some(name) {
            self.store.set_last_used(owner, None).await?;
        }
        tracing::info!(owner = %owner.as_str(), profile = name, "profile deleted");
        Ok(())
    }

    pub async fn last_used(&self, owner: &Owner) -> Result<Option<String>, VigilError> {
        self.store.last_used(owner).await
    }

    pub async fn set_last_used(&self, owner: &Owner, name: &str) -> Result<(), VigilError> {
        validate_profile_name(name)?;
        let _guard = self.writes.lock().await;
        self.store.set_last_used(owner, Some(name)).await
    }
}
