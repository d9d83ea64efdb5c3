//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::TaskId;
use crate::ports::Clock;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use ulid::{Generator, Ulid};

/// IdGenerator はタスク ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（スケジューラから共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成する。同じミリ秒内では
/// 単調増加するので、ID 順と生成順が一致する。
pub struct UlidGenerator<C> {
    clock: C,
    generator: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let millis = self.clock.now().timestamp_millis().max(0) as u64;
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(millis);
        let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
        // 同一ミリ秒でランダム部が溢れた場合のみ失敗する
        let ulid = generator
            .generate_from_datetime(at)
            .unwrap_or_else(|_| Ulid::from_parts(millis, rand::random()));
        TaskId::from(ulid)
    }
}
