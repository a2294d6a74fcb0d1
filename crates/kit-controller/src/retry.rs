//! 失败重试退避
//!
//! 按对象记录连续失败次数。可重试错误按有界指数退避计算下一次协调的延迟，
//! 不可重试的错误只能等待用户修改对象，按上限间隔重试且不增加计数。
//! 协调成功（包括显式 requeue）后清空计数。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use kit_common::config::BackoffConfig;
use kit_common::Error;

use crate::store::ObjectKey;

/// 按对象计数的退避器
pub struct RetryBackoff {
    config: BackoffConfig,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl RetryBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures_mut(&self) -> MutexGuard<'_, HashMap<ObjectKey, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 记录一次失败，返回下一次协调前的等待时间
    pub fn on_error(&self, key: &ObjectKey, error: &Error) -> Duration {
        if !error.is_retryable() {
            return self.config.max_delay();
        }
        let attempt = {
            let mut failures = self.failures_mut();
            let count = failures.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        let delay = self
            .config
            .delay_for_attempt(attempt, rand::random::<f64>());
        trace!(%key, attempt, ?delay, "失败后退避");
        delay
    }

    pub fn on_success(&self, key: &ObjectKey) {
        self.failures_mut().remove(key);
    }

    /// 连续失败次数
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures_mut().get(key).copied().unwrap_or(0)
    }
}
