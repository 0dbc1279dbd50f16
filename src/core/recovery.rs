//! 错误恢复引擎
//!
//! 根据 CoreError 类型返回 RecoveryAction：ServiceUnavailable 指数退避重试（次数有限），
//! 其余错误立即上报，不用同样的输入重试。

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySection;
use crate::core::{CoreError, RecoveryAction};

/// 退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 attempt 次失败之后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 用满所有重试的最长耗时：每次调用都等到 per_attempt，再加上各次退避
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        (1..attempts).fold(per_attempt.saturating_mul(attempts), |total, attempt| {
            total.saturating_add(self.delay_for(attempt))
        })
    }

    /// 不重试（测试与一次性调用）
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempt 为已经失败的次数
    pub fn handle(&self, err: &CoreError, attempt: u32) -> RecoveryAction {
        match err {
            CoreError::ServiceUnavailable(_) if attempt < self.policy.max_attempts => {
                RecoveryAction::RetryAfter(self.policy.delay_for(attempt))
            }
            CoreError::ServiceUnavailable(msg) => RecoveryAction::Surface(format!(
                "The AI service is unavailable ({msg}). Please try again later."
            )),
            CoreError::MalformedPlan(_) | CoreError::MalformedResponse(_) => {
                RecoveryAction::Surface(format!("The AI service returned unusable output: {err}"))
            }
            CoreError::Cancelled(_) => RecoveryAction::Abort,
            _ => RecoveryAction::Surface(err.to_string()),
        }
    }

    /// 按策略执行 op：瞬时错误退避后重试，其他错误原样返回
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    match self.handle(&err, attempt) {
                        RecoveryAction::RetryAfter(delay) => {
                            tracing::warn!(
                                operation,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "transient failure, retrying: {}",
                                err
                            );
                            tokio::time::sleep(delay).await;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }
}
