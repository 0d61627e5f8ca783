//! 发布重试策略模块
//! Publish retry policy module
//!
//! 瞬时的经纪人故障在适配器内部按固定间隔重试，耗尽后才作为发布失败
//! 浮出水面。
//! Transient broker failures retry on a fixed interval inside the adapter and
//! only surface as a publish failure once exhausted.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// 固定间隔的有界重试策略
/// Bounded fixed-interval retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRetryPolicy {
  /// 总尝试次数
  /// Total number of attempts
  pub attempts: u32,
  /// 相邻尝试之间的固定间隔
  /// Fixed delay between attempts
  pub delay: Duration,
}

impl Default for PublishRetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 5,
      delay: Duration::from_secs(3),
    }
  }
}

impl PublishRetryPolicy {
  /// 创建新的重试策略
  /// Create a new retry policy
  pub fn new(attempts: u32, delay: Duration) -> Self {
    Self {
      attempts: attempts.max(1),
      delay,
    }
  }

  /// 执行一个操作直至成功或尝试耗尽
  /// Run an operation until it succeeds or attempts are exhausted
  pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut last_error = String::new();
    for attempt in 1..=self.attempts {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(e) => {
          tracing::warn!(attempt, error = %e, "publish attempt failed");
          last_error = e.to_string();
          if attempt < self.attempts {
            tokio::time::sleep(self.delay).await;
          }
        }
      }
    }
    Err(Error::PublishExhausted {
      attempts: self.attempts,
      message: last_error,
    })
  }
}
