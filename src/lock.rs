//! 分布式锁模块
//! Distributed lock module
//!
//! 发件箱发布器专用的集群级互斥：键 `LockEventId-{event_id}` 通过缓存的
//! "不存在才写入" 原语获得，由调用方释放。不是通用的临界区原语，调用方
//! 必须容忍丢失的锁。
//! The cluster-wide mutex used only by the outbox publisher: the key
//! `LockEventId-{event_id}` is acquired through the cache's
//! set-if-not-exists primitive and released by the caller. Not a general
//! critical-section primitive; callers must tolerate lost locks.

use crate::cache::CacheBackend;
use crate::error::Result;
use std::sync::Arc;

/// 事件锁键
/// Event lock key
pub fn event_lock_key(event_id: &str) -> String {
  format!("LockEventId-{event_id}")
}

/// 分布式锁
/// Distributed lock
#[derive(Clone)]
pub struct DistributedLock {
  cache: Arc<dyn CacheBackend>,
}

impl DistributedLock {
  /// 创建新的分布式锁
  /// Create a new distributed lock
  pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
    Self { cache }
  }

  /// 尝试获取某个事件的锁；同一时刻每个事件至多一个持有者
  /// Try to acquire the lock of one event; at most one holder per event at a
  /// time
  pub async fn acquire(&self, event_id: &str) -> Result<bool> {
    self
      .cache
      .set_if_not_exists(&event_lock_key(event_id), event_id)
      .await
  }

  /// 释放某个事件的锁；幂等
  /// Release the lock of one event; idempotent
  pub async fn release(&self, event_id: &str) -> Result<()> {
    self.cache.delete(&event_lock_key(event_id)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryCache;

  #[tokio::test]
  async fn test_single_holder_per_event() {
    let lock = DistributedLock::new(Arc::new(MemoryCache::new()));

    assert!(lock.acquire("e1").await.unwrap());
    assert!(!lock.acquire("e1").await.unwrap());
    // a different event is independent
    assert!(lock.acquire("e2").await.unwrap());

    lock.release("e1").await.unwrap();
    assert!(lock.acquire("e1").await.unwrap());
  }

  #[tokio::test]
  async fn test_release_is_idempotent() {
    let lock = DistributedLock::new(Arc::new(MemoryCache::new()));
    lock.release("never-held").await.unwrap();
  }
}
