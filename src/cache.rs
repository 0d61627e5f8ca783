//! 缓存后端模块
//! Cache backend module
//!
//! 分布式锁与处理器声明的缓存失效共用这两个原语。
//! The distributed lock and the handler-declared cache invalidation share
//! these two primitives.

use crate::error::Result;
use crate::redis::RedisHandle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 缓存后端
/// Cache backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
  /// 仅当键不存在时写入；写入成功返回 `true`
  /// Set only if the key does not exist; returns `true` on a successful set
  async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool>;

  /// 删除键；键不存在也算成功
  /// Delete a key; a missing key still succeeds
  async fn delete(&self, key: &str) -> Result<()>;
}

/// 内存缓存后端
/// Memory cache backend
#[derive(Clone, Default)]
pub struct MemoryCache {
  entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCache {
  /// 创建新的内存缓存
  /// Create a new memory cache
  pub fn new() -> Self {
    Self::default()
  }

  /// 键是否存在
  /// Whether a key exists
  pub fn contains(&self, key: &str) -> bool {
    self
      .entries
      .lock()
      .expect("cache entries poisoned")
      .contains_key(key)
  }

  /// 直接写入一个键
  /// Directly set a key
  pub fn put<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
    self
      .entries
      .lock()
      .expect("cache entries poisoned")
      .insert(key.into(), value.into());
  }
}

#[async_trait]
impl CacheBackend for MemoryCache {
  async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool> {
    let mut entries = self.entries.lock().expect("cache entries poisoned");
    if entries.contains_key(key) {
      return Ok(false);
    }
    entries.insert(key.to_string(), value.to_string());
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<()> {
    self
      .entries
      .lock()
      .expect("cache entries poisoned")
      .remove(key);
    Ok(())
  }
}

/// Redis 缓存后端
/// Redis cache backend
#[derive(Clone)]
pub struct RedisCache {
  handle: RedisHandle,
}

impl RedisCache {
  /// 创建新的 Redis 缓存
  /// Create a new redis cache
  pub fn new(handle: RedisHandle) -> Self {
    Self { handle }
  }
}

#[async_trait]
impl CacheBackend for RedisCache {
  async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool> {
    let mut conn = self.handle.connection().await?;
    let reply: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("NX")
      .query_async(&mut conn)
      .await?;
    Ok(reply.is_some())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let mut conn = self.handle.connection().await?;
    let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_if_not_exists_is_exclusive() {
    let cache = MemoryCache::new();
    assert!(cache.set_if_not_exists("k", "a").await.unwrap());
    assert!(!cache.set_if_not_exists("k", "b").await.unwrap());
  }

  #[tokio::test]
  async fn test_delete_is_idempotent() {
    let cache = MemoryCache::new();
    cache.put("k", "v");
    cache.delete("k").await.unwrap();
    assert!(!cache.contains("k"));
    // deleting again still succeeds
    cache.delete("k").await.unwrap();
  }
}
