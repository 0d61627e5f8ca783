//! Redis 配置和连接管理模块
//! Redis configuration and connection management module
//!
//! 缓存后端、分布式锁与两种传输后端共用这里的客户端句柄。
//! The cache backend, the distributed lock and both transport backends share
//! the client handle defined here.

use crate::error::Result;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// Redis 客户端句柄
/// Redis client handle
///
/// 进程内所有发布者与订阅者共享同一个句柄；多路复用连接克隆廉价，
/// 每个订阅自取一个连接。
/// All publishers and subscribers within a process share one handle; the
/// multiplexed connection is cheap to clone, each subscription takes its own.
#[derive(Clone)]
pub struct RedisHandle {
  client: Client,
}

impl RedisHandle {
  /// 从连接地址创建句柄
  /// Create a handle from a connection url
  pub fn new(url: &str) -> Result<Self> {
    let client = Client::open(url)?;
    Ok(Self { client })
  }

  /// 获取异步连接
  /// Get an asynchronous connection
  pub async fn connection(&self) -> Result<MultiplexedConnection> {
    let conn = self.client.get_multiplexed_async_connection().await?;
    Ok(conn)
  }
}

impl std::fmt::Debug for RedisHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RedisHandle").finish()
  }
}
