//! 流传输模块
//! Stream transport module
//!
//! 定义了分区事件流方言：记录以类型名为键，值为序列化负载，头部恒有
//! `GroupId` 与 `CountOfRetry`；订阅按 `(service, topic)` 消费组进行，
//! 自最早偏移开始，手动提交。
//! Defines the partitioned event-stream dialect: records are keyed by type
//! name with the serialized payload as value and always carry the `GroupId`
//! and `CountOfRetry` headers; subscriptions run per `(service, topic)`
//! consumer group, start at the earliest offset and commit manually.

use crate::error::Result;
use crate::message::StreamHeaders;
use async_trait::async_trait;

pub mod memory;
pub mod redis;

/// 一条流记录
/// One stream record
#[derive(Debug, Clone)]
pub struct StreamRecord {
  /// 主题
  /// Topic
  pub topic: String,
  /// 键 = 消息类型名
  /// Key = message type name
  pub key: String,
  /// 值 = 序列化负载
  /// Value = serialized payload
  pub payload: String,
  /// 头部（`GroupId`、`CountOfRetry`）
  /// Headers (`GroupId`, `CountOfRetry`)
  pub headers: StreamHeaders,
  /// 偏移标识，提交时使用
  /// Offset token, used on commit
  pub offset: String,
}

/// 流经纪人
/// Stream broker
#[async_trait]
pub trait StreamBroker: Send + Sync {
  /// 发布一条记录
  /// Publish a record
  ///
  /// 实现内部套用有界重试策略；耗尽后以发布失败浮出水面。
  /// Implementations apply the bounded retry policy internally; exhaustion
  /// surfaces as a publish failure.
  async fn publish(
    &self,
    topic: &str,
    key: &str,
    payload: &str,
    headers: &StreamHeaders,
  ) -> Result<()>;

  /// 以消费组订阅一个主题（最早偏移，手动提交）
  /// Subscribe to a topic as a consumer group (earliest offset, manual commit)
  async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn StreamSubscription>>;
}

/// 一个流订阅
/// One stream subscription
#[async_trait]
pub trait StreamSubscription: Send {
  /// 取下一条记录；未提交的记录会在下次轮询再次出现
  /// Take the next record; an uncommitted record shows up again on the next
  /// poll
  async fn poll(&mut self) -> Result<Option<StreamRecord>>;

  /// 提交一条记录的偏移
  /// Commit a record's offset
  async fn commit(&mut self, record: &StreamRecord) -> Result<()>;
}
