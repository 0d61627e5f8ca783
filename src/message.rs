//! 消息模块
//! Message module
//!
//! 定义了发件箱行、收件箱标记与线上头部的编解码。
//! Defines the outbox row, the inbox marker and the wire header codecs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 流头部：重试归属的消费组
/// Stream header: consumer group owning a retry
pub const HEADER_GROUP_ID: &str = "GroupId";
/// 流头部：重试计数（ASCII 整数）
/// Stream header: retry counter (ASCII integer)
pub const HEADER_COUNT_OF_RETRY: &str = "CountOfRetry";
/// 队列头部：传输层注入的重入队历史
/// Queue header: transport-injected requeue history
pub const HEADER_X_DEATH: &str = "x-death";

/// 发件箱行的活动状态
/// Active state of an outbox row
///
/// 状态最多发生一次 Active → Inactive 的迁移，随后该行可删除；
/// 绝不反向迁移。
/// The state transitions at most once from Active → Inactive and the row is
/// then eligible for removal; never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveState {
  Active,
  Inactive,
}

/// 发件箱行
/// Outbox row
///
/// 与其代表的业务状态变更在同一个事务内插入（outbox 模式），
/// 由发件箱发布器迁移与删除。
/// Inserted inside the same transaction as the business state change it
/// represents (the outbox pattern); transitioned and removed by the outbox
/// publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  /// 全局唯一标识
  /// Globally unique id
  pub id: String,
  /// 逻辑事件名，即注册表中的绑定键
  /// Logical event name, the binding key into the registry
  pub event_type: String,
  /// 领域事件的序列化形式
  /// Serialized form of the domain event
  pub payload: String,
  /// 活动状态
  /// Active state
  pub state: ActiveState,
  /// 创建时间（UTC）
  /// Creation time (UTC)
  pub created_at: DateTime<Utc>,
  /// 最近更新时间（UTC）
  /// Last update time (UTC)
  pub updated_at: DateTime<Utc>,
}

impl Event {
  /// 创建新的活动状态发件箱行
  /// Create a new outbox row in the active state
  pub fn new<T: Into<String>, P: Into<String>>(event_type: T, payload: P) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4().to_string(),
      event_type: event_type.into(),
      payload: payload.into(),
      state: ActiveState::Active,
      created_at: now,
      updated_at: now,
    }
  }

  /// 迁移到非活动状态并刷新时间戳
  /// Transition to the inactive state and refresh the timestamp
  pub fn deactivate(&mut self) {
    self.state = ActiveState::Inactive;
    self.updated_at = Utc::now();
  }

  /// 是否仍处于活动状态
  /// Whether the row is still active
  pub fn is_active(&self) -> bool {
    self.state == ActiveState::Active
  }
}

/// 收件箱标记（幂等标记）
/// Inbox marker (idempotency marker)
///
/// `id` 在其表内唯一；存在即意味着该消息的处理器已经成功提交过。
/// `id` is unique within its table; presence means the handler for this
/// message has already committed successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerEvent {
  /// 等于入站消息的 id
  /// Equal to the inbound message id
  pub id: String,
  /// 消息类型名
  /// Message type name
  pub event_type: String,
  /// 本次提交时的重试计数
  /// Retry count at the time of this commit
  pub count_of_retry: i32,
  /// 创建时间（UTC）
  /// Creation time (UTC)
  pub created_at: DateTime<Utc>,
}

impl ConsumerEvent {
  /// 创建新的收件箱标记
  /// Create a new inbox marker
  pub fn new<I: Into<String>, T: Into<String>>(id: I, event_type: T, count_of_retry: i32) -> Self {
    Self {
      id: id.into(),
      event_type: event_type.into(),
      count_of_retry,
      created_at: Utc::now(),
    }
  }
}

/// 服务状态公告记录，进程启动时发布一次
/// Service status announcement record, published once per process start
///
/// 公告任务本身是外部协作者，这里只提供载荷类型。
/// The announcing job itself is an external collaborator; only the payload
/// type lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
  pub id: String,
  pub name: String,
  pub host: String,
  pub ip_address: String,
  pub port: u16,
  pub status: String,
}

/// 流记录头部
/// Stream record headers
///
/// 新发布使用 `GroupId=""`、`CountOfRetry="0"`；重试重发携带发起方的
/// `{service}-{topic}` 组名与递增后的计数。
/// A fresh publish carries `GroupId=""`, `CountOfRetry="0"`; a retry
/// republish carries the originator's `{service}-{topic}` group name and the
/// incremented counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeaders {
  pub group_id: String,
  pub count_of_retry: i32,
}

impl StreamHeaders {
  /// 新发布的头部
  /// Headers of a fresh publish
  pub fn fresh() -> Self {
    Self {
      group_id: String::new(),
      count_of_retry: 0,
    }
  }

  /// 重试重发的头部
  /// Headers of a retry republish
  pub fn retry<S: Into<String>>(group_id: S, count_of_retry: i32) -> Self {
    Self {
      group_id: group_id.into(),
      count_of_retry,
    }
  }

  /// 编码为头部映射
  /// Encode into a header map
  pub fn to_map(&self) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(HEADER_GROUP_ID.to_string(), self.group_id.clone());
    map.insert(
      HEADER_COUNT_OF_RETRY.to_string(),
      self.count_of_retry.to_string(),
    );
    map
  }

  /// 从头部映射解码；缺失的键按新发布处理
  /// Decode from a header map; missing keys read as a fresh publish
  pub fn from_map(map: &HashMap<String, String>) -> Self {
    let group_id = map.get(HEADER_GROUP_ID).cloned().unwrap_or_default();
    let count_of_retry = map
      .get(HEADER_COUNT_OF_RETRY)
      .and_then(|v| v.parse::<i32>().ok())
      .unwrap_or(0);
    Self {
      group_id,
      count_of_retry,
    }
  }
}

/// `x-death` 列表中的一条重入队记录
/// One requeue record of the `x-death` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XDeathRecord {
  /// 重入队次数，即消费侧读取的重试计数
  /// Requeue count, the retry counter read by the consumer side
  pub count: i64,
  /// 记录产生时所在的队列
  /// Queue the record was produced on
  pub queue: String,
  /// 进入死信路径的原因
  /// Reason for taking the dead-letter path
  pub reason: String,
}

/// 从队列头部读取重试计数（`x-death[0].count`）
/// Read the retry counter from queue headers (`x-death[0].count`)
pub fn queue_retry_count(headers: &HashMap<String, String>) -> i32 {
  headers
    .get(HEADER_X_DEATH)
    .and_then(|raw| serde_json::from_str::<Vec<XDeathRecord>>(raw).ok())
    .and_then(|records| records.first().map(|r| r.count as i32))
    .unwrap_or(0)
}

/// 递增队列头部中的重入队记录
/// Increment the requeue record in queue headers
///
/// 首条记录计数加一；没有历史时插入一条 `count = 1` 的记录。
/// Bumps the first record's count; inserts a `count = 1` record when there
/// is no history yet.
pub fn bump_x_death(headers: &mut HashMap<String, String>, queue: &str) {
  let mut records = headers
    .get(HEADER_X_DEATH)
    .and_then(|raw| serde_json::from_str::<Vec<XDeathRecord>>(raw).ok())
    .unwrap_or_default();

  match records.first_mut() {
    Some(record) => record.count += 1,
    None => records.push(XDeathRecord {
      count: 1,
      queue: queue.to_string(),
      reason: "rejected".to_string(),
    }),
  }

  if let Ok(raw) = serde_json::to_string(&records) {
    headers.insert(HEADER_X_DEATH.to_string(), raw);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_event_transitions_once() {
    let mut event = Event::new("OrderPlaced", r#"{"id":"o1"}"#);
    assert!(event.is_active());
    let created = event.updated_at;

    event.deactivate();
    assert!(!event.is_active());
    assert!(event.updated_at >= created);
  }

  #[test]
  fn test_stream_headers_round_trip() {
    let fresh = StreamHeaders::fresh();
    assert_eq!(StreamHeaders::from_map(&fresh.to_map()), fresh);

    let retry = StreamHeaders::retry("orders-order-events", 3);
    let decoded = StreamHeaders::from_map(&retry.to_map());
    assert_eq!(decoded.group_id, "orders-order-events");
    assert_eq!(decoded.count_of_retry, 3);
  }

  #[test]
  fn test_stream_headers_missing_keys_read_fresh() {
    let map = HashMap::new();
    let decoded = StreamHeaders::from_map(&map);
    assert_eq!(decoded, StreamHeaders::fresh());
  }

  #[test]
  fn test_queue_retry_count_without_history() {
    let headers = HashMap::new();
    assert_eq!(queue_retry_count(&headers), 0);
  }

  #[test]
  fn test_bump_x_death_accumulates() {
    let mut headers = HashMap::new();

    bump_x_death(&mut headers, "orders-in");
    assert_eq!(queue_retry_count(&headers), 1);

    bump_x_death(&mut headers, "orders-in");
    bump_x_death(&mut headers, "orders-in");
    assert_eq!(queue_retry_count(&headers), 3);

    let records: Vec<XDeathRecord> =
      serde_json::from_str(headers.get(HEADER_X_DEATH).unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].queue, "orders-in");
  }
}
