//! Redis 流经纪人实现
//! Redis stream broker implementation
//!
//! 基于 Redis Streams：`XADD` 发布，`XGROUP` 建组（自最早偏移），
//! `XREADGROUP` 轮询，`XACK` 手动提交。
//! Backed by Redis Streams: `XADD` to publish, `XGROUP` to create groups
//! (from the earliest offset), `XREADGROUP` to poll, `XACK` for the manual
//! commit.

use crate::error::{Error, Result};
use crate::message::{StreamHeaders, HEADER_COUNT_OF_RETRY, HEADER_GROUP_ID};
use crate::redis::RedisHandle;
use crate::retry::PublishRetryPolicy;
use crate::stream::{StreamBroker, StreamRecord, StreamSubscription};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use uuid::Uuid;

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";

fn topic_key(topic: &str) -> String {
  format!("relayq:s:{topic}")
}

/// Redis 流经纪人
/// Redis stream broker
#[derive(Clone)]
pub struct RedisStreamBroker {
  handle: RedisHandle,
  policy: PublishRetryPolicy,
}

impl RedisStreamBroker {
  /// 创建新的 Redis 流经纪人
  /// Create a new redis stream broker
  pub fn new(handle: RedisHandle) -> Self {
    Self {
      handle,
      policy: PublishRetryPolicy::default(),
    }
  }

  /// 使用给定的发布重试策略
  /// Use the given publish retry policy
  pub fn with_policy(mut self, policy: PublishRetryPolicy) -> Self {
    self.policy = policy;
    self
  }
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
  async fn publish(
    &self,
    topic: &str,
    key: &str,
    payload: &str,
    headers: &StreamHeaders,
  ) -> Result<()> {
    let handle = self.handle.clone();
    let topic = topic_key(topic);
    let key = key.to_string();
    let payload = payload.to_string();
    let headers = headers.clone();

    self
      .policy
      .execute(move || {
        let handle = handle.clone();
        let topic = topic.clone();
        let key = key.clone();
        let payload = payload.clone();
        let headers = headers.clone();
        async move {
          let mut conn = handle.connection().await?;
          let _: String = redis::cmd("XADD")
            .arg(&topic)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(&key)
            .arg(FIELD_PAYLOAD)
            .arg(&payload)
            .arg(HEADER_GROUP_ID)
            .arg(&headers.group_id)
            .arg(HEADER_COUNT_OF_RETRY)
            .arg(headers.count_of_retry.to_string())
            .query_async(&mut conn)
            .await?;
          Ok(())
        }
      })
      .await
  }

  async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn StreamSubscription>> {
    let mut conn = self.handle.connection().await?;
    // earliest offset; the group may already exist
    let created: std::result::Result<String, redis::RedisError> = redis::cmd("XGROUP")
      .arg("CREATE")
      .arg(topic_key(topic))
      .arg(group)
      .arg("0")
      .arg("MKSTREAM")
      .query_async(&mut conn)
      .await;
    if let Err(e) = created {
      if !e.to_string().contains("BUSYGROUP") {
        return Err(Error::Redis(e));
      }
    }

    Ok(Box::new(RedisStreamSubscription {
      handle: self.handle.clone(),
      topic: topic.to_string(),
      group: group.to_string(),
      consumer: Uuid::new_v4().to_string(),
    }))
  }
}

/// Redis 流订阅
/// Redis stream subscription
///
/// 轮询先读本消费者的未确认条目再读新条目；消费者消失后遗留的未确认
/// 条目由运维通过 `XAUTOCLAIM` 回收。
/// A poll reads this consumer's unacknowledged entries before new ones;
/// entries left behind by a vanished consumer are reclaimed operationally via
/// `XAUTOCLAIM`.
pub struct RedisStreamSubscription {
  handle: RedisHandle,
  topic: String,
  group: String,
  consumer: String,
}

impl RedisStreamSubscription {
  async fn read(&self, id: &str) -> Result<Option<StreamRecord>> {
    let mut conn = self.handle.connection().await?;
    let options = StreamReadOptions::default()
      .group(&self.group, &self.consumer)
      .count(1);
    let reply: StreamReadReply = conn
      .xread_options(&[topic_key(&self.topic)], &[id], &options)
      .await?;

    for stream_key in reply.keys {
      for entry in stream_key.ids {
        let key: String = entry.get(FIELD_KEY).unwrap_or_default();
        let payload: String = entry.get(FIELD_PAYLOAD).unwrap_or_default();
        let group_id: String = entry.get(HEADER_GROUP_ID).unwrap_or_default();
        let count_of_retry: String = entry.get(HEADER_COUNT_OF_RETRY).unwrap_or_default();
        return Ok(Some(StreamRecord {
          topic: self.topic.clone(),
          key,
          payload,
          headers: StreamHeaders {
            group_id,
            count_of_retry: count_of_retry.parse().unwrap_or(0),
          },
          offset: entry.id,
        }));
      }
    }
    Ok(None)
  }
}

#[async_trait]
impl StreamSubscription for RedisStreamSubscription {
  async fn poll(&mut self) -> Result<Option<StreamRecord>> {
    // pending (delivered, unacknowledged) entries first
    if let Some(record) = self.read("0").await? {
      return Ok(Some(record));
    }
    self.read(">").await
  }

  async fn commit(&mut self, record: &StreamRecord) -> Result<()> {
    let mut conn = self.handle.connection().await?;
    let _: i64 = redis::cmd("XACK")
      .arg(topic_key(&self.topic))
      .arg(&self.group)
      .arg(&record.offset)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }
}
