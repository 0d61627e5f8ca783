//! 内存流经纪人实现
//! Memory stream broker implementation
//!
//! 主题是追加日志，消费组是各自独立的已提交偏移；一个组内按单消费者
//! 投递。
//! Topics are append-only logs and consumer groups are independent committed
//! offsets; delivery within a group is single-consumer.

use crate::error::Result;
use crate::message::StreamHeaders;
use crate::retry::PublishRetryPolicy;
use crate::stream::{StreamBroker, StreamRecord, StreamSubscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 日志中的一条记录
/// One record of the log
#[derive(Clone)]
struct StoredRecord {
  key: String,
  payload: String,
  headers: StreamHeaders,
}

/// 共享的流状态
/// Shared stream state
#[derive(Default)]
struct MemoryStreamState {
  topics: HashMap<String, Vec<StoredRecord>>,
  /// `(topic, group)` → 下一条未提交记录的索引
  /// `(topic, group)` → index of the next uncommitted record
  committed: HashMap<(String, String), usize>,
}

/// 内存流经纪人
/// Memory stream broker
#[derive(Clone)]
pub struct MemoryStreamBroker {
  state: Arc<Mutex<MemoryStreamState>>,
  policy: PublishRetryPolicy,
}

impl Default for MemoryStreamBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStreamBroker {
  /// 创建新的内存流经纪人
  /// Create a new memory stream broker
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(MemoryStreamState::default())),
      policy: PublishRetryPolicy::default(),
    }
  }

  /// 使用给定的发布重试策略
  /// Use the given publish retry policy
  pub fn with_policy(mut self, policy: PublishRetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// 主题日志的长度
  /// Length of a topic log
  pub fn topic_len(&self, topic: &str) -> usize {
    let state = self.state.lock().expect("stream state poisoned");
    state.topics.get(topic).map(|log| log.len()).unwrap_or(0)
  }

  /// 主题中各记录的 `CountOfRetry` 序列
  /// The `CountOfRetry` sequence of a topic's records
  pub fn retry_counts(&self, topic: &str) -> Vec<i32> {
    let state = self.state.lock().expect("stream state poisoned");
    state
      .topics
      .get(topic)
      .map(|log| log.iter().map(|r| r.headers.count_of_retry).collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl StreamBroker for MemoryStreamBroker {
  async fn publish(
    &self,
    topic: &str,
    key: &str,
    payload: &str,
    headers: &StreamHeaders,
  ) -> Result<()> {
    let state = self.state.clone();
    let record = StoredRecord {
      key: key.to_string(),
      payload: payload.to_string(),
      headers: headers.clone(),
    };
    let topic = topic.to_string();
    self
      .policy
      .execute(move || {
        let state = state.clone();
        let record = record.clone();
        let topic = topic.clone();
        async move {
          let mut state = state.lock().expect("stream state poisoned");
          state.topics.entry(topic).or_default().push(record);
          Ok(())
        }
      })
      .await
  }

  async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn StreamSubscription>> {
    {
      let mut state = self.state.lock().expect("stream state poisoned");
      // earliest offset for a new group
      state
        .committed
        .entry((topic.to_string(), group.to_string()))
        .or_insert(0);
    }
    Ok(Box::new(MemoryStreamSubscription {
      state: self.state.clone(),
      topic: topic.to_string(),
      group: group.to_string(),
    }))
  }
}

/// 内存流订阅
/// Memory stream subscription
pub struct MemoryStreamSubscription {
  state: Arc<Mutex<MemoryStreamState>>,
  topic: String,
  group: String,
}

#[async_trait]
impl StreamSubscription for MemoryStreamSubscription {
  async fn poll(&mut self) -> Result<Option<StreamRecord>> {
    let state = self.state.lock().expect("stream state poisoned");
    let position = state
      .committed
      .get(&(self.topic.clone(), self.group.clone()))
      .copied()
      .unwrap_or(0);
    let record = state
      .topics
      .get(&self.topic)
      .and_then(|log| log.get(position));
    Ok(record.map(|r| StreamRecord {
      topic: self.topic.clone(),
      key: r.key.clone(),
      payload: r.payload.clone(),
      headers: r.headers.clone(),
      offset: position.to_string(),
    }))
  }

  async fn commit(&mut self, record: &StreamRecord) -> Result<()> {
    let offset: usize = record
      .offset
      .parse()
      .map_err(|_| crate::error::Error::broker(format!("bad offset token: {}", record.offset)))?;
    let mut state = self.state.lock().expect("stream state poisoned");
    let committed = state
      .committed
      .entry((self.topic.clone(), self.group.clone()))
      .or_insert(0);
    // monotonic, re-committing an older record is a no-op
    *committed = (*committed).max(offset + 1);
    Ok(())
  }
}
