//! 内存队列经纪人实现
//! Memory queue broker implementation
//!
//! 使用内存数据结构实现交换机路由与确认语义，不依赖任何外部服务。
//! Implements exchange routing and acknowledgement semantics with in-memory
//! data structures, without any external service dependencies.

use crate::config::QosRecord;
use crate::error::{Error, Result};
use crate::message::bump_x_death;
use crate::queue::{
  ExchangeKind, QueueBroker, QueueDelivery, QueuePublishRequest, QueueSubscription,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// 入队的消息
/// A queued message
#[derive(Debug, Clone)]
struct StoredMessage {
  body: String,
  headers: HashMap<String, String>,
}

/// 单个队列的状态
/// State of a single queue
#[derive(Default)]
struct QueueState {
  ready: VecDeque<StoredMessage>,
  in_flight: HashMap<u64, StoredMessage>,
  dead_letter: Option<String>,
}

/// 一条绑定
/// One binding
struct BindingRow {
  queue: String,
  route: String,
}

/// 交换机状态
/// Exchange state
struct ExchangeState {
  kind: ExchangeKind,
  bindings: Vec<BindingRow>,
}

/// 共享的经纪人状态
/// Shared broker state
#[derive(Default)]
struct MemoryQueueState {
  exchanges: HashMap<String, ExchangeState>,
  queues: HashMap<String, QueueState>,
  next_tag: u64,
}

impl MemoryQueueState {
  fn queue_mut(&mut self, queue: &str) -> &mut QueueState {
    self.queues.entry(queue.to_string()).or_default()
  }

  fn enqueue(&mut self, queue: &str, message: StoredMessage) {
    self.queue_mut(queue).ready.push_back(message);
  }
}

/// 内存队列经纪人
/// Memory queue broker
#[derive(Clone, Default)]
pub struct MemoryQueueBroker {
  state: Arc<Mutex<MemoryQueueState>>,
}

impl MemoryQueueBroker {
  /// 创建新的内存队列经纪人
  /// Create a new memory queue broker
  pub fn new() -> Self {
    Self::default()
  }

  /// 队列中就绪消息的数量
  /// Number of ready messages in a queue
  pub fn ready_len(&self, queue: &str) -> usize {
    let state = self.state.lock().expect("queue state poisoned");
    state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
  }

  /// 读取某个队列就绪消息体的快照
  /// Snapshot of the ready message bodies of a queue
  pub fn ready_bodies(&self, queue: &str) -> Vec<String> {
    let state = self.state.lock().expect("queue state poisoned");
    state
      .queues
      .get(queue)
      .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl QueueBroker for MemoryQueueBroker {
  async fn declare_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<()> {
    let mut state = self.state.lock().expect("queue state poisoned");
    let q = state.queue_mut(queue);
    q.dead_letter = dead_letter.map(|d| d.to_string());
    Ok(())
  }

  async fn bind(&self, exchange: &str, kind: ExchangeKind, queue: &str, route: &str) -> Result<()> {
    if kind == ExchangeKind::Default {
      return Err(Error::config("Default mode has no exchange to bind"));
    }
    let mut state = self.state.lock().expect("queue state poisoned");
    state.queue_mut(queue);
    let entry = state
      .exchanges
      .entry(exchange.to_string())
      .or_insert_with(|| ExchangeState {
        kind,
        bindings: Vec::new(),
      });
    if entry.kind != kind {
      return Err(Error::config(format!(
        "exchange {exchange} already declared with a different kind"
      )));
    }
    entry.bindings.push(BindingRow {
      queue: queue.to_string(),
      route: route.to_string(),
    });
    Ok(())
  }

  async fn publish(&self, request: QueuePublishRequest) -> Result<()> {
    let message = StoredMessage {
      body: request.message,
      headers: request.headers,
    };
    let mut state = self.state.lock().expect("queue state poisoned");

    match request.kind {
      ExchangeKind::Default => {
        if request.queue.is_empty() {
          return Err(Error::config("Default mode publish without a queue"));
        }
        state.enqueue(&request.queue, message);
      }
      ExchangeKind::Direct | ExchangeKind::FanOut => {
        let targets: Vec<String> = {
          let exchange = state
            .exchanges
            .get(&request.exchange)
            .ok_or_else(|| Error::broker(format!("unknown exchange: {}", request.exchange)))?;
          exchange
            .bindings
            .iter()
            .filter(|b| request.kind == ExchangeKind::FanOut || b.route == request.route)
            .map(|b| b.queue.clone())
            .collect()
        };
        // unroutable messages are dropped, matching broker defaults
        for queue in targets {
          state.enqueue(&queue, message.clone());
        }
      }
    }
    Ok(())
  }

  async fn subscribe(&self, queue: &str, qos: &QosRecord) -> Result<Box<dyn QueueSubscription>> {
    {
      let mut state = self.state.lock().expect("queue state poisoned");
      state.queue_mut(queue);
    }
    Ok(Box::new(MemoryQueueSubscription {
      state: self.state.clone(),
      queue: queue.to_string(),
      prefetch_count: qos.prefetch_count.max(1) as usize,
    }))
  }
}

/// 内存队列订阅
/// Memory queue subscription
pub struct MemoryQueueSubscription {
  state: Arc<Mutex<MemoryQueueState>>,
  queue: String,
  prefetch_count: usize,
}

#[async_trait]
impl QueueSubscription for MemoryQueueSubscription {
  async fn next(&mut self) -> Result<Option<QueueDelivery>> {
    let mut state = self.state.lock().expect("queue state poisoned");
    let tag = state.next_tag + 1;
    let q = state.queue_mut(&self.queue);

    // the prefetch window bounds unacknowledged deliveries
    if q.in_flight.len() >= self.prefetch_count {
      return Ok(None);
    }
    let Some(message) = q.ready.pop_front() else {
      return Ok(None);
    };
    let delivery = QueueDelivery {
      queue: self.queue.clone(),
      body: message.body.clone(),
      headers: message.headers.clone(),
      delivery_tag: tag,
    };
    q.in_flight.insert(tag, message);
    state.next_tag = tag;
    Ok(Some(delivery))
  }

  async fn ack(&mut self, delivery: &QueueDelivery) -> Result<()> {
    let mut state = self.state.lock().expect("queue state poisoned");
    let q = state.queue_mut(&self.queue);
    q.in_flight
      .remove(&delivery.delivery_tag)
      .ok_or_else(|| Error::broker(format!("unknown delivery tag: {}", delivery.delivery_tag)))?;
    Ok(())
  }

  async fn nack(&mut self, delivery: &QueueDelivery) -> Result<()> {
    let mut state = self.state.lock().expect("queue state poisoned");
    let q = state.queue_mut(&self.queue);
    let Some(mut message) = q.in_flight.remove(&delivery.delivery_tag) else {
      return Err(Error::broker(format!(
        "unknown delivery tag: {}",
        delivery.delivery_tag
      )));
    };
    let dead_letter = q.dead_letter.clone();

    match dead_letter {
      Some(target) => {
        bump_x_death(&mut message.headers, &self.queue);
        state.enqueue(&target, message);
      }
      // without a dead-letter target the message is discarded
      None => tracing::warn!(queue = %self.queue, "nack without dead-letter target, dropping"),
    }
    Ok(())
  }
}

impl Drop for MemoryQueueSubscription {
  fn drop(&mut self) {
    // abandoned in-flight deliveries return to the queue for redelivery
    if let Ok(mut state) = self.state.lock() {
      let q = state.queue_mut(&self.queue);
      let tags: Vec<u64> = q.in_flight.keys().copied().collect();
      for tag in tags {
        if let Some(message) = q.in_flight.remove(&tag) {
          q.ready.push_front(message);
        }
      }
    }
  }
}
