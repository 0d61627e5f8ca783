//! Redis 队列经纪人实现
//! Redis queue broker implementation
//!
//! 队列为列表，交换机绑定为集合，处理中的投递停放在每个消费者的
//! processing 列表里，确认即从中移除。
//! Queues are lists, exchange bindings are sets, and in-flight deliveries
//! park in a per-consumer processing list from which an ack removes them.

use crate::config::QosRecord;
use crate::error::{Error, Result};
use crate::message::bump_x_death;
use crate::queue::{
  ExchangeKind, QueueBroker, QueueDelivery, QueuePublishRequest, QueueSubscription,
};
use crate::redis::RedisHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn queue_key(queue: &str) -> String {
  format!("relayq:q:{queue}")
}

fn dead_letter_key(queue: &str) -> String {
  format!("relayq:q:{queue}:dlq")
}

fn processing_key(queue: &str, consumer: &str) -> String {
  format!("relayq:q:{queue}:processing:{consumer}")
}

fn exchange_kind_key(exchange: &str) -> String {
  format!("relayq:ex:{exchange}:kind")
}

fn exchange_bindings_key(exchange: &str) -> String {
  format!("relayq:ex:{exchange}:bindings")
}

fn kind_tag(kind: ExchangeKind) -> &'static str {
  match kind {
    ExchangeKind::Direct => "direct",
    ExchangeKind::FanOut => "fanout",
    ExchangeKind::Default => "default",
  }
}

/// 线上存储的消息形态
/// Message shape stored on the wire
#[derive(Serialize, Deserialize)]
struct WireMessage {
  body: String,
  headers: HashMap<String, String>,
}

/// 集合中的一条绑定
/// One binding in the set
#[derive(Serialize, Deserialize)]
struct WireBinding {
  queue: String,
  route: String,
}

/// Redis 队列经纪人
/// Redis queue broker
#[derive(Clone)]
pub struct RedisQueueBroker {
  handle: RedisHandle,
}

impl RedisQueueBroker {
  /// 创建新的 Redis 队列经纪人
  /// Create a new redis queue broker
  pub fn new(handle: RedisHandle) -> Self {
    Self { handle }
  }

  async fn push(&self, queue: &str, message: &WireMessage) -> Result<()> {
    let raw = serde_json::to_string(message)?;
    let mut conn = self.handle.connection().await?;
    let _: i64 = redis::cmd("LPUSH")
      .arg(queue_key(queue))
      .arg(raw)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }
}

#[async_trait]
impl QueueBroker for RedisQueueBroker {
  async fn declare_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<()> {
    let mut conn = self.handle.connection().await?;
    match dead_letter {
      Some(target) => {
        let _: () = redis::cmd("SET")
          .arg(dead_letter_key(queue))
          .arg(target)
          .query_async(&mut conn)
          .await?;
      }
      None => {
        let _: i64 = redis::cmd("DEL")
          .arg(dead_letter_key(queue))
          .query_async(&mut conn)
          .await?;
      }
    }
    Ok(())
  }

  async fn bind(&self, exchange: &str, kind: ExchangeKind, queue: &str, route: &str) -> Result<()> {
    if kind == ExchangeKind::Default {
      return Err(Error::config("Default mode has no exchange to bind"));
    }
    let mut conn = self.handle.connection().await?;
    let existing: Option<String> = redis::cmd("GET")
      .arg(exchange_kind_key(exchange))
      .query_async(&mut conn)
      .await?;
    match existing {
      Some(tag) if tag != kind_tag(kind) => {
        return Err(Error::config(format!(
          "exchange {exchange} already declared with a different kind"
        )));
      }
      Some(_) => {}
      None => {
        let _: () = redis::cmd("SET")
          .arg(exchange_kind_key(exchange))
          .arg(kind_tag(kind))
          .query_async(&mut conn)
          .await?;
      }
    }
    let binding = serde_json::to_string(&WireBinding {
      queue: queue.to_string(),
      route: route.to_string(),
    })?;
    let _: i64 = redis::cmd("SADD")
      .arg(exchange_bindings_key(exchange))
      .arg(binding)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn publish(&self, request: QueuePublishRequest) -> Result<()> {
    let message = WireMessage {
      body: request.message.clone(),
      headers: request.headers.clone(),
    };

    match request.kind {
      ExchangeKind::Default => {
        if request.queue.is_empty() {
          return Err(Error::config("Default mode publish without a queue"));
        }
        self.push(&request.queue, &message).await
      }
      ExchangeKind::Direct | ExchangeKind::FanOut => {
        let mut conn = self.handle.connection().await?;
        let kind: Option<String> = redis::cmd("GET")
          .arg(exchange_kind_key(&request.exchange))
          .query_async(&mut conn)
          .await?;
        if kind.is_none() {
          return Err(Error::broker(format!(
            "unknown exchange: {}",
            request.exchange
          )));
        }
        let members: Vec<String> = redis::cmd("SMEMBERS")
          .arg(exchange_bindings_key(&request.exchange))
          .query_async(&mut conn)
          .await?;
        for member in members {
          let binding: WireBinding = serde_json::from_str(&member)?;
          if request.kind == ExchangeKind::FanOut || binding.route == request.route {
            self.push(&binding.queue, &message).await?;
          }
        }
        Ok(())
      }
    }
  }

  async fn subscribe(&self, queue: &str, qos: &QosRecord) -> Result<Box<dyn QueueSubscription>> {
    let consumer = Uuid::new_v4().to_string();
    Ok(Box::new(RedisQueueSubscription {
      handle: self.handle.clone(),
      queue: queue.to_string(),
      consumer,
      prefetch_count: qos.prefetch_count.max(1) as usize,
      in_flight: HashMap::new(),
      next_tag: 0,
    }))
  }
}

/// Redis 队列订阅
/// Redis queue subscription
///
/// 消费者消失后 processing 列表中的遗留条目由运维回收。
/// Entries left in the processing list by a vanished consumer are reclaimed
/// operationally.
pub struct RedisQueueSubscription {
  handle: RedisHandle,
  queue: String,
  consumer: String,
  prefetch_count: usize,
  /// 投递标签 → 原始线上消息，确认时用于定位
  /// Delivery tag → raw wire message, used to locate on ack
  in_flight: HashMap<u64, String>,
  next_tag: u64,
}

impl RedisQueueSubscription {
  async fn remove_processing(&mut self, delivery: &QueueDelivery) -> Result<String> {
    let raw = self
      .in_flight
      .remove(&delivery.delivery_tag)
      .ok_or_else(|| Error::broker(format!("unknown delivery tag: {}", delivery.delivery_tag)))?;
    let mut conn = self.handle.connection().await?;
    let _: i64 = redis::cmd("LREM")
      .arg(processing_key(&self.queue, &self.consumer))
      .arg(1)
      .arg(&raw)
      .query_async(&mut conn)
      .await?;
    Ok(raw)
  }
}

#[async_trait]
impl QueueSubscription for RedisQueueSubscription {
  async fn next(&mut self) -> Result<Option<QueueDelivery>> {
    if self.in_flight.len() >= self.prefetch_count {
      return Ok(None);
    }
    let mut conn = self.handle.connection().await?;
    let raw: Option<String> = redis::cmd("LMOVE")
      .arg(queue_key(&self.queue))
      .arg(processing_key(&self.queue, &self.consumer))
      .arg("RIGHT")
      .arg("LEFT")
      .query_async(&mut conn)
      .await?;
    let Some(raw) = raw else {
      return Ok(None);
    };

    let message: WireMessage = serde_json::from_str(&raw)?;
    self.next_tag += 1;
    let tag = self.next_tag;
    self.in_flight.insert(tag, raw);
    Ok(Some(QueueDelivery {
      queue: self.queue.clone(),
      body: message.body,
      headers: message.headers,
      delivery_tag: tag,
    }))
  }

  async fn ack(&mut self, delivery: &QueueDelivery) -> Result<()> {
    self.remove_processing(delivery).await?;
    Ok(())
  }

  async fn nack(&mut self, delivery: &QueueDelivery) -> Result<()> {
    let raw = self.remove_processing(delivery).await?;

    let mut conn = self.handle.connection().await?;
    let target: Option<String> = redis::cmd("GET")
      .arg(dead_letter_key(&self.queue))
      .query_async(&mut conn)
      .await?;
    let Some(target) = target else {
      tracing::warn!(queue = %self.queue, "nack without dead-letter target, dropping");
      return Ok(());
    };

    let mut message: WireMessage = serde_json::from_str(&raw)?;
    bump_x_death(&mut message.headers, &self.queue);
    let encoded = serde_json::to_string(&message)?;
    let _: i64 = redis::cmd("LPUSH")
      .arg(queue_key(&target))
      .arg(encoded)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }
}
