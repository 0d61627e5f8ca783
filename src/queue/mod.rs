//! 队列传输模块
//! Queue transport module
//!
//! 定义了带交换机语义的队列方言：Direct 按路由键投递，FanOut 广播，
//! Default 直接入队；消费侧提供确认 / 否定确认，否定确认走死信路径并
//! 携带递增的 `x-death` 重试计数。
//! Defines the exchange-flavored queue dialect: Direct routes by key, FanOut
//! broadcasts, Default goes straight to a queue; the consuming side offers
//! ack / nack, where nack takes the dead-letter path carrying the incremented
//! `x-death` retry counter.

use crate::config::QosRecord;
use crate::error::Result;
use crate::message::queue_retry_count;
use async_trait::async_trait;
use std::collections::HashMap;

pub mod memory;
pub mod redis;

/// 交换机类型
/// Exchange kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
  /// 按路由键投递
  /// Routes by key
  Direct,
  /// 广播到所有绑定队列，路由键被忽略
  /// Broadcasts to all bound queues, the route is ignored
  FanOut,
  /// 不经过交换机，直接投递到队列
  /// No exchange, straight to the queue
  Default,
}

/// 队列发布请求
/// Queue publish request
#[derive(Debug, Clone)]
pub struct QueuePublishRequest {
  /// 已编码的消息体
  /// Encoded message body
  pub message: String,
  /// 交换机类型
  /// Exchange kind
  pub kind: ExchangeKind,
  /// 交换机名；Default 模式下为空
  /// Exchange name; empty in Default mode
  pub exchange: String,
  /// 路由键；FanOut 与 Default 模式下被忽略
  /// Route key; ignored in FanOut and Default modes
  pub route: String,
  /// 目标队列；仅 Default 模式使用
  /// Target queue; Default mode only
  pub queue: String,
  /// 附加头部
  /// Extra headers
  pub headers: HashMap<String, String>,
}

impl QueuePublishRequest {
  /// Direct 模式请求
  /// Direct mode request
  pub fn direct<E, R, M>(exchange: E, route: R, message: M) -> Self
  where
    E: Into<String>,
    R: Into<String>,
    M: Into<String>,
  {
    Self {
      message: message.into(),
      kind: ExchangeKind::Direct,
      exchange: exchange.into(),
      route: route.into(),
      queue: String::new(),
      headers: HashMap::new(),
    }
  }

  /// FanOut 模式请求
  /// FanOut mode request
  pub fn fan_out<E, M>(exchange: E, message: M) -> Self
  where
    E: Into<String>,
    M: Into<String>,
  {
    Self {
      message: message.into(),
      kind: ExchangeKind::FanOut,
      exchange: exchange.into(),
      route: String::new(),
      queue: String::new(),
      headers: HashMap::new(),
    }
  }

  /// Default 模式请求（无交换机）
  /// Default mode request (no exchange)
  pub fn to_queue<Q, M>(queue: Q, message: M) -> Self
  where
    Q: Into<String>,
    M: Into<String>,
  {
    Self {
      message: message.into(),
      kind: ExchangeKind::Default,
      exchange: String::new(),
      route: String::new(),
      queue: queue.into(),
      headers: HashMap::new(),
    }
  }

  /// 附加头部
  /// Attach headers
  pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
    self.headers = headers;
    self
  }
}

/// 一次队列投递
/// One queue delivery
#[derive(Debug, Clone)]
pub struct QueueDelivery {
  /// 来源队列
  /// Source queue
  pub queue: String,
  /// 消息体
  /// Message body
  pub body: String,
  /// 头部，含传输层注入的 `x-death`
  /// Headers, including the transport-injected `x-death`
  pub headers: HashMap<String, String>,
  /// 投递标签，确认时使用
  /// Delivery tag, used for acknowledgement
  pub delivery_tag: u64,
}

impl QueueDelivery {
  /// 从 `x-death[0].count` 读取重试计数
  /// Read the retry counter from `x-death[0].count`
  pub fn retry_count(&self) -> i32 {
    queue_retry_count(&self.headers)
  }
}

/// 队列经纪人
/// Queue broker
///
/// 适配器从不解释业务结果，只翻译确认 / 否定确认的决定。
/// The adapter never interprets business outcomes; it only translates
/// ack / nack decisions.
#[async_trait]
pub trait QueueBroker: Send + Sync {
  /// 声明一个队列及其死信目标
  /// Declare a queue and its dead-letter target
  async fn declare_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<()>;

  /// 将队列按路由键绑定到交换机
  /// Bind a queue to an exchange under a route key
  async fn bind(&self, exchange: &str, kind: ExchangeKind, queue: &str, route: &str) -> Result<()>;

  /// 按请求中的交换机类型分发发布
  /// Dispatch a publish by the request's exchange kind
  async fn publish(&self, request: QueuePublishRequest) -> Result<()>;

  /// 订阅一个队列；QoS 在消费开始前生效
  /// Subscribe to a queue; QoS takes effect before consumption starts
  async fn subscribe(&self, queue: &str, qos: &QosRecord) -> Result<Box<dyn QueueSubscription>>;
}

/// 一个队列订阅
/// One queue subscription
#[async_trait]
pub trait QueueSubscription: Send {
  /// 取下一条投递；队列为空时返回 `None`
  /// Take the next delivery; `None` when the queue is empty
  async fn next(&mut self) -> Result<Option<QueueDelivery>>;

  /// 确认投递
  /// Acknowledge a delivery
  async fn ack(&mut self, delivery: &QueueDelivery) -> Result<()>;

  /// 否定确认且不重入队；消息经死信路径携带递增的重试计数
  /// Negatively acknowledge without requeue; the message takes the
  /// dead-letter path with the incremented retry counter
  async fn nack(&mut self, delivery: &QueueDelivery) -> Result<()>;
}
