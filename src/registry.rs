//! 处理器注册表模块
//! Handler registry module
//!
//! 启动时显式填充的绑定表：类型名 → (已擦除的处理器, 元数据)。
//! 查找发生在热路径上，注册之后表不再变化。
//! The binding table populated explicitly at startup: type name →
//! (erased handler, metadata). Lookups happen on the hot path; the table is
//! immutable after registration.
//!
//! ## 注册 / Registration
//!
//! ```rust
//! use relayq::registry::{Consume, HandlerMetadata, HandlerRegistry};
//! use relayq::persistence::{IsolationLevel, TransactionSide};
//! use relayq::error::Result;
//! use async_trait::async_trait;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced { id: String }
//!
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl Consume<OrderPlaced> for OrderHandler {
//!   async fn handle(&self, message: OrderPlaced) -> Result<()> {
//!     println!("order {}", message.id);
//!     Ok(())
//!   }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! let metadata = HandlerMetadata::builder()
//!   .max_retry(2)
//!   .transaction(TransactionSide::Command, IsolationLevel::ReadCommitted)
//!   .clean_cache("orders|orders-by-day")
//!   .build();
//! registry
//!   .register::<OrderPlaced, _>("OrderPlaced", metadata, Arc::new(OrderHandler))
//!   .unwrap();
//! ```

use crate::codec;
use crate::error::{Error, Result};
use crate::persistence::{IsolationLevel, TransactionSide};
use crate::queue::ExchangeKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ErasedHandler = Arc<dyn Fn(String) -> BoxFuture + Send + Sync>;

/// 消费者契约
/// Consumer contract
///
/// `handle` 在声明的事务内执行；`after_max_retry` 在重试上限越过后、
/// 任何事务之外执行，只能视作尽力而为。
/// `handle` runs inside the declared transaction; `after_max_retry` runs
/// after the retry ceiling is crossed, outside any transaction, and is
/// best-effort only.
#[async_trait]
pub trait Consume<M: Send + 'static>: Send + Sync {
  async fn handle(&self, message: M) -> Result<()>;

  async fn after_max_retry(&self, message: M) -> Result<()> {
    let _ = message;
    Ok(())
  }
}

/// 事务配置：侧别 + 隔离级别
/// Transaction config: side + isolation level
///
/// 每个处理器都必须声明自己运行在命令侧还是查询侧；缺失在调度时是硬错误。
/// Every handler must declare whether it runs in command or query context;
/// absence is a hard error at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
  pub side: TransactionSide,
  pub isolation: IsolationLevel,
}

/// 处理器元数据值记录
/// Handler metadata value record
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
  /// 重试上限
  /// Retry ceiling
  pub max_retry: i32,
  /// 是否声明了越限后的钩子
  /// Whether the after-max hook is declared
  pub has_after_max_retry: bool,
  /// 事务配置；`None` 即处理器声明缺失
  /// Transaction config; `None` means the handler declaration is missing
  pub transaction: Option<TransactionConfig>,
  /// 提交后要删除的缓存键
  /// Cache keys to delete after commit
  pub clean_cache_keys: Vec<String>,
  /// 流处理器绑定的主题
  /// Topic a stream handler is bound to
  pub topic: Option<String>,
}

impl HandlerMetadata {
  /// 构建器入口
  /// Builder entry point
  pub fn builder() -> HandlerMetadataBuilder {
    HandlerMetadataBuilder::default()
  }
}

/// 处理器元数据构建器
/// Handler metadata builder
#[derive(Debug, Default)]
pub struct HandlerMetadataBuilder {
  max_retry: i32,
  has_after_max_retry: bool,
  transaction: Option<TransactionConfig>,
  clean_cache_keys: Vec<String>,
  topic: Option<String>,
}

impl HandlerMetadataBuilder {
  /// 声明重试上限
  /// Declare the retry ceiling
  pub fn max_retry(mut self, count: i32) -> Self {
    self.max_retry = count.max(0);
    self
  }

  /// 声明越限钩子
  /// Declare the after-max hook
  pub fn after_max_retry(mut self) -> Self {
    self.has_after_max_retry = true;
    self
  }

  /// 声明事务配置
  /// Declare the transaction config
  pub fn transaction(mut self, side: TransactionSide, isolation: IsolationLevel) -> Self {
    self.transaction = Some(TransactionConfig { side, isolation });
    self
  }

  /// 声明缓存失效键，竖线分隔
  /// Declare cache invalidation keys, pipe-separated
  pub fn clean_cache<S: AsRef<str>>(mut self, keys: S) -> Self {
    self.clean_cache_keys = keys
      .as_ref()
      .split('|')
      .map(|k| k.trim())
      .filter(|k| !k.is_empty())
      .map(|k| k.to_string())
      .collect();
    self
  }

  /// 声明流主题绑定
  /// Declare the stream topic binding
  pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
    self.topic = Some(topic.into());
    self
  }

  /// 构建元数据
  /// Build the metadata
  pub fn build(self) -> HandlerMetadata {
    HandlerMetadata {
      max_retry: self.max_retry,
      has_after_max_retry: self.has_after_max_retry,
      transaction: self.transaction,
      clean_cache_keys: self.clean_cache_keys,
      topic: self.topic,
    }
  }
}

/// 存储的处理器形态
/// Stored handler shape
enum HandlerKind {
  Sync(Arc<dyn Fn(String) -> Result<()> + Send + Sync>),
  Async(ErasedHandler),
}

/// 一条处理器绑定
/// One handler binding
pub struct HandlerBinding {
  type_name: String,
  metadata: HandlerMetadata,
  handler: HandlerKind,
  after_max: Option<ErasedHandler>,
}

impl HandlerBinding {
  /// 绑定的类型名
  /// The bound type name
  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  /// 绑定的元数据
  /// The binding's metadata
  pub fn metadata(&self) -> &HandlerMetadata {
    &self.metadata
  }

  /// 调用处理器
  /// Invoke the handler
  pub async fn invoke(&self, payload: &str) -> Result<()> {
    match &self.handler {
      HandlerKind::Sync(f) => f(payload.to_string()),
      HandlerKind::Async(f) => f(payload.to_string()).await,
    }
  }

  /// 调用越限钩子；未声明时为空操作
  /// Invoke the after-max hook; a no-op when not declared
  pub async fn invoke_after_max(&self, payload: &str) -> Result<()> {
    match &self.after_max {
      Some(f) => f(payload.to_string()).await,
      None => Ok(()),
    }
  }
}

/// 发件箱使用的交换机声明
/// Exchange declaration used by the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
  pub exchange: String,
  pub route: String,
  pub kind: ExchangeKind,
}

/// 处理器注册表
/// Handler registry
#[derive(Default)]
pub struct HandlerRegistry {
  bindings: HashMap<String, Arc<HandlerBinding>>,
  routes: HashMap<String, ExchangeBinding>,
}

impl HandlerRegistry {
  /// 创建空注册表
  /// Create an empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册一个特征处理器
  /// Register a trait handler
  ///
  /// 同一类型名注册两个处理器是启动错误。
  /// Registering two handlers for one type name is a startup error.
  pub fn register<M, H>(
    &mut self,
    type_name: &str,
    metadata: HandlerMetadata,
    handler: Arc<H>,
  ) -> Result<()>
  where
    M: DeserializeOwned + Send + 'static,
    H: Consume<M> + 'static,
  {
    let handle_fn: ErasedHandler = {
      let handler = handler.clone();
      let type_name = type_name.to_string();
      Arc::new(move |payload: String| {
        let handler = handler.clone();
        let type_name = type_name.clone();
        Box::pin(async move {
          let message: M = codec::decode(&payload).map_err(|e| {
            Error::handler(format!("decoding {type_name} failed: {e}"))
          })?;
          handler.handle(message).await
        }) as BoxFuture
      })
    };

    let after_max = metadata.has_after_max_retry.then(|| {
      let handler = handler.clone();
      let type_name = type_name.to_string();
      Arc::new(move |payload: String| {
        let handler = handler.clone();
        let type_name = type_name.clone();
        Box::pin(async move {
          let message: M = codec::decode(&payload).map_err(|e| {
            Error::handler(format!("decoding {type_name} failed: {e}"))
          })?;
          handler.after_max_retry(message).await
        }) as BoxFuture
      }) as ErasedHandler
    });

    self.insert(HandlerBinding {
      type_name: type_name.to_string(),
      metadata,
      handler: HandlerKind::Async(handle_fn),
      after_max,
    })
  }

  /// 注册一个同步闭包处理器
  /// Register a synchronous closure handler
  pub fn register_fn<M, F>(&mut self, type_name: &str, metadata: HandlerMetadata, f: F) -> Result<()>
  where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) -> Result<()> + Send + Sync + 'static,
  {
    let type_name_owned = type_name.to_string();
    let handler = Arc::new(move |payload: String| {
      let message: M = codec::decode(&payload)
        .map_err(|e| Error::handler(format!("decoding {type_name_owned} failed: {e}")))?;
      f(message)
    });

    self.insert(HandlerBinding {
      type_name: type_name.to_string(),
      metadata,
      handler: HandlerKind::Sync(handler),
      after_max: None,
    })
  }

  fn insert(&mut self, binding: HandlerBinding) -> Result<()> {
    if self.bindings.contains_key(&binding.type_name) {
      return Err(Error::DuplicateHandler {
        type_name: binding.type_name,
      });
    }
    self
      .bindings
      .insert(binding.type_name.clone(), Arc::new(binding));
    Ok(())
  }

  /// 按类型名查找绑定；未注册的类型返回 `None`
  /// Look up a binding by type name; unregistered types return `None`
  pub fn lookup(&self, type_name: &str) -> Option<Arc<HandlerBinding>> {
    self.bindings.get(type_name).cloned()
  }

  /// 为发件箱声明一个事件类型的交换机路由
  /// Declare an event type's exchange route for the outbox
  ///
  /// 只接受 Direct 与 FanOut；其余是配置错误。
  /// Only Direct and FanOut are accepted; anything else is a configuration
  /// error.
  pub fn declare_route(&mut self, event_type: &str, binding: ExchangeBinding) -> Result<()> {
    if binding.kind == ExchangeKind::Default {
      return Err(Error::config(format!(
        "event type {event_type} cannot route through the Default mode"
      )));
    }
    self.routes.insert(event_type.to_string(), binding);
    Ok(())
  }

  /// 查找事件类型的交换机路由
  /// Look up the exchange route of an event type
  pub fn route_for(&self, event_type: &str) -> Option<&ExchangeBinding> {
    self.routes.get(event_type)
  }

  /// 所有声明了主题的绑定的主题集合，去重排序
  /// All declared topics across bindings, deduplicated and sorted
  pub fn topics(&self) -> Vec<String> {
    let mut topics: Vec<String> = self
      .bindings
      .values()
      .filter_map(|b| b.metadata.topic.clone())
      .collect();
    topics.sort();
    topics.dedup();
    topics
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Deserialize)]
  struct OrderPlaced {
    #[allow(dead_code)]
    id: String,
  }

  struct CountingHandler {
    handled: AtomicU32,
    after_max: AtomicU32,
  }

  impl CountingHandler {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        handled: AtomicU32::new(0),
        after_max: AtomicU32::new(0),
      })
    }
  }

  #[async_trait]
  impl Consume<OrderPlaced> for CountingHandler {
    async fn handle(&self, _message: OrderPlaced) -> Result<()> {
      self.handled.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    async fn after_max_retry(&self, _message: OrderPlaced) -> Result<()> {
      self.after_max.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn metadata() -> HandlerMetadata {
    HandlerMetadata::builder()
      .max_retry(2)
      .after_max_retry()
      .transaction(TransactionSide::Command, IsolationLevel::ReadCommitted)
      .clean_cache("orders|orders-by-day")
      .topic("order-events")
      .build()
  }

  #[tokio::test]
  async fn test_register_lookup_invoke() {
    let mut registry = HandlerRegistry::new();
    let handler = CountingHandler::new();
    registry
      .register::<OrderPlaced, _>("OrderPlaced", metadata(), handler.clone())
      .unwrap();

    let binding = registry.lookup("OrderPlaced").unwrap();
    binding.invoke(r#"{"id":"m1"}"#).await.unwrap();
    binding.invoke_after_max(r#"{"id":"m1"}"#).await.unwrap();

    assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    assert_eq!(handler.after_max.load(Ordering::SeqCst), 1);
    assert!(registry.lookup("NoSuchType").is_none());
  }

  #[tokio::test]
  async fn test_duplicate_registration_is_startup_error() {
    let mut registry = HandlerRegistry::new();
    registry
      .register::<OrderPlaced, _>("OrderPlaced", metadata(), CountingHandler::new())
      .unwrap();
    let err = registry
      .register::<OrderPlaced, _>("OrderPlaced", metadata(), CountingHandler::new())
      .unwrap_err();
    assert!(matches!(err, Error::DuplicateHandler { .. }));
  }

  #[tokio::test]
  async fn test_sync_closure_registration() {
    let mut registry = HandlerRegistry::new();
    registry
      .register_fn::<OrderPlaced, _>("OrderPlaced", metadata(), |_m| Ok(()))
      .unwrap();
    let binding = registry.lookup("OrderPlaced").unwrap();
    binding.invoke(r#"{"id":"m1"}"#).await.unwrap();
    // the undeclared hook is a no-op
    binding.invoke_after_max(r#"{"id":"m1"}"#).await.unwrap();
  }

  #[test]
  fn test_clean_cache_parsing() {
    let metadata = HandlerMetadata::builder().clean_cache("A|B||C ").build();
    assert_eq!(metadata.clean_cache_keys, vec!["A", "B", "C"]);
  }

  #[test]
  fn test_routes_reject_default_mode() {
    let mut registry = HandlerRegistry::new();
    let err = registry
      .declare_route(
        "OrderPlaced",
        ExchangeBinding {
          exchange: String::new(),
          route: String::new(),
          kind: ExchangeKind::Default,
        },
      )
      .unwrap_err();
    assert!(matches!(err, Error::Config { .. }));

    registry
      .declare_route(
        "OrderPlaced",
        ExchangeBinding {
          exchange: "orders".to_string(),
          route: "placed".to_string(),
          kind: ExchangeKind::Direct,
        },
      )
      .unwrap();
    assert_eq!(registry.route_for("OrderPlaced").unwrap().route, "placed");
  }

  #[test]
  fn test_topics_deduplicated() {
    let mut registry = HandlerRegistry::new();
    registry
      .register_fn::<OrderPlaced, _>("A", metadata(), |_m| Ok(()))
      .unwrap();
    registry
      .register_fn::<OrderPlaced, _>("B", metadata(), |_m| Ok(()))
      .unwrap();
    assert_eq!(registry.topics(), vec!["order-events"]);
  }
}
