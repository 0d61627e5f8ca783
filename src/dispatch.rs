//! 消费调度引擎模块
//! Consumer dispatch engine module
//!
//! 两种传输共用的单一协议。一次投递按序经过：绑定 → 重试上限 →
//! 事务配置 → 幂等闸门 → 事务执行 → 缓存失效 → 确认；任何一步失败即
//! 回滚、走旁路日志并交由传输层重试。
//! The single protocol shared by both transports. One delivery passes in
//! order through: bind → retry ceiling → transaction config → idempotency
//! gate → transact → cache invalidation → acknowledge; a failure at any step
//! rolls back, goes through the logging sidechannel and hands retry to the
//! transport.
//!
//! 每次投递的状态机：
//! The per-delivery state machine:
//!
//! ```text
//! RECEIVED → BOUND → {SKIP-UNKNOWN | SKIP-MAX-RETRIED | SKIP-ALREADY-PROCESSED
//!   | TRANSACTING → COMMITTED → CACHE-INVALIDATED} → ACK
//! TRANSACTING 中的任何异常 ↦ ROLLED-BACK → RETRY-DISPATCH
//! ```

use crate::cache::CacheBackend;
use crate::codec;
use crate::error::{Error, Result};
use crate::message::ConsumerEvent;
use crate::persistence::ScopeFactory;
use crate::registry::{HandlerBinding, HandlerRegistry};
use crate::sidechannel::{FailureReport, Sidechannel};
use std::sync::Arc;

/// 解码后的一条入站消息
/// One decoded inbound message
#[derive(Debug, Clone)]
pub struct IncomingMessage {
  /// 类型名，注册表的绑定键
  /// Type name, the binding key into the registry
  pub type_name: String,
  /// 序列化负载
  /// Serialized payload
  pub payload: String,
  /// 传输头部携带的重试计数
  /// Retry counter carried in transport headers
  pub retry_count: i32,
}

/// 调度结论，由传输适配器翻译成确认动作
/// Dispatch verdict, translated into an acknowledgement by the transport
/// adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
  /// 确认：队列 `BasicAck`，流提交偏移
  /// Acknowledge: queue `BasicAck`, stream offset commit
  Ack,
  /// 重试：队列不重入队的否定确认，流带递增计数重发
  /// Retry: queue nack without requeue, stream republish with incremented
  /// counter
  Retry,
}

/// 一次成功运行走到的地方
/// How far a successful run went
enum Completion {
  Committed,
  AlreadyProcessed,
}

/// 消费调度引擎
/// Consumer dispatch engine
#[derive(Clone)]
pub struct Dispatcher {
  registry: Arc<HandlerRegistry>,
  scopes: Arc<dyn ScopeFactory>,
  cache: Arc<dyn CacheBackend>,
  sidechannel: Sidechannel,
  service_name: String,
}

impl Dispatcher {
  /// 创建新的调度引擎
  /// Create a new dispatch engine
  pub fn new(
    registry: Arc<HandlerRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    cache: Arc<dyn CacheBackend>,
    sidechannel: Sidechannel,
    service_name: impl Into<String>,
  ) -> Self {
    Self {
      registry,
      scopes,
      cache,
      sidechannel,
      service_name: service_name.into(),
    }
  }

  /// 调度一次投递
  /// Dispatch one delivery
  pub async fn dispatch(&self, message: IncomingMessage) -> DispatchOutcome {
    // 1. 绑定。未知类型属于共享流/队列上的其他服务，确认后丢弃。
    // 1. Bind. Unknown types belong to other services on a shared
    //    stream/queue; acknowledged and dropped.
    let Some(binding) = self.registry.lookup(&message.type_name) else {
      tracing::debug!(type_name = %message.type_name, "unknown message type, acking");
      return DispatchOutcome::Ack;
    };

    // 2. 重试上限。钩子在任何事务之外运行。
    // 2. Retry ceiling. The hook runs outside any transaction.
    let metadata = binding.metadata();
    if message.retry_count > metadata.max_retry {
      if metadata.has_after_max_retry {
        if let Err(e) = binding.invoke_after_max(&message.payload).await {
          self
            .report(&message, "after-max-retry", &e)
            .await;
        }
      }
      tracing::debug!(
        type_name = %message.type_name,
        retry_count = message.retry_count,
        "retry ceiling crossed, giving up on message"
      );
      return DispatchOutcome::Ack;
    }

    match self.run(&binding, &message).await {
      Ok(Completion::Committed) => {
        // 6. 缓存失效。副作用已提交，这里的失败只记录。
        // 6. Cache invalidation. Effects are committed; failures here are
        //    logged only.
        for key in &metadata.clean_cache_keys {
          if let Err(e) = self.cache.delete(key).await {
            tracing::warn!(key = %key, error = %e, "cache invalidation failed");
          }
        }
        DispatchOutcome::Ack
      }
      Ok(Completion::AlreadyProcessed) => {
        tracing::debug!(type_name = %message.type_name, "already processed, acking");
        DispatchOutcome::Ack
      }
      Err(e) => {
        self.report(&message, "dispatch", &e).await;
        DispatchOutcome::Retry
      }
    }
  }

  /// 步骤 3–5：事务配置、幂等闸门、事务执行
  /// Steps 3–5: transaction config, idempotency gate, transact
  async fn run(&self, binding: &HandlerBinding, message: &IncomingMessage) -> Result<Completion> {
    // 3. 事务配置缺失是编程错误，大声记录后走重试路径。
    // 3. A missing transaction config is a programmer error; logged loudly,
    //    then the retry path.
    let metadata = binding.metadata();
    let Some(config) = metadata.transaction else {
      tracing::error!(
        type_name = %message.type_name,
        "handler declares no transaction config"
      );
      return Err(Error::MissingTransactionConfig {
        type_name: message.type_name.clone(),
      });
    };

    // 4. 幂等闸门：标记存在即已完成。
    // 4. Idempotency gate: a present marker means already done.
    let message_id = codec::extract_message_id(&message.type_name, &message.payload)?;
    let scope = self.scopes.create_scope();
    let inbox = scope.consumer_events(config.side);
    if inbox.find_by_id(&message_id).await?.is_some() {
      return Ok(Completion::AlreadyProcessed);
    }

    // 5. 事务执行：标记与处理器副作用同进退。
    // 5. Transact: the marker and the handler effects commit or roll back
    //    together.
    let uow = scope.unit_of_work(config.side);
    uow.begin(config.isolation).await?;

    let marker = ConsumerEvent::new(
      message_id.clone(),
      message.type_name.clone(),
      message.retry_count,
    );
    let handled = async {
      inbox.add(marker).await?;
      binding.invoke(&message.payload).await
    }
    .await;

    match handled {
      Ok(()) => {
        if let Err(e) = uow.commit().await {
          let _ = uow.rollback().await;
          return Err(e);
        }
        Ok(Completion::Committed)
      }
      Err(e) => {
        let _ = uow.rollback().await;
        Err(e)
      }
    }
  }

  async fn report(&self, message: &IncomingMessage, stage: &str, error: &Error) {
    let mut report = FailureReport::new(&self.service_name, stage, error.to_string())
      .with_type_name(&message.type_name);
    if let Ok(id) = codec::extract_message_id(&message.type_name, &message.payload) {
      report = report.with_message_id(id);
    }
    self.sidechannel.report(report).await;
  }
}
