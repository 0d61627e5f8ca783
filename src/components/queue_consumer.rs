//! 队列消费工作者
//! Queue consumer worker
//!
//! 每个配置的队列一个订阅。投递解码后交给调度引擎，结论翻译为确认或
//! 不重入队的否定确认。顺序模式一次一条在途；协作异步模式在单个任务上
//! 重叠投递，在途数量由预取条数的信号量约束。两种模式在启动时选定，
//! 订阅内不混用。
//! One subscription per configured queue. Deliveries decode and pass to the
//! dispatch engine; the verdict translates into an ack or a no-requeue nack.
//! Sequential mode keeps one delivery in flight; cooperative async mode
//! overlaps deliveries on a single task, bounded by a semaphore sized from
//! the prefetch count. The mode is chosen at startup and never mixed within
//! a subscription.

use crate::codec;
use crate::components::ComponentLifecycle;
use crate::config::QosRecord;
use crate::dispatch::{DispatchOutcome, Dispatcher, IncomingMessage};
use crate::message::Event;
use crate::queue::{QueueBroker, QueueDelivery, QueueSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 订阅的解码方式
/// Decode flavor of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
  /// 消息体是 `Event` 信封，内部类型取自信封
  /// The body is the `Event` envelope; the inner type comes from it
  Envelope,
  /// 消息体是指定类型的负载
  /// The body is the payload of the named type
  Typed(String),
}

/// 消费模式
/// Consumption mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
  /// 一次一条在途
  /// One delivery in flight
  Sequential,
  /// 单任务上的重叠投递
  /// Overlapping deliveries on a single task
  CooperativeAsync,
}

/// 队列消费工作者
/// Queue consumer worker
pub struct QueueConsumerWorker {
  broker: Arc<dyn QueueBroker>,
  dispatcher: Arc<Dispatcher>,
  queue: String,
  qos: QosRecord,
  kind: SubscriptionKind,
  mode: ConsumeMode,
  poll_interval: Duration,
  cancel: CancellationToken,
}

impl QueueConsumerWorker {
  /// 创建新的队列消费工作者
  /// Create a new queue consumer worker
  pub fn new(
    broker: Arc<dyn QueueBroker>,
    dispatcher: Arc<Dispatcher>,
    queue: impl Into<String>,
    qos: QosRecord,
    kind: SubscriptionKind,
    mode: ConsumeMode,
    poll_interval: Duration,
  ) -> Self {
    Self {
      broker,
      dispatcher,
      queue: queue.into(),
      qos,
      kind,
      mode,
      poll_interval,
      cancel: CancellationToken::new(),
    }
  }

  /// 把一次投递解码为入站消息
  /// Decode one delivery into an incoming message
  fn decode(&self, delivery: &QueueDelivery) -> Option<IncomingMessage> {
    let retry_count = delivery.retry_count();
    match &self.kind {
      SubscriptionKind::Envelope => match codec::decode::<Event>(&delivery.body) {
        Ok(envelope) => Some(IncomingMessage {
          type_name: envelope.event_type,
          payload: envelope.payload,
          retry_count,
        }),
        Err(e) => {
          tracing::warn!(queue = %self.queue, error = %e, "envelope decode failed");
          None
        }
      },
      SubscriptionKind::Typed(type_name) => Some(IncomingMessage {
        type_name: type_name.clone(),
        payload: delivery.body.clone(),
        retry_count,
      }),
    }
  }

  async fn settle(
    subscription: &mut Box<dyn QueueSubscription>,
    delivery: &QueueDelivery,
    outcome: DispatchOutcome,
  ) {
    let settled = match outcome {
      DispatchOutcome::Ack => subscription.ack(delivery).await,
      DispatchOutcome::Retry => subscription.nack(delivery).await,
    };
    if let Err(e) = settled {
      tracing::error!(error = %e, "delivery settlement failed");
    }
  }

  /// 顺序消费循环
  /// Sequential consume loop
  async fn run_sequential(self: Arc<Self>, mut subscription: Box<dyn QueueSubscription>) {
    loop {
      if self.cancel.is_cancelled() {
        break;
      }
      match subscription.next().await {
        Ok(Some(delivery)) => match self.decode(&delivery) {
          Some(message) => {
            let outcome = self.dispatcher.dispatch(message).await;
            Self::settle(&mut subscription, &delivery, outcome).await;
          }
          // an undecodable body takes the dead-letter path
          None => Self::settle(&mut subscription, &delivery, DispatchOutcome::Retry).await,
        },
        Ok(None) => {
          tokio::select! {
            _ = self.cancel.cancelled() => break,
            _ = tokio::time::sleep(self.poll_interval) => {}
          }
        }
        Err(e) => {
          tracing::error!(queue = %self.queue, error = %e, "queue consume failed");
          tokio::select! {
            _ = self.cancel.cancelled() => break,
            _ = tokio::time::sleep(self.poll_interval) => {}
          }
        }
      }
    }
  }

  /// 协作异步消费循环
  /// Cooperative async consume loop
  async fn run_cooperative(self: Arc<Self>, subscription: Box<dyn QueueSubscription>) {
    let subscription = Arc::new(Mutex::new(subscription));
    let semaphore = Arc::new(Semaphore::new(self.qos.prefetch_count.max(1) as usize));

    loop {
      if self.cancel.is_cancelled() {
        break;
      }
      let Ok(permit) = semaphore.clone().try_acquire_owned() else {
        tokio::select! {
          _ = self.cancel.cancelled() => break,
          _ = tokio::time::sleep(self.poll_interval) => {}
        }
        continue;
      };

      let next = { subscription.lock().await.next().await };
      match next {
        Ok(Some(delivery)) => {
          let worker = self.clone();
          let subscription = subscription.clone();
          tokio::spawn(async move {
            let _permit = permit;
            let outcome = match worker.decode(&delivery) {
              Some(message) => worker.dispatcher.dispatch(message).await,
              None => DispatchOutcome::Retry,
            };
            let mut subscription = subscription.lock().await;
            Self::settle(&mut subscription, &delivery, outcome).await;
          });
        }
        Ok(None) => {
          drop(permit);
          tokio::select! {
            _ = self.cancel.cancelled() => break,
            _ = tokio::time::sleep(self.poll_interval) => {}
          }
        }
        Err(e) => {
          drop(permit);
          tracing::error!(queue = %self.queue, error = %e, "queue consume failed");
          tokio::select! {
            _ = self.cancel.cancelled() => break,
            _ = tokio::time::sleep(self.poll_interval) => {}
          }
        }
      }
    }
  }
}

impl ComponentLifecycle for QueueConsumerWorker {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let subscription = match self.broker.subscribe(&self.queue, &self.qos).await {
        Ok(subscription) => subscription,
        Err(e) => {
          tracing::error!(queue = %self.queue, error = %e, "queue subscription failed");
          return;
        }
      };
      match self.mode {
        ConsumeMode::Sequential => self.clone().run_sequential(subscription).await,
        ConsumeMode::CooperativeAsync => self.clone().run_cooperative(subscription).await,
      }
      tracing::debug!(queue = %self.queue, "queue consumer exited");
    })
  }

  fn shutdown(&self) {
    self.cancel.cancel();
  }

  fn is_done(&self) -> bool {
    self.cancel.is_cancelled()
  }
}
