//! 流消费工作者
//! Stream consumer worker
//!
//! 每个主题一个 `{service}-{topic}` 消费组订阅的热循环，由取消信号门控。
//! 处理闸门：只接收新发布（`GroupId` 为空）或本服务自己的重试重发
//! （`GroupId == {service}-{topic}` 且计数大于零），其余记录静默提交。
//! 调度失败时以递增计数重发同一负载，重发成功才提交原始偏移。
//! A hot loop per topic, subscribed as the `{service}-{topic}` consumer
//! group and gated by the cancellation signal. The processing gate accepts
//! only fresh publishes (empty `GroupId`) or this service's own retry
//! republishes (`GroupId == {service}-{topic}` with a positive counter);
//! everything else commits silently. On a failed dispatch the same payload
//! republishes with the incremented counter, and the original offset commits
//! only when the republish succeeded.
//!
//! 已知取舍：重发成功后提交原始偏移，若保留期内重发记录丢失，该事件即
//! 丢失。
//! Known trade-off: the original offset commits after a successful
//! republish; if the republished record is lost within retention, the event
//! is gone.

use crate::components::ComponentLifecycle;
use crate::dispatch::{DispatchOutcome, Dispatcher, IncomingMessage};
use crate::message::StreamHeaders;
use crate::registry::HandlerRegistry;
use crate::stream::{StreamBroker, StreamRecord, StreamSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 为注册表声明的每个主题创建一个工作者
/// Create one worker per topic declared in the registry
pub fn workers_for_topics(
  registry: &HandlerRegistry,
  broker: Arc<dyn StreamBroker>,
  dispatcher: Arc<Dispatcher>,
  service_name: &str,
  poll_interval: Duration,
) -> Vec<Arc<StreamConsumerWorker>> {
  registry
    .topics()
    .into_iter()
    .map(|topic| {
      Arc::new(StreamConsumerWorker::new(
        broker.clone(),
        dispatcher.clone(),
        service_name,
        topic,
        poll_interval,
      ))
    })
    .collect()
}

/// 流消费工作者
/// Stream consumer worker
pub struct StreamConsumerWorker {
  broker: Arc<dyn StreamBroker>,
  dispatcher: Arc<Dispatcher>,
  topic: String,
  group: String,
  poll_interval: Duration,
  cancel: CancellationToken,
}

impl StreamConsumerWorker {
  /// 创建新的流消费工作者；消费组名为 `{service}-{topic}`
  /// Create a new stream consumer worker; the group name is
  /// `{service}-{topic}`
  pub fn new(
    broker: Arc<dyn StreamBroker>,
    dispatcher: Arc<Dispatcher>,
    service_name: &str,
    topic: impl Into<String>,
    poll_interval: Duration,
  ) -> Self {
    let topic = topic.into();
    let group = format!("{service_name}-{topic}");
    Self {
      broker,
      dispatcher,
      topic,
      group,
      poll_interval,
      cancel: CancellationToken::new(),
    }
  }

  /// 处理闸门：记录是否属于本消费组的这一代
  /// Processing gate: whether the record belongs to this consumer-group
  /// generation
  fn passes_gate(&self, headers: &StreamHeaders) -> bool {
    headers.group_id.is_empty()
      || (headers.group_id == self.group && headers.count_of_retry > 0)
  }

  async fn handle(&self, record: StreamRecord, subscription: &mut Box<dyn StreamSubscription>) {
    if !self.passes_gate(&record.headers) {
      // not for this consumer-group generation, silently acknowledged
      if let Err(e) = subscription.commit(&record).await {
        tracing::error!(topic = %self.topic, error = %e, "gate commit failed");
      }
      return;
    }

    let outcome = self
      .dispatcher
      .dispatch(IncomingMessage {
        type_name: record.key.clone(),
        payload: record.payload.clone(),
        retry_count: record.headers.count_of_retry,
      })
      .await;

    match outcome {
      DispatchOutcome::Ack => {
        // a failed commit redelivers; the idempotency marker absorbs it
        if let Err(e) = subscription.commit(&record).await {
          tracing::error!(topic = %self.topic, error = %e, "offset commit failed");
        }
      }
      DispatchOutcome::Retry => {
        let headers = StreamHeaders::retry(self.group.clone(), record.headers.count_of_retry + 1);
        match self
          .broker
          .publish(&record.topic, &record.key, &record.payload, &headers)
          .await
        {
          Ok(()) => {
            if let Err(e) = subscription.commit(&record).await {
              tracing::error!(topic = %self.topic, error = %e, "offset commit failed");
            }
          }
          Err(e) => {
            // no commit: the record redelivers on the next poll
            tracing::error!(topic = %self.topic, error = %e, "retry republish failed");
          }
        }
      }
    }
  }
}

impl ComponentLifecycle for StreamConsumerWorker {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut subscription = match self.broker.subscribe(&self.topic, &self.group).await {
        Ok(subscription) => subscription,
        Err(e) => {
          tracing::error!(topic = %self.topic, error = %e, "stream subscription failed");
          return;
        }
      };

      loop {
        if self.cancel.is_cancelled() {
          break;
        }
        match subscription.poll().await {
          Ok(Some(record)) => self.handle(record, &mut subscription).await,
          Ok(None) => {
            tokio::select! {
              _ = self.cancel.cancelled() => break,
              _ = tokio::time::sleep(self.poll_interval) => {}
            }
          }
          Err(e) => {
            // no commit, the record will be redelivered
            tracing::error!(topic = %self.topic, error = %e, "stream consume failed");
            tokio::select! {
              _ = self.cancel.cancelled() => break,
              _ = tokio::time::sleep(self.poll_interval) => {}
            }
          }
        }
      }
      tracing::debug!(topic = %self.topic, "stream consumer exited");
    })
  }

  fn shutdown(&self) {
    self.cancel.cancel();
  }

  fn is_done(&self) -> bool {
    self.cancel.is_cancelled()
  }
}
