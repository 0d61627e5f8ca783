//! Queue consumer worker tests over the in-memory backends
//!
//! Covers the outbox-to-consumer pipeline, duplicate redelivery idempotency,
//! the dead-letter retry cycle with its ceiling, and the cooperative async
//! consumption mode.

use async_trait::async_trait;
use relayq::cache::MemoryCache;
use relayq::components::queue_consumer::{ConsumeMode, QueueConsumerWorker, SubscriptionKind};
use relayq::components::ComponentLifecycle;
use relayq::dispatch::Dispatcher;
use relayq::lock::DistributedLock;
use relayq::message::Event;
use relayq::persistence::memory::MemoryPersistence;
use relayq::persistence::{IsolationLevel, TransactionSide};
use relayq::queue::memory::MemoryQueueBroker;
use relayq::queue::{ExchangeKind, QueueBroker, QueuePublishRequest};
use relayq::registry::{Consume, ExchangeBinding, HandlerMetadata, HandlerRegistry};
use relayq::sidechannel::Sidechannel;
use relayq::{OutboxPublisher, Result};
use relayq::config::QosRecord;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
struct OrderPlaced {
  #[allow(dead_code)]
  id: String,
}

struct CountingHandler {
  handled: AtomicU32,
  after_max: AtomicU32,
  fail: bool,
}

impl CountingHandler {
  fn new(fail: bool) -> Arc<Self> {
    Arc::new(Self {
      handled: AtomicU32::new(0),
      after_max: AtomicU32::new(0),
      fail,
    })
  }
}

#[async_trait]
impl Consume<OrderPlaced> for CountingHandler {
  async fn handle(&self, _message: OrderPlaced) -> Result<()> {
    self.handled.fetch_add(1, Ordering::SeqCst);
    if self.fail {
      return Err(relayq::Error::handler("always fails"));
    }
    Ok(())
  }

  async fn after_max_retry(&self, _message: OrderPlaced) -> Result<()> {
    self.after_max.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
  for _ in 0..500 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not reached within the deadline");
}

fn qos(queue: &str, prefetch_count: u16) -> QosRecord {
  QosRecord {
    queue: queue.to_string(),
    prefetch_count,
    active: true,
    ..Default::default()
  }
}

fn dispatcher(
  registry: HandlerRegistry,
  persistence: &MemoryPersistence,
) -> Arc<Dispatcher> {
  Arc::new(Dispatcher::new(
    Arc::new(registry),
    Arc::new(persistence.clone()),
    Arc::new(MemoryCache::new()),
    Sidechannel::new(),
    "orders",
  ))
}

/// The full producer-side to consumer-side pipeline, then a duplicate
/// redelivery that must not re-run the handler (S1 + S3)
#[tokio::test]
async fn test_outbox_to_consumer_pipeline_is_idempotent() {
  let mut registry = HandlerRegistry::new();
  let handler = CountingHandler::new(false);
  registry
    .register::<OrderPlaced, _>(
      "OrderPlaced",
      HandlerMetadata::builder()
        .max_retry(2)
        .transaction(TransactionSide::Command, IsolationLevel::ReadCommitted)
        .build(),
      handler.clone(),
    )
    .unwrap();
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
  let registry = Arc::new(registry);

  let broker = MemoryQueueBroker::new();
  broker
    .bind("orders", ExchangeKind::Direct, "orders-in", "placed")
    .await
    .unwrap();

  let persistence = MemoryPersistence::new();
  let publisher = OutboxPublisher::new(
    Arc::new(persistence.clone()),
    DistributedLock::new(Arc::new(MemoryCache::new())),
    Arc::new(broker.clone()),
    registry.clone(),
    Sidechannel::new(),
    "orders",
  );

  let event = Event::new("OrderPlaced", r#"{"id":"m1"}"#);
  let envelope = serde_json::to_string(&event).unwrap();
  persistence.insert_event(event).await;
  publisher.drain_once().await.unwrap();

  let dispatcher = Arc::new(Dispatcher::new(
    registry,
    Arc::new(persistence.clone()),
    Arc::new(MemoryCache::new()),
    Sidechannel::new(),
    "orders",
  ));
  let worker = Arc::new(QueueConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher,
    "orders-in",
    qos("orders-in", 1),
    SubscriptionKind::Envelope,
    ConsumeMode::Sequential,
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  {
    let handler = handler.clone();
    wait_until(move || handler.handled.load(Ordering::SeqCst) == 1).await;
  }
  assert_eq!(
    persistence
      .markers_snapshot(TransactionSide::Command)
      .await
      .len(),
    1
  );

  // redeliver the same envelope; the idempotency marker absorbs it
  broker
    .publish(QueuePublishRequest::to_queue("orders-in", envelope))
    .await
    .unwrap();
  {
    let broker = broker.clone();
    wait_until(move || broker.ready_len("orders-in") == 0).await;
  }
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
  assert_eq!(
    persistence
      .markers_snapshot(TransactionSide::Command)
      .await
      .len(),
    1
  );

  worker.shutdown();
  handle.await.unwrap();
}

/// Property 3, queue flavor: a handler that always throws is attempted
/// `max_retry + 1` times through the dead-letter cycle, then the after-max
/// hook runs once and the message terminates
#[tokio::test]
async fn test_dead_letter_cycle_respects_retry_ceiling() {
  let mut registry = HandlerRegistry::new();
  let handler = CountingHandler::new(true);
  registry
    .register::<OrderPlaced, _>(
      "FlakyMessage",
      HandlerMetadata::builder()
        .max_retry(1)
        .after_max_retry()
        .transaction(TransactionSide::Query, IsolationLevel::ReadCommitted)
        .build(),
      handler.clone(),
    )
    .unwrap();

  let broker = MemoryQueueBroker::new();
  // the dead-letter target loops back to the origin queue
  broker
    .declare_queue("retry-in", Some("retry-in"))
    .await
    .unwrap();
  broker
    .publish(QueuePublishRequest::to_queue("retry-in", r#"{"id":"q1"}"#))
    .await
    .unwrap();

  let persistence = MemoryPersistence::new();
  let worker = Arc::new(QueueConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher(registry, &persistence),
    "retry-in",
    qos("retry-in", 1),
    SubscriptionKind::Typed("FlakyMessage".to_string()),
    ConsumeMode::Sequential,
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  {
    let handler = handler.clone();
    wait_until(move || handler.after_max.load(Ordering::SeqCst) == 1).await;
  }
  tokio::time::sleep(Duration::from_millis(50)).await;

  // attempts: count 0 and count 1; count 2 crossed the ceiling
  assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
  assert_eq!(handler.after_max.load(Ordering::SeqCst), 1);
  assert_eq!(broker.ready_len("retry-in"), 0);
  // nothing committed for the always-failing handler
  assert!(persistence
    .markers_snapshot(TransactionSide::Query)
    .await
    .is_empty());

  worker.shutdown();
  handle.await.unwrap();
}

/// Cooperative async mode drains a batch with overlapping deliveries
#[tokio::test]
async fn test_cooperative_async_mode_processes_batch() {
  let mut registry = HandlerRegistry::new();
  let handler = CountingHandler::new(false);
  registry
    .register::<OrderPlaced, _>(
      "OrderPlaced",
      HandlerMetadata::builder()
        .max_retry(2)
        .transaction(TransactionSide::Command, IsolationLevel::ReadCommitted)
        .build(),
      handler.clone(),
    )
    .unwrap();

  let broker = MemoryQueueBroker::new();
  for i in 0..5 {
    broker
      .publish(QueuePublishRequest::to_queue(
        "orders-in",
        format!(r#"{{"id":"m{i}"}}"#),
      ))
      .await
      .unwrap();
  }

  let persistence = MemoryPersistence::new();
  let worker = Arc::new(QueueConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher(registry, &persistence),
    "orders-in",
    qos("orders-in", 4),
    SubscriptionKind::Typed("OrderPlaced".to_string()),
    ConsumeMode::CooperativeAsync,
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  {
    let handler = handler.clone();
    wait_until(move || handler.handled.load(Ordering::SeqCst) == 5).await;
  }
  {
    let broker = broker.clone();
    wait_until(move || broker.ready_len("orders-in") == 0).await;
  }
  assert_eq!(
    persistence
      .markers_snapshot(TransactionSide::Command)
      .await
      .len(),
    5
  );

  worker.shutdown();
  handle.await.unwrap();
}
