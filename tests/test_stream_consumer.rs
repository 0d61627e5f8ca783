//! Stream consumer worker tests over the in-memory backends
//!
//! Covers retry-by-republish exhaustion with the after-max hook, the
//! processing gate matrix and the unknown-type silent acknowledgement.

use async_trait::async_trait;
use relayq::cache::MemoryCache;
use relayq::components::stream_consumer::StreamConsumerWorker;
use relayq::components::ComponentLifecycle;
use relayq::dispatch::Dispatcher;
use relayq::message::StreamHeaders;
use relayq::persistence::memory::MemoryPersistence;
use relayq::persistence::{IsolationLevel, TransactionSide};
use relayq::registry::{Consume, HandlerMetadata, HandlerRegistry};
use relayq::retry::PublishRetryPolicy;
use relayq::sidechannel::Sidechannel;
use relayq::stream::memory::MemoryStreamBroker;
use relayq::stream::StreamBroker;
use relayq::Result;
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

fn fast_broker() -> MemoryStreamBroker {
  MemoryStreamBroker::new().with_policy(PublishRetryPolicy::new(1, Duration::from_millis(1)))
}

fn registry_with(handler: Arc<CountingHandler>, max_retry: i32) -> HandlerRegistry {
  let mut registry = HandlerRegistry::new();
  registry
    .register::<OrderPlaced, _>(
      "OrderPlaced",
      HandlerMetadata::builder()
        .max_retry(max_retry)
        .after_max_retry()
        .transaction(TransactionSide::Query, IsolationLevel::ReadCommitted)
        .topic("order-events")
        .build(),
      handler,
    )
    .unwrap();
  registry
}

fn dispatcher_for(
  registry: HandlerRegistry,
  persistence: &MemoryPersistence,
  service: &str,
) -> Arc<Dispatcher> {
  Arc::new(Dispatcher::new(
    Arc::new(registry),
    Arc::new(persistence.clone()),
    Arc::new(MemoryCache::new()),
    Sidechannel::new(),
    service,
  ))
}

/// S4: `MaxRetry = 2`, an always-throwing handler. Republishes carry counts
/// 1, 2, 3; after the third throw the hook runs once and no count 4 appears.
#[tokio::test]
async fn test_retry_exhaustion_republish_sequence() {
  let broker = fast_broker();
  let handler = CountingHandler::new(true);
  let persistence = MemoryPersistence::new();

  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"m2"}"#,
      &StreamHeaders::fresh(),
    )
    .await
    .unwrap();

  let worker = Arc::new(StreamConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher_for(registry_with(handler.clone(), 2), &persistence, "orders"),
    "orders",
    "order-events",
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  {
    let handler = handler.clone();
    wait_until(move || handler.after_max.load(Ordering::SeqCst) == 1).await;
  }
  tokio::time::sleep(Duration::from_millis(100)).await;

  // counts on the topic: the fresh record plus republishes 1, 2, 3
  assert_eq!(broker.retry_counts("order-events"), vec![0, 1, 2, 3]);
  // attempts at counts 0, 1, 2; count 3 crossed the ceiling
  assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
  assert_eq!(handler.after_max.load(Ordering::SeqCst), 1);
  assert!(persistence
    .markers_snapshot(TransactionSide::Query)
    .await
    .is_empty());

  worker.shutdown();
  handle.await.unwrap();
}

/// S5: an unregistered key commits the offset with no handler invocation and
/// no inbox row
#[tokio::test]
async fn test_unknown_type_is_silently_acked() {
  let broker = fast_broker();
  let handler = CountingHandler::new(false);
  let persistence = MemoryPersistence::new();

  broker
    .publish(
      "order-events",
      "NoSuchType",
      r#"{"id":"x1"}"#,
      &StreamHeaders::fresh(),
    )
    .await
    .unwrap();
  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"m1"}"#,
      &StreamHeaders::fresh(),
    )
    .await
    .unwrap();

  let worker = Arc::new(StreamConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher_for(registry_with(handler.clone(), 2), &persistence, "orders"),
    "orders",
    "order-events",
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  // the known record behind the unknown one proves the offset advanced
  {
    let handler = handler.clone();
    wait_until(move || handler.handled.load(Ordering::SeqCst) == 1).await;
  }
  let markers = persistence.markers_snapshot(TransactionSide::Query).await;
  assert_eq!(markers.len(), 1);
  assert_eq!(markers[0].id, "m1");

  worker.shutdown();
  handle.await.unwrap();
}

/// Property 6: a fresh record reaches every consumer group; a foreign retry
/// republish is silently acked; an own retry republish is processed
#[tokio::test]
async fn test_processing_gate_matrix() {
  let broker = fast_broker();

  // a foreign service's retry republish arrives first on the topic
  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"foreign"}"#,
      &StreamHeaders::retry("billing-order-events", 1),
    )
    .await
    .unwrap();
  // then a fresh publish
  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"fresh"}"#,
      &StreamHeaders::fresh(),
    )
    .await
    .unwrap();
  // then this service's own retry republish
  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"own"}"#,
      &StreamHeaders::retry("orders-order-events", 1),
    )
    .await
    .unwrap();

  let handler = CountingHandler::new(false);
  let persistence = MemoryPersistence::new();
  let worker = Arc::new(StreamConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher_for(registry_with(handler.clone(), 2), &persistence, "orders"),
    "orders",
    "order-events",
    Duration::from_millis(10),
  ));
  let handle = worker.clone().start();

  {
    let handler = handler.clone();
    wait_until(move || handler.handled.load(Ordering::SeqCst) == 2).await;
  }
  tokio::time::sleep(Duration::from_millis(50)).await;

  // the foreign retry never reached the handler
  assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
  let mut ids: Vec<String> = persistence
    .markers_snapshot(TransactionSide::Query)
    .await
    .into_iter()
    .map(|m| m.id)
    .collect();
  ids.sort();
  assert_eq!(ids, vec!["fresh", "own"]);

  worker.shutdown();
  handle.await.unwrap();
}

/// A second service's group sees the same fresh record
#[tokio::test]
async fn test_fresh_record_reaches_every_group() {
  let broker = fast_broker();
  broker
    .publish(
      "order-events",
      "OrderPlaced",
      r#"{"id":"m1"}"#,
      &StreamHeaders::fresh(),
    )
    .await
    .unwrap();

  let handler_a = CountingHandler::new(false);
  let persistence_a = MemoryPersistence::new();
  let worker_a = Arc::new(StreamConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher_for(registry_with(handler_a.clone(), 2), &persistence_a, "orders"),
    "orders",
    "order-events",
    Duration::from_millis(10),
  ));

  let handler_b = CountingHandler::new(false);
  let persistence_b = MemoryPersistence::new();
  let worker_b = Arc::new(StreamConsumerWorker::new(
    Arc::new(broker.clone()),
    dispatcher_for(registry_with(handler_b.clone(), 2), &persistence_b, "billing"),
    "billing",
    "order-events",
    Duration::from_millis(10),
  ));

  let handle_a = worker_a.clone().start();
  let handle_b = worker_b.clone().start();

  {
    let handler_a = handler_a.clone();
    wait_until(move || handler_a.handled.load(Ordering::SeqCst) == 1).await;
  }
  {
    let handler_b = handler_b.clone();
    wait_until(move || handler_b.handled.load(Ordering::SeqCst) == 1).await;
  }

  worker_a.shutdown();
  worker_b.shutdown();
  handle_a.await.unwrap();
  handle_b.await.unwrap();
}
