//! # Relayq
//!
//! Reliable transactional messaging core in Rust
//!
//! Relayq 是微服务框架的异步消息核心：事务性发件箱发布器、消费调度
//! 运行时，以及支撑二者的幂等 / 分布式锁 / 重试机制，共同在两种可互换的
//! 传输之上提供可靠的"有效恰好一次"投递。
//! Relayq is the asynchronous messaging core of a microservice framework:
//! the transactional outbox publisher, the consumer dispatch runtime and the
//! supporting idempotency / distributed-lock / retry machinery, together
//! providing reliable effectively-exactly-once delivery over two
//! interchangeable transports.
//!
//! ## 特性
//! ## Features
//!
//! - 发件箱模式：事件与业务状态同一事务写入，轮询排空到传输层
//!   - Outbox pattern: events commit with business state and drain to the wire
//! - 消费侧幂等标记，重复投递至多生效一次
//!   - Consumer-side idempotency markers, redeliveries take effect at most once
//! - 队列方言：Direct / FanOut / Default 交换机模式与死信重试计数
//!   - Queue dialect: Direct / FanOut / Default exchange modes with
//!     dead-letter retry counting
//! - 流方言：消费组、最早偏移、手动提交、按重发重试
//!   - Stream dialect: consumer groups, earliest offset, manual commit,
//!     retry-by-republish
//! - 集群级事件锁与进程级排空互斥
//!   - Cluster-wide event locks and the process-wide drain mutex
//! - 有界重试的发布策略与失败旁路日志
//!   - Bounded publish retries and the failure logging sidechannel
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use relayq::cache::MemoryCache;
//! use relayq::config::Config;
//! use relayq::dispatch::Dispatcher;
//! use relayq::persistence::memory::MemoryPersistence;
//! use relayq::persistence::{IsolationLevel, TransactionSide};
//! use relayq::registry::{HandlerMetadata, HandlerRegistry};
//! use relayq::sidechannel::Sidechannel;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = Config::new("orders");
//!
//!   // 注册处理器
//!   // Register handlers
//!   let mut registry = HandlerRegistry::new();
//!   let metadata = HandlerMetadata::builder()
//!     .max_retry(2)
//!     .transaction(TransactionSide::Command, IsolationLevel::ReadCommitted)
//!     .build();
//!   registry.register_fn::<serde_json::Value, _>("OrderPlaced", metadata, |order| {
//!     println!("order: {order}");
//!     Ok(())
//!   })?;
//!
//!   // 组装调度引擎
//!   // Assemble the dispatch engine
//!   let dispatcher = Dispatcher::new(
//!     Arc::new(registry),
//!     Arc::new(MemoryPersistence::new()),
//!     Arc::new(MemoryCache::new()),
//!     Sidechannel::new(),
//!     config.service_name.clone(),
//!   );
//!   let _ = dispatcher;
//!   Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod components;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod message;
pub mod outbox;
pub mod persistence;
pub mod queue;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod sidechannel;
pub mod stream;

pub use config::Config;
pub use dispatch::{DispatchOutcome, Dispatcher, IncomingMessage};
pub use error::{Error, Result};
pub use message::{ActiveState, ConsumerEvent, Event, ServiceStatus};
pub use outbox::{DrainReport, OutboxPublisher};
pub use registry::{Consume, HandlerMetadata, HandlerRegistry};
