//! 发件箱发布器模块
//! Outbox publisher module
//!
//! 反复排空待发布的事件行：进程内经互斥锁单路执行，事件级经分布式锁在
//! 实例间互斥。一趟之内按创建时间升序处理；Active 行发布后迁移为
//! Inactive，Inactive 行删除；发布失败回滚整趟，锁在所有路径上释放。
//! Repeatedly drains pending event rows: single-file per process behind a
//! mutex, and mutually exclusive across instances per event through the
//! distributed lock. One pass runs in ascending creation order; Active rows
//! publish then transition to Inactive, Inactive rows are removed; a failed
//! publish rolls back the whole pass and locks release on every path.
//!
//! 回滚与释放之间存在一个短暂窗口：另一实例可能看到行仍为 Active 并再次
//! 发布，重复投递由消费侧的幂等标记吸收。
//! A short window exists between rollback and release: another instance may
//! observe the row still Active and publish again; the duplicate delivery is
//! absorbed by the consumer-side idempotency marker.

use crate::codec;
use crate::error::{Error, Result};
use crate::lock::DistributedLock;
use crate::message::Event;
use crate::persistence::{IsolationLevel, ScopeFactory, TransactionSide};
use crate::queue::{ExchangeKind, QueueBroker, QueuePublishRequest};
use crate::registry::HandlerRegistry;
use crate::sidechannel::{FailureReport, Sidechannel};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 一趟排空的结果
/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// 发布并迁移为 Inactive 的行数
  /// Rows published and transitioned to Inactive
  pub published: usize,
  /// 删除的 Inactive 行数
  /// Inactive rows removed
  pub removed: usize,
  /// 因锁被他人持有而跳过的行数
  /// Rows skipped because another instance holds the lock
  pub skipped: usize,
}

/// 发件箱发布器
/// Outbox publisher
pub struct OutboxPublisher {
  scopes: Arc<dyn ScopeFactory>,
  lock: DistributedLock,
  broker: Arc<dyn QueueBroker>,
  registry: Arc<HandlerRegistry>,
  sidechannel: Sidechannel,
  service_name: String,
  /// 进程级互斥：每个实例同一时刻只有一趟排空
  /// Process-wide mutex: one drain at a time per instance
  drain_mutex: Mutex<()>,
}

impl OutboxPublisher {
  /// 创建新的发件箱发布器
  /// Create a new outbox publisher
  pub fn new(
    scopes: Arc<dyn ScopeFactory>,
    lock: DistributedLock,
    broker: Arc<dyn QueueBroker>,
    registry: Arc<HandlerRegistry>,
    sidechannel: Sidechannel,
    service_name: impl Into<String>,
  ) -> Self {
    Self {
      scopes,
      lock,
      broker,
      registry,
      sidechannel,
      service_name: service_name.into(),
      drain_mutex: Mutex::new(()),
    }
  }

  /// 执行一趟排空
  /// Run one drain pass
  pub async fn drain_once(&self) -> Result<DrainReport> {
    let _guard = self.drain_mutex.lock().await;

    let scope = self.scopes.create_scope();
    let uow = scope.unit_of_work(TransactionSide::Command);
    let repo = scope.events();

    uow.begin(IsolationLevel::ReadCommitted).await?;
    let mut held: Vec<String> = Vec::new();

    let pass = async {
      let mut report = DrainReport::default();
      let events = repo.find_all_ordered_by_date().await?;
      for event in &events {
        if !self.lock.acquire(&event.id).await? {
          report.skipped += 1;
          continue;
        }
        held.push(event.id.clone());

        if event.is_active() {
          self.publish(event).await?;
          let mut changed = event.clone();
          changed.deactivate();
          repo.change(&changed).await?;
          report.published += 1;
        } else {
          repo.remove(event).await?;
          report.removed += 1;
        }
      }
      Ok(report)
    }
    .await;

    let outcome = match pass {
      Ok(report) => match uow.commit().await {
        Ok(()) => Ok(report),
        Err(e) => {
          let _ = uow.rollback().await;
          Err(e)
        }
      },
      Err(e) => {
        let _ = uow.rollback().await;
        Err(e)
      }
    };

    // locks acquired in this pass release on every path
    for event_id in &held {
      if let Err(e) = self.lock.release(event_id).await {
        tracing::warn!(event_id = %event_id, error = %e, "event lock release failed");
      }
    }

    if let Err(e) = &outcome {
      self
        .sidechannel
        .report(FailureReport::new(
          &self.service_name,
          "outbox",
          e.to_string(),
        ))
        .await;
    }
    outcome
  }

  /// 按事件类型声明的交换机路由发布信封
  /// Publish the envelope by the exchange route declared on the event type
  async fn publish(&self, event: &Event) -> Result<()> {
    let route = self
      .registry
      .route_for(&event.event_type)
      .ok_or_else(|| Error::MissingRoute {
        type_name: event.event_type.clone(),
      })?;
    let body = codec::encode(event)?;

    let request = match route.kind {
      ExchangeKind::Direct => {
        QueuePublishRequest::direct(route.exchange.clone(), route.route.clone(), body)
      }
      ExchangeKind::FanOut => QueuePublishRequest::fan_out(route.exchange.clone(), body),
      ExchangeKind::Default => {
        return Err(Error::config(format!(
          "event type {} routes through the Default mode",
          event.event_type
        )))
      }
    };
    self.broker.publish(request).await
  }
}
