//! 发件箱工作者
//! Outbox worker
//!
//! 按固定间隔调用发件箱发布器的排空趟；排空失败只记录，下一趟重试。
//! Invokes the outbox publisher's drain pass on a fixed interval; a failed
//! pass is logged only, the next pass retries.

use crate::components::ComponentLifecycle;
use crate::outbox::OutboxPublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 发件箱工作者
/// Outbox worker
pub struct OutboxWorker {
  publisher: Arc<OutboxPublisher>,
  interval: Duration,
  cancel: CancellationToken,
}

impl OutboxWorker {
  /// 创建新的发件箱工作者
  /// Create a new outbox worker
  pub fn new(publisher: Arc<OutboxPublisher>, interval: Duration) -> Self {
    Self {
      publisher,
      interval,
      cancel: CancellationToken::new(),
    }
  }
}

impl ComponentLifecycle for OutboxWorker {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        tokio::select! {
          _ = self.cancel.cancelled() => break,
          _ = ticker.tick() => {
            match self.publisher.drain_once().await {
              Ok(report) => {
                if report.published + report.removed + report.skipped > 0 {
                  tracing::debug!(
                    published = report.published,
                    removed = report.removed,
                    skipped = report.skipped,
                    "outbox pass finished"
                  );
                }
              }
              Err(e) => tracing::error!(error = %e, "outbox pass failed"),
            }
          }
        }
      }
      tracing::debug!("outbox worker exited");
    })
  }

  fn shutdown(&self) {
    self.cancel.cancel();
  }

  fn is_done(&self) -> bool {
    self.cancel.is_cancelled()
  }
}
