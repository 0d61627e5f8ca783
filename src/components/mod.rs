//! 长驻组件模块
//! Long-running component module
//!
//! 提供统一的组件生命周期接口，以及三类随进程启停的工作者：
//! 发件箱工作者、队列消费工作者、流消费工作者。
//! Provides the unified component lifecycle interface and the three worker
//! kinds that start and stop with the process: the outbox worker, the queue
//! consumer workers and the stream consumer workers.

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod outbox_worker;
pub mod queue_consumer;
pub mod stream_consumer;

/// 组件生命周期接口
/// Component lifecycle interface
///
/// 每个工作者拥有自己的订阅生命周期；关闭信号到来时消费循环在下一次
/// 迭代退出，未确认的投递被放弃以便重投。
/// Each worker owns its subscription lifecycle; on the shutdown signal the
/// consume loop exits at the next iteration and unacknowledged deliveries
/// are abandoned for redelivery.
pub trait ComponentLifecycle {
  /// 启动组件的后台任务
  /// Start the component's background task
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 发出关闭信号
  /// Send the shutdown signal
  fn shutdown(&self);

  /// 组件是否已停止
  /// Whether the component has stopped
  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct TestComponent {
    done: Arc<AtomicBool>,
  }

  impl ComponentLifecycle for TestComponent {
    fn start(self: Arc<Self>) -> JoinHandle<()> {
      tokio::spawn(async move {
        loop {
          if self.done.load(Ordering::Relaxed) {
            break;
          }
          tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
      })
    }

    fn shutdown(&self) {
      self.done.store(true, Ordering::Relaxed);
    }

    fn is_done(&self) -> bool {
      self.done.load(Ordering::Relaxed)
    }
  }

  #[tokio::test]
  async fn test_lifecycle_trait() {
    let component = Arc::new(TestComponent {
      done: Arc::new(AtomicBool::new(false)),
    });

    assert!(!component.is_done());
    let handle = component.clone().start();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    component.shutdown();

    assert!(component.is_done());
    handle.await.unwrap();
  }
}
