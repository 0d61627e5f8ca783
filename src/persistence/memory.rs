//! 内存持久化实现
//! Memory persistence implementation
//!
//! 使用内存数据结构实现仓储与工作单元契约，不依赖任何外部服务；
//! 写入先入暂存区，提交时才落到共享存储，回滚即清空暂存区。
//! Implements the repository and unit-of-work contracts with in-memory data
//! structures, without any external service dependencies; writes go into a
//! staging buffer and only reach the shared store on commit, rollback clears
//! the buffer.

use crate::error::{Error, Result};
use crate::message::{ConsumerEvent, Event};
use crate::persistence::{
  ConsumerEventRepository, EventCommandRepository, IsolationLevel, PersistenceScope, ScopeFactory,
  TransactionSide, UnitOfWork,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// 共享的内存存储
/// Shared in-memory stores
#[derive(Default)]
pub struct MemoryStores {
  /// 发件箱行
  /// Outbox rows
  pub events: Vec<Event>,
  /// 命令侧收件箱标记
  /// Command-side inbox markers
  pub consumer_command: HashMap<String, ConsumerEvent>,
  /// 查询侧收件箱标记
  /// Query-side inbox markers
  pub consumer_query: HashMap<String, ConsumerEvent>,
}

/// 暂存的发件箱操作
/// Staged outbox operation
enum EventOp {
  Change(Event),
  Remove(String),
}

/// 一个作用域内尚未提交的写入
/// Uncommitted writes of one scope
#[derive(Default)]
struct Staged {
  event_ops: Vec<EventOp>,
  command_markers: Vec<ConsumerEvent>,
  query_markers: Vec<ConsumerEvent>,
}

/// 内存持久化，实现 [`ScopeFactory`]
/// Memory persistence, implements [`ScopeFactory`]
#[derive(Clone, Default)]
pub struct MemoryPersistence {
  stores: Arc<RwLock<MemoryStores>>,
}

impl MemoryPersistence {
  /// 创建新的内存持久化实例
  /// Create a new memory persistence instance
  pub fn new() -> Self {
    Self::default()
  }

  /// 获取共享存储的引用
  /// Get the shared stores reference
  pub fn stores(&self) -> &Arc<RwLock<MemoryStores>> {
    &self.stores
  }

  /// 直接写入一个已提交的发件箱行
  /// Directly write a committed outbox row
  ///
  /// 代表业务事务一侧已经完成的插入。
  /// Stands for the insert already performed by the business transaction.
  pub async fn insert_event(&self, event: Event) {
    let mut stores = self.stores.write().await;
    stores.events.push(event);
  }

  /// 当前发件箱行的快照
  /// Snapshot of the current outbox rows
  pub async fn events_snapshot(&self) -> Vec<Event> {
    self.stores.read().await.events.clone()
  }

  /// 某一侧收件箱标记的快照
  /// Snapshot of one side's inbox markers
  pub async fn markers_snapshot(&self, side: TransactionSide) -> Vec<ConsumerEvent> {
    let stores = self.stores.read().await;
    let map = match side {
      TransactionSide::Command => &stores.consumer_command,
      TransactionSide::Query => &stores.consumer_query,
    };
    map.values().cloned().collect()
  }
}

impl ScopeFactory for MemoryPersistence {
  fn create_scope(&self) -> Arc<dyn PersistenceScope> {
    Arc::new(MemoryScope::new(self.stores.clone()))
  }
}

/// 一次投递的内存作用域
/// Memory scope of one delivery
pub struct MemoryScope {
  command_uow: Arc<MemoryUnitOfWork>,
  query_uow: Arc<MemoryUnitOfWork>,
  command_inbox: Arc<MemoryConsumerEventRepository>,
  query_inbox: Arc<MemoryConsumerEventRepository>,
  events: Arc<MemoryEventRepository>,
}

impl MemoryScope {
  fn new(stores: Arc<RwLock<MemoryStores>>) -> Self {
    let staged = Arc::new(Mutex::new(Staged::default()));
    Self {
      command_uow: Arc::new(MemoryUnitOfWork {
        side: TransactionSide::Command,
        stores: stores.clone(),
        staged: staged.clone(),
        active: AtomicBool::new(false),
      }),
      query_uow: Arc::new(MemoryUnitOfWork {
        side: TransactionSide::Query,
        stores: stores.clone(),
        staged: staged.clone(),
        active: AtomicBool::new(false),
      }),
      command_inbox: Arc::new(MemoryConsumerEventRepository {
        side: TransactionSide::Command,
        stores: stores.clone(),
        staged: staged.clone(),
      }),
      query_inbox: Arc::new(MemoryConsumerEventRepository {
        side: TransactionSide::Query,
        stores: stores.clone(),
        staged: staged.clone(),
      }),
      events: Arc::new(MemoryEventRepository { stores, staged }),
    }
  }
}

impl PersistenceScope for MemoryScope {
  fn unit_of_work(&self, side: TransactionSide) -> Arc<dyn UnitOfWork> {
    match side {
      TransactionSide::Command => self.command_uow.clone(),
      TransactionSide::Query => self.query_uow.clone(),
    }
  }

  fn consumer_events(&self, side: TransactionSide) -> Arc<dyn ConsumerEventRepository> {
    match side {
      TransactionSide::Command => self.command_inbox.clone(),
      TransactionSide::Query => self.query_inbox.clone(),
    }
  }

  fn events(&self) -> Arc<dyn EventCommandRepository> {
    self.events.clone()
  }
}

/// 内存工作单元
/// Memory unit of work
pub struct MemoryUnitOfWork {
  side: TransactionSide,
  stores: Arc<RwLock<MemoryStores>>,
  staged: Arc<Mutex<Staged>>,
  active: AtomicBool,
}

impl MemoryUnitOfWork {
  /// 取出本侧暂存的写入
  /// Take the staged writes of this side
  fn take_staged(&self) -> (Vec<EventOp>, Vec<ConsumerEvent>) {
    let mut staged = self.staged.lock().expect("staged buffer poisoned");
    match self.side {
      TransactionSide::Command => (
        std::mem::take(&mut staged.event_ops),
        std::mem::take(&mut staged.command_markers),
      ),
      TransactionSide::Query => (Vec::new(), std::mem::take(&mut staged.query_markers)),
    }
  }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
  async fn begin(&self, _isolation: IsolationLevel) -> Result<()> {
    if self.active.swap(true, Ordering::SeqCst) {
      return Err(Error::transaction("transaction already active"));
    }
    Ok(())
  }

  async fn commit(&self) -> Result<()> {
    if !self.active.swap(false, Ordering::SeqCst) {
      return Err(Error::transaction("no active transaction to commit"));
    }
    let (event_ops, markers) = self.take_staged();

    let mut stores = self.stores.write().await;
    for op in event_ops {
      match op {
        EventOp::Change(event) => {
          if let Some(row) = stores.events.iter_mut().find(|e| e.id == event.id) {
            *row = event;
          }
        }
        EventOp::Remove(id) => stores.events.retain(|e| e.id != id),
      }
    }
    let map = match self.side {
      TransactionSide::Command => &mut stores.consumer_command,
      TransactionSide::Query => &mut stores.consumer_query,
    };
    for marker in markers {
      if map.contains_key(&marker.id) {
        return Err(Error::transaction(format!(
          "duplicate inbox marker: {}",
          marker.id
        )));
      }
      map.insert(marker.id.clone(), marker);
    }
    Ok(())
  }

  async fn rollback(&self) -> Result<()> {
    // idempotent: rolling back without an active transaction is a no-op
    if self.active.swap(false, Ordering::SeqCst) {
      let _ = self.take_staged();
    }
    Ok(())
  }
}

/// 内存收件箱仓储
/// Memory inbox repository
pub struct MemoryConsumerEventRepository {
  side: TransactionSide,
  stores: Arc<RwLock<MemoryStores>>,
  staged: Arc<Mutex<Staged>>,
}

#[async_trait]
impl ConsumerEventRepository for MemoryConsumerEventRepository {
  async fn find_by_id(&self, id: &str) -> Result<Option<ConsumerEvent>> {
    let stores = self.stores.read().await;
    let map = match self.side {
      TransactionSide::Command => &stores.consumer_command,
      TransactionSide::Query => &stores.consumer_query,
    };
    Ok(map.get(id).cloned())
  }

  async fn add(&self, marker: ConsumerEvent) -> Result<()> {
    let mut staged = self.staged.lock().expect("staged buffer poisoned");
    match self.side {
      TransactionSide::Command => staged.command_markers.push(marker),
      TransactionSide::Query => staged.query_markers.push(marker),
    }
    Ok(())
  }
}

/// 内存发件箱仓储
/// Memory outbox repository
pub struct MemoryEventRepository {
  stores: Arc<RwLock<MemoryStores>>,
  staged: Arc<Mutex<Staged>>,
}

#[async_trait]
impl EventCommandRepository for MemoryEventRepository {
  async fn find_all_ordered_by_date(&self) -> Result<Vec<Event>> {
    // reads committed state; the staging buffer never serves reads
    let stores = self.stores.read().await;
    let mut events = stores.events.clone();
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(events)
  }

  async fn change(&self, event: &Event) -> Result<()> {
    let mut staged = self.staged.lock().expect("staged buffer poisoned");
    staged.event_ops.push(EventOp::Change(event.clone()));
    Ok(())
  }

  async fn remove(&self, event: &Event) -> Result<()> {
    let mut staged = self.staged.lock().expect("staged buffer poisoned");
    staged.event_ops.push(EventOp::Remove(event.id.clone()));
    Ok(())
  }
}
