//! 持久化契约模块
//! Persistence contract module
//!
//! 消息核心不拥有具体的持久化实现，只消费这里的仓储与工作单元契约；
//! 每次投递通过 [`ScopeFactory`] 打开一个新的作用域，并在所有退出路径上释放。
//! The messaging core owns no concrete persistence; it consumes the
//! repository and unit-of-work contracts defined here. Every delivery opens a
//! fresh scope through [`ScopeFactory`] and releases it on all exit paths.

use crate::error::Result;
use crate::message::{ConsumerEvent, Event};
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;

/// 事务所在的一侧
/// Side a transaction runs on
///
/// 调度时依据处理器声明的侧别选择工作单元与收件箱仓储，绝不做运行时转型。
/// The dispatcher selects the unit of work and inbox repository from the
/// handler's declared side; never by runtime casting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionSide {
  Command,
  Query,
}

/// 事务隔离级别
/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
  ReadUncommitted,
  ReadCommitted,
  RepeatableRead,
  Serializable,
}

/// 发件箱行的命令侧仓储
/// Command-side repository of outbox rows
#[async_trait]
pub trait EventCommandRepository: Send + Sync {
  /// 按创建时间升序读取全部待处理行
  /// Read all pending rows in ascending creation order
  async fn find_all_ordered_by_date(&self) -> Result<Vec<Event>>;

  /// 写回一行的状态变更
  /// Write back a row's state change
  async fn change(&self, event: &Event) -> Result<()>;

  /// 删除一行
  /// Remove a row
  async fn remove(&self, event: &Event) -> Result<()>;
}

/// 收件箱标记仓储
/// Inbox marker repository
///
/// 命令侧与查询侧各有一个实例，由调度器按处理器声明的侧别选取。
/// One instance exists per side; the dispatcher picks by the handler's
/// declared side.
#[async_trait]
pub trait ConsumerEventRepository: Send + Sync {
  /// 按消息 id 查找标记
  /// Find a marker by message id
  async fn find_by_id(&self, id: &str) -> Result<Option<ConsumerEvent>>;

  /// 插入标记；与处理器副作用同属一个业务事务
  /// Insert a marker; part of the same business transaction as the handler
  /// effects
  async fn add(&self, marker: ConsumerEvent) -> Result<()>;
}

/// 工作单元
/// Unit of work
#[async_trait]
pub trait UnitOfWork: Send + Sync {
  /// 以给定隔离级别开启事务
  /// Begin a transaction at the given isolation level
  async fn begin(&self, isolation: IsolationLevel) -> Result<()>;

  /// 提交
  /// Commit
  async fn commit(&self) -> Result<()>;

  /// 回滚
  /// Rollback
  async fn rollback(&self) -> Result<()>;
}

/// 一次投递或一次发件箱排空所使用的持久化作用域
/// The persistence scope of one delivery or one outbox pass
///
/// 两侧的工作单元与仓储都从这里取得，作用域随投递结束被丢弃。
/// Both sides' units of work and repositories come from here; the scope is
/// dropped when the delivery ends.
pub trait PersistenceScope: Send + Sync {
  /// 取得某一侧的工作单元
  /// Get the unit of work of one side
  fn unit_of_work(&self, side: TransactionSide) -> Arc<dyn UnitOfWork>;

  /// 取得某一侧的收件箱仓储
  /// Get the inbox repository of one side
  fn consumer_events(&self, side: TransactionSide) -> Arc<dyn ConsumerEventRepository>;

  /// 取得命令侧的发件箱仓储
  /// Get the command-side outbox repository
  fn events(&self) -> Arc<dyn EventCommandRepository>;
}

/// 作用域工厂：每次投递创建一个新的作用域
/// Scope factory: creates a fresh scope per delivery
pub trait ScopeFactory: Send + Sync {
  fn create_scope(&self) -> Arc<dyn PersistenceScope>;
}
