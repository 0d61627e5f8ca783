//! 错误处理模块
//! Error handling module
//!
//! 定义了 Relayq 库中使用的各种错误类型
//! Defines various error types used in the Relayq library

use thiserror::Error;

/// Relayq 库的结果类型
/// Result type for the Relayq library
pub type Result<T> = std::result::Result<T, Error>;

/// Relayq 错误类型
/// Relayq error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 未知的消息类型，未在注册表中绑定
  /// Unknown message type, not bound in the registry
  #[error("Unknown message type: {type_name}")]
  UnknownType { type_name: String },

  /// 同一类型注册了多个处理器
  /// More than one handler registered for the same type
  #[error("Duplicate handler for message type: {type_name}")]
  DuplicateHandler { type_name: String },

  /// 处理器未声明事务配置
  /// Handler declared no transaction config
  #[error("Missing transaction config for handler of type: {type_name}")]
  MissingTransactionConfig { type_name: String },

  /// 消息负载缺少约定的 id 属性
  /// Message payload is missing the conventional id property
  #[error("Message payload has no id property: {type_name}")]
  MissingMessageId { type_name: String },

  /// 出站事件类型没有声明交换机路由
  /// Outbound event type declared no exchange binding
  #[error("No exchange binding declared for event type: {type_name}")]
  MissingRoute { type_name: String },

  /// 处理器执行失败
  /// Handler execution failed
  #[error("Handler failed: {message}")]
  Handler { message: String },

  /// Broker 错误
  /// Broker error
  #[error("Broker error: {0}")]
  Broker(String),

  /// 发布重试耗尽
  /// Publish retries exhausted
  #[error("Publish retries exhausted after {attempts} attempts: {message}")]
  PublishExhausted { attempts: u32, message: String },

  /// 事务错误
  /// Transaction error
  #[error("Transaction error: {message}")]
  Transaction { message: String },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 取消错误
  /// Cancellation error
  #[error("Operation cancelled")]
  Cancelled,

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建处理器错误
  /// Create a handler error
  pub fn handler<S: Into<String>>(message: S) -> Self {
    Self::Handler {
      message: message.into(),
    }
  }

  /// 创建 Broker 错误
  /// Create a broker error
  pub fn broker<S: Into<String>>(message: S) -> Self {
    Self::Broker(message.into())
  }

  /// 创建事务错误
  /// Create a transaction error
  pub fn transaction<S: Into<String>>(message: S) -> Self {
    Self::Transaction {
      message: message.into(),
    }
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 检查是否为可重试错误
  /// Check if the error is retriable
  ///
  /// 可重试错误会进入传输层的重试路径；其余错误在调用处决定去向。
  /// Retriable errors take the transport retry path; all other errors are
  /// routed by the caller.
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      Error::Redis(_)
        | Error::Io(_)
        | Error::Broker(_)
        | Error::Handler { .. }
        | Error::Transaction { .. }
    )
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }
}
