//! 失败旁路日志模块
//! Failure logging sidechannel module
//!
//! 只在失败路径上使用的三路扇出：本地文件、中央日志主题、结构化索引。
//! 绝不抛错，任何汇失败都静默落空，避免二次失败掩盖原始原因。
//! The failure-path-only three-way fan-out: local file, central log topic
//! and structured index. Never throws; any sink failure falls through
//! silently so a double failure cannot mask the original cause.

use crate::error::Result;
use crate::message::StreamHeaders;
use crate::redis::RedisHandle;
use crate::stream::StreamBroker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 一份失败报告
/// One failure report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
  /// 产生报告的服务
  /// Service producing the report
  pub service: String,
  /// 失败发生的阶段
  /// Stage the failure occurred in
  pub stage: String,
  /// 相关消息 id
  /// Related message id
  pub message_id: Option<String>,
  /// 相关消息类型
  /// Related message type
  pub type_name: Option<String>,
  /// 错误描述
  /// Error description
  pub error: String,
  /// 发生时间（UTC）
  /// Occurrence time (UTC)
  pub occurred_at: DateTime<Utc>,
}

impl FailureReport {
  /// 创建新的失败报告
  /// Create a new failure report
  pub fn new<S, G, E>(service: S, stage: G, error: E) -> Self
  where
    S: Into<String>,
    G: Into<String>,
    E: Into<String>,
  {
    Self {
      service: service.into(),
      stage: stage.into(),
      message_id: None,
      type_name: None,
      error: error.into(),
      occurred_at: Utc::now(),
    }
  }

  /// 附上消息 id
  /// Attach the message id
  pub fn with_message_id<S: Into<String>>(mut self, id: S) -> Self {
    self.message_id = Some(id.into());
    self
  }

  /// 附上消息类型
  /// Attach the message type
  pub fn with_type_name<S: Into<String>>(mut self, type_name: S) -> Self {
    self.type_name = Some(type_name.into());
    self
  }
}

/// 失败汇
/// Failure sink
#[async_trait]
pub trait FailureSink: Send + Sync {
  async fn emit(&self, report: &FailureReport) -> Result<()>;
}

/// 本地文件汇，按 JSON 行追加
/// Local file sink, appends JSON lines
pub struct FileSink {
  path: PathBuf,
}

impl FileSink {
  /// 创建新的文件汇
  /// Create a new file sink
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl FailureSink for FileSink {
  async fn emit(&self, report: &FailureReport) -> Result<()> {
    let mut line = serde_json::to_string(report)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
  }
}

/// 中央日志主题汇，经同一个流经纪人发布到固定主题
/// Central log topic sink, published through the same stream broker to a
/// fixed topic
pub struct StreamLogSink {
  broker: Arc<dyn StreamBroker>,
  topic: String,
}

impl StreamLogSink {
  /// 创建新的中央日志汇
  /// Create a new central log sink
  pub fn new<S: Into<String>>(broker: Arc<dyn StreamBroker>, topic: S) -> Self {
    Self {
      broker,
      topic: topic.into(),
    }
  }
}

#[async_trait]
impl FailureSink for StreamLogSink {
  async fn emit(&self, report: &FailureReport) -> Result<()> {
    let payload = serde_json::to_string(report)?;
    self
      .broker
      .publish(&self.topic, "FailureReport", &payload, &StreamHeaders::fresh())
      .await
  }
}

/// 结构化索引汇：文档哈希 + 索引列表
/// Structured index sink: document hash + index list
pub struct RedisIndexSink {
  handle: RedisHandle,
}

impl RedisIndexSink {
  /// 创建新的索引汇
  /// Create a new index sink
  pub fn new(handle: RedisHandle) -> Self {
    Self { handle }
  }
}

#[async_trait]
impl FailureSink for RedisIndexSink {
  async fn emit(&self, report: &FailureReport) -> Result<()> {
    let id = Uuid::new_v4().to_string();
    let mut conn = self.handle.connection().await?;
    let _: i64 = redis::cmd("HSET")
      .arg(format!("relayq:failure:{id}"))
      .arg("service")
      .arg(&report.service)
      .arg("stage")
      .arg(&report.stage)
      .arg("message_id")
      .arg(report.message_id.as_deref().unwrap_or(""))
      .arg("type_name")
      .arg(report.type_name.as_deref().unwrap_or(""))
      .arg("error")
      .arg(&report.error)
      .arg("occurred_at")
      .arg(report.occurred_at.to_rfc3339())
      .query_async(&mut conn)
      .await?;
    let _: i64 = redis::cmd("LPUSH")
      .arg("relayq:failures")
      .arg(id)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }
}

/// 失败旁路
/// Failure sidechannel
#[derive(Clone, Default)]
pub struct Sidechannel {
  sinks: Vec<Arc<dyn FailureSink>>,
}

impl Sidechannel {
  /// 创建没有任何汇的旁路
  /// Create a sidechannel with no sinks
  pub fn new() -> Self {
    Self::default()
  }

  /// 追加一个汇
  /// Append a sink
  pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
    self.sinks.push(sink);
    self
  }

  /// 发出报告；绝不抛错
  /// Emit a report; never throws
  pub async fn report(&self, report: FailureReport) {
    for sink in &self.sinks {
      if let Err(e) = sink.emit(&report).await {
        tracing::debug!(error = %e, "failure sink fell through");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct RecordingSink {
    emitted: AtomicU32,
  }

  #[async_trait]
  impl FailureSink for RecordingSink {
    async fn emit(&self, _report: &FailureReport) -> Result<()> {
      self.emitted.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct BrokenSink;

  #[async_trait]
  impl FailureSink for BrokenSink {
    async fn emit(&self, _report: &FailureReport) -> Result<()> {
      Err(Error::broker("sink down"))
    }
  }

  #[tokio::test]
  async fn test_sink_failure_falls_through() {
    let recording = Arc::new(RecordingSink {
      emitted: AtomicU32::new(0),
    });
    let sidechannel = Sidechannel::new()
      .with_sink(Arc::new(BrokenSink))
      .with_sink(recording.clone());

    sidechannel
      .report(FailureReport::new("orders", "dispatch", "handler failed"))
      .await;

    // the broken sink did not stop the healthy one
    assert_eq!(recording.emitted.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_file_sink_appends_json_lines() {
    let path = std::env::temp_dir().join(format!("relayq-sidechannel-{}.log", Uuid::new_v4()));
    let sink = FileSink::new(&path);

    let report = FailureReport::new("orders", "dispatch", "boom")
      .with_message_id("m1")
      .with_type_name("OrderPlaced");
    sink.emit(&report).await.unwrap();
    sink.emit(&report).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed: FailureReport = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed.message_id.as_deref(), Some("m1"));

    let _ = tokio::fs::remove_file(&path).await;
  }
}
