//! 信封编解码模块
//! Envelope codec module
//!
//! 负载以文本 JSON 形式上线；类型身份只由名字字符串承载，
//! 该名字就是注册表的绑定键。
//! Payloads travel as textual JSON; type identity is carried only by the
//! name string, which is the binding key into the registry.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// 序列化为线上 JSON 文本
/// Serialize into the wire JSON text
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
  Ok(serde_json::to_string(value)?)
}

/// 从线上 JSON 文本反序列化
/// Deserialize from the wire JSON text
///
/// 对所有处理器输入类型满足 `decode(encode(x)) == x`。
/// Satisfies `decode(encode(x)) == x` for all handler input types.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
  Ok(serde_json::from_str(raw)?)
}

/// 按约定提取负载的消息 id
/// Extract the message id from a payload by convention
///
/// 约定键依次为 `id`、`Id`；两者皆缺失视为处理器契约被破坏。
/// The conventional keys are `id` then `Id`; both missing means the handler
/// contract is broken.
pub fn extract_message_id(type_name: &str, raw: &str) -> Result<String> {
  let value: serde_json::Value = serde_json::from_str(raw)?;
  value
    .get("id")
    .or_else(|| value.get("Id"))
    .and_then(|v| match v {
      serde_json::Value::String(s) => Some(s.clone()),
      serde_json::Value::Number(n) => Some(n.to_string()),
      _ => None,
    })
    .ok_or_else(|| Error::MissingMessageId {
      type_name: type_name.to_string(),
    })
}
