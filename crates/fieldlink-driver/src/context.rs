//! 指令上下文
//!
//! 一次请求/应答往返中携带的数据：构建请求时读取，解析应答时写入。
//! 设备返回非零状态或执行失败时，异常信息记录在 `exception` 槽中，
//! 调用方通过 [`InstructionContext::has_exception`] 判断结果是否可用。

use std::collections::BTreeMap;

/// 请求负载
pub const KEY_PAYLOAD: &str = "payload";
/// 应答负载
pub const KEY_REPLY: &str = "reply";
/// 帧序号（请求时可显式指定，应答后写入）
pub const KEY_FRAME_ID: &str = "frame_id";
/// 应答状态字节
pub const KEY_STATE: &str = "state";

/// 上下文中的值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Text(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// 执行异常
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionException {
    /// 设备状态码或本地错误码
    pub code: u8,
    pub message: String,
}

/// 指令上下文
///
/// # Example
///
/// ```
/// use fieldlink_driver::InstructionContext;
///
/// let ctx = InstructionContext::new().with("payload", vec![0x01, 0x02]);
/// assert_eq!(ctx.get_bytes("payload"), Some(&[0x01, 0x02][..]));
/// assert!(!ctx.has_exception());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionContext {
    values: BTreeMap<String, Value>,
    exception: Option<InstructionException>,
}

impl InstructionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式设置
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn exception(&self) -> Option<&InstructionException> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, code: u8, message: impl Into<String>) {
        self.exception = Some(InstructionException {
            code,
            message: message.into(),
        });
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_round_through_accessors() {
        let mut ctx = InstructionContext::new()
            .with("count", 3i64)
            .with("name", "pump-1")
            .with(KEY_PAYLOAD, vec![0xAA, 0x55]);
        assert_eq!(ctx.get_int("count"), Some(3));
        assert_eq!(ctx.get("name").and_then(Value::as_str), Some("pump-1"));
        assert_eq!(ctx.get_bytes(KEY_PAYLOAD), Some(&[0xAA, 0x55][..]));
        assert_eq!(ctx.len(), 3);

        assert_eq!(ctx.remove("count"), Some(Value::Int(3)));
        assert!(!ctx.contains("count"));
    }

    #[test]
    fn test_exception_slot() {
        let mut ctx = InstructionContext::new();
        assert!(!ctx.has_exception());
        ctx.set_exception(0x12, "busy");
        assert!(ctx.has_exception());
        assert_eq!(ctx.exception().map(|e| e.code), Some(0x12));
        ctx.clear_exception();
        assert!(ctx.exception().is_none());
    }

    #[test]
    fn test_text_reads_as_bytes() {
        let ctx = InstructionContext::new().with(KEY_PAYLOAD, "ping");
        assert_eq!(ctx.get_bytes(KEY_PAYLOAD), Some(&b"ping"[..]));
        assert_eq!(ctx.get_int(KEY_PAYLOAD), None);
    }
}
