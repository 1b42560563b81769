//! 指令抽象
//!
//! 一条指令知道如何：
//! 1. 从上下文构建请求帧
//! 2. 判断一段完整帧是否是自己的应答（帧头、命令字、校验、帧序号）
//! 3. 把应答解析回上下文
//!
//! 指令本身是无状态的，可以被多个设备共享（见接收转发）；
//! 帧序号等会话状态保存在 [`InstructionSession`] 中，每个设备一份。

use crate::context::InstructionContext;
use crate::error::DriverError;
use fieldlink_protocol::FrameIdSequence;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 指令会话（一个逻辑对话一份）
///
/// 帧序号属于会话，不同连接之间互不干扰。
#[derive(Debug, Default)]
pub struct InstructionSession {
    frame_ids: FrameIdSequence,
}

impl InstructionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配下一个帧序号
    pub fn next_frame_id(&self) -> u8 {
        self.frame_ids.next_frame_id()
    }

    pub fn last_frame_id(&self) -> Option<u8> {
        self.frame_ids.last_frame_id()
    }

    /// 应答帧序号是否与最近一次请求一致
    pub fn is_same_frame_id(&self, frame_id: u8) -> bool {
        self.frame_ids.is_same_frame_id(frame_id)
    }

    /// 重连后重置
    pub fn reset(&self) {
        self.frame_ids.reset();
    }
}

/// 协议指令
pub trait Instruction: Send + Sync {
    /// 指令名（在一个指令集内唯一）
    fn name(&self) -> &str;

    /// 指令级接收超时（`None` 使用设备默认值）
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 是否等待应答
    fn expects_reply(&self) -> bool {
        true
    }

    /// 构建请求帧
    fn build(
        &self,
        session: &InstructionSession,
        context: &InstructionContext,
    ) -> Result<Vec<u8>, DriverError>;

    /// 完整帧是否为本指令的应答
    ///
    /// 校验失败、命令字不符时返回 false，不报错。
    fn matches(&self, session: &InstructionSession, frame: &[u8]) -> bool;

    /// 解析应答到上下文
    fn parse(&self, frame: &[u8], context: &mut InstructionContext) -> Result<(), DriverError>;

    /// 复制一份独立实例（对端设备使用独立的指令集）
    fn duplicate(&self) -> Arc<dyn Instruction>;
}

impl fmt::Debug for dyn Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("name", &self.name())
            .finish()
    }
}

/// 一次指令请求
///
/// 由调用方创建，交给指令池后所有权转移给指令池；
/// 入队被拒绝或执行完成后立即释放。
pub struct InstructionDescription {
    /// 指令名
    pub name: String,
    /// 请求上下文
    pub context: InstructionContext,
    /// 本次请求的接收超时（覆盖指令/设备默认值）
    pub timeout: Option<Duration>,
    /// 调用方附加数据，随描述一起释放
    pub tag: Option<Arc<dyn Any + Send + Sync>>,
}

impl InstructionDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: InstructionContext::new(),
            timeout: None,
            tag: None,
        }
    }

    pub fn with_context(mut self, context: InstructionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, tag: Arc<dyn Any + Send + Sync>) -> Self {
        self.tag = Some(tag);
        self
    }
}

impl fmt::Debug for InstructionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionDescription")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("timeout", &self.timeout)
            .field("tagged", &self.tag.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_independent() {
        let a = InstructionSession::new();
        let b = InstructionSession::new();
        for _ in 0..5 {
            a.next_frame_id();
        }
        assert_eq!(a.last_frame_id(), Some(4));
        assert_eq!(b.last_frame_id(), None);
        assert_eq!(b.next_frame_id(), 0);
        assert!(a.is_same_frame_id(4));
        assert!(!b.is_same_frame_id(4));
    }

    #[test]
    fn test_description_tag_is_released_with_description() {
        let tag: Arc<dyn Any + Send + Sync> = Arc::new(7u32);
        let description = InstructionDescription::new("read").with_tag(tag.clone());
        assert_eq!(Arc::strong_count(&tag), 2);
        drop(description);
        assert_eq!(Arc::strong_count(&tag), 1);
    }
}
