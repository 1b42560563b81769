//! 帧协议指令
//!
//! `[header][frameId][state][length][command][version][payload][crc16]`
//!
//! 请求负载由 [`PayloadCodec`] 从上下文编码，应答负载同样由它解码。
//! 默认的 [`RawPayload`] 直接读写上下文中的 `payload` / `reply` 字节。

use crate::context::{InstructionContext, KEY_FRAME_ID, KEY_PAYLOAD, KEY_REPLY, KEY_STATE};
use crate::error::DriverError;
use crate::instruction::{Instruction, InstructionSession};
use fieldlink_protocol::{FrameLayout, FRAME_ID_MASK};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// 负载编解码
pub trait PayloadCodec: Send + Sync {
    /// 上下文 → 请求负载
    fn encode(&self, context: &InstructionContext) -> Result<Vec<u8>, DriverError>;

    /// 应答负载 → 上下文
    fn decode(&self, payload: &[u8], context: &mut InstructionContext) -> Result<(), DriverError>;
}

/// 原样透传负载
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPayload;

impl PayloadCodec for RawPayload {
    fn encode(&self, context: &InstructionContext) -> Result<Vec<u8>, DriverError> {
        Ok(context
            .get_bytes(KEY_PAYLOAD)
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }

    fn decode(&self, payload: &[u8], context: &mut InstructionContext) -> Result<(), DriverError> {
        context.set(KEY_REPLY, payload);
        Ok(())
    }
}

/// 帧协议指令
#[derive(Clone)]
pub struct FrameInstruction {
    name: String,
    layout: FrameLayout,
    command: u8,
    version: u8,
    timeout: Option<Duration>,
    expects_reply: bool,
    check_frame_id: bool,
    codec: Arc<dyn PayloadCodec>,
}

impl FrameInstruction {
    /// 默认：等待应答、校验帧序号、原样透传负载
    pub fn new(name: impl Into<String>, layout: FrameLayout, command: u8) -> Self {
        Self {
            name: name.into(),
            layout,
            command,
            version: 0,
            timeout: None,
            expects_reply: true,
            check_frame_id: true,
            codec: Arc::new(RawPayload),
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expects_reply(mut self, expects_reply: bool) -> Self {
        self.expects_reply = expects_reply;
        self
    }

    pub fn check_frame_id(mut self, check_frame_id: bool) -> Self {
        self.check_frame_id = check_frame_id;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }
}

impl Instruction for FrameInstruction {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    fn build(
        &self,
        session: &InstructionSession,
        context: &InstructionContext,
    ) -> Result<Vec<u8>, DriverError> {
        // 应答对端请求时沿用对端的帧序号
        let frame_id = match context.get_int(KEY_FRAME_ID) {
            Some(id) => (id as u8) & FRAME_ID_MASK,
            None => session.next_frame_id(),
        };
        let state = context.get_int(KEY_STATE).unwrap_or(0) as u8;
        let payload = self.codec.encode(context)?;
        let frame = self
            .layout
            .encode(frame_id, state, self.command, self.version, &payload)?;
        trace!(
            "{}: built frame id={} cmd=0x{:02X} ({} bytes)",
            self.name,
            frame_id,
            self.command,
            frame.len()
        );
        Ok(frame)
    }

    fn matches(&self, session: &InstructionSession, frame: &[u8]) -> bool {
        if !self.layout.matches(frame, self.command) {
            return false;
        }
        !self.check_frame_id || session.is_same_frame_id(frame[1])
    }

    fn parse(&self, frame: &[u8], context: &mut InstructionContext) -> Result<(), DriverError> {
        let view = self.layout.parse(frame)?;
        context.set(KEY_FRAME_ID, view.frame_id());
        context.set(KEY_STATE, view.state());
        if view.state() != 0 {
            // 非零状态不再解析负载
            context.set_exception(view.state(), format!("{} rejected by device", self.name));
            return Ok(());
        }
        self.codec.decode(view.payload(), context)
    }

    fn duplicate(&self) -> Arc<dyn Instruction> {
        Arc::new(self.clone())
    }
}
