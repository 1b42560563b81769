//! 帧布局与帧构建/校验
//!
//! `FrameLayout` 描述一类设备的帧格式参数（帧头、长度字段宽度），
//! 同一协议族的所有指令共享一个布局。

use crate::bcd::{check_digits, decode_bcd, encode_bcd};
use crate::crc::crc16;
use crate::ProtocolError;

/// 默认帧头
pub const DEFAULT_HEADER: u8 = 0xAA;

/// 超过此长度的帧跳过 CRC 校验（10 KiB）
pub const CHECKSUM_LIMIT: usize = 10 * 1024;

/// 默认最大帧长（1 MiB），用于重组器丢弃异常长度
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// 帧头、帧序号、状态字段各 1 字节
const PREFIX_LEN: usize = 3;

/// CRC 字段长度
const CRC_LEN: usize = 2;

/// 帧布局
///
/// # Example
///
/// ```
/// use fieldlink_protocol::FrameLayout;
///
/// let layout = FrameLayout::default();
/// let frame = layout.encode(1, 0, 0x01, 0x10, &[0xDE, 0xAD]).unwrap();
/// let view = layout.parse(&frame).unwrap();
/// assert_eq!(view.command(), 0x01);
/// assert_eq!(view.payload(), &[0xDE, 0xAD]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameLayout {
    /// 帧头字节
    pub header: u8,
    /// 长度字段 BCD 位数（2..=8 的偶数）
    pub length_digits: u8,
    /// 允许的最大帧长
    pub max_frame_len: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER,
            length_digits: 4,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl FrameLayout {
    /// 创建布局并校验长度位数
    pub fn new(header: u8, length_digits: u8) -> Result<Self, ProtocolError> {
        check_digits(length_digits)?;
        Ok(Self {
            header,
            length_digits,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    /// 设置最大帧长
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// 长度字段字节数
    #[inline]
    pub fn length_bytes(&self) -> usize {
        (self.length_digits / 2) as usize
    }

    /// 长度字段之前的字节数（帧头 + 帧序号 + 状态 + 长度）
    #[inline]
    pub fn length_end(&self) -> usize {
        PREFIX_LEN + self.length_bytes()
    }

    /// 命令字节偏移
    #[inline]
    pub fn command_offset(&self) -> usize {
        self.length_end()
    }

    /// 版本字节偏移
    #[inline]
    pub fn version_offset(&self) -> usize {
        self.length_end() + 1
    }

    /// 负载起始偏移
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.length_end() + 2
    }

    /// 最小帧长（空负载）
    #[inline]
    pub fn min_frame_len(&self) -> usize {
        self.payload_offset() + CRC_LEN
    }

    /// 构建一帧
    ///
    /// # 参数
    /// - `frame_id`: 帧序号（只取低 6 位）
    /// - `state`: 状态字节（请求通常为 0）
    /// - `command`: 命令字
    /// - `version`: 协议版本
    /// - `payload`: 负载
    pub fn encode(
        &self,
        frame_id: u8,
        state: u8,
        command: u8,
        version: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        check_digits(self.length_digits)?;
        let total = self.min_frame_len() + payload.len();
        if total > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                limit: self.max_frame_len,
            });
        }
        let declared = (total - self.length_end()) as u64;
        let length = encode_bcd(declared, self.length_digits)?;

        let mut frame = Vec::with_capacity(total);
        frame.push(self.header);
        frame.push(frame_id & crate::FRAME_ID_MASK);
        frame.push(state);
        frame.extend_from_slice(&length);
        frame.push(command);
        frame.push(version);
        frame.extend_from_slice(payload);

        let crc = crc16(&frame[1..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }

    /// 读取长度字段声明的总帧长
    ///
    /// 返回 `Ok(None)` 表示字节数不足以读出长度字段。
    pub fn declared_total_len(&self, buffer: &[u8]) -> Result<Option<usize>, ProtocolError> {
        if buffer.len() < self.length_end() {
            return Ok(None);
        }
        let declared = decode_bcd(&buffer[PREFIX_LEN..self.length_end()])? as usize;
        Ok(Some(self.length_end() + declared))
    }

    /// 校验 CRC（超过 `CHECKSUM_LIMIT` 的帧直接视为通过）
    pub fn checksum_ok(&self, buffer: &[u8]) -> bool {
        let len = buffer.len();
        if len < self.min_frame_len() {
            return false;
        }
        if len > CHECKSUM_LIMIT {
            return true;
        }
        let expected = crc16(&buffer[1..len - CRC_LEN]);
        let actual = u16::from_be_bytes([buffer[len - 2], buffer[len - 1]]);
        expected == actual
    }

    /// 指令匹配规则
    ///
    /// 长度 ≥ 最小帧长，帧头与命令字一致，且（≤ 10 KiB 时）CRC 正确。
    /// 不匹配不是错误，只返回 `false`。
    pub fn matches(&self, buffer: &[u8], command: u8) -> bool {
        buffer.len() >= self.min_frame_len()
            && buffer[0] == self.header
            && buffer[self.command_offset()] == command
            && self.checksum_ok(buffer)
    }

    /// 严格解析一帧（帧头、长度字段、CRC 全部校验）
    pub fn parse<'a>(&self, buffer: &'a [u8]) -> Result<FrameView<'a>, ProtocolError> {
        if buffer.len() < self.min_frame_len() {
            return Err(ProtocolError::InvalidLength {
                expected: self.min_frame_len(),
                actual: buffer.len(),
            });
        }
        if buffer[0] != self.header {
            return Err(ProtocolError::InvalidHeader {
                expected: self.header,
                actual: buffer[0],
            });
        }
        if let Some(total) = self.declared_total_len(buffer)? {
            if total != buffer.len() {
                return Err(ProtocolError::LengthMismatch {
                    declared: total,
                    actual: buffer.len(),
                });
            }
        }
        if !self.checksum_ok(buffer) {
            let len = buffer.len();
            return Err(ProtocolError::ChecksumMismatch {
                expected: crc16(&buffer[1..len - CRC_LEN]),
                actual: u16::from_be_bytes([buffer[len - 2], buffer[len - 1]]),
            });
        }
        Ok(FrameView {
            layout: *self,
            bytes: buffer,
        })
    }

    /// 不做校验的视图（调用方已通过 `matches` 验证）
    pub fn view<'a>(&self, buffer: &'a [u8]) -> Option<FrameView<'a>> {
        if buffer.len() < self.min_frame_len() {
            return None;
        }
        Some(FrameView {
            layout: *self,
            bytes: buffer,
        })
    }
}

/// 帧只读视图
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    layout: FrameLayout,
    bytes: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// 帧序号
    pub fn frame_id(&self) -> u8 {
        self.bytes[1] & crate::FRAME_ID_MASK
    }

    /// 状态字节（0 表示成功，非 0 为应用错误码）
    pub fn state(&self) -> u8 {
        self.bytes[2]
    }

    /// 命令字
    pub fn command(&self) -> u8 {
        self.bytes[self.layout.command_offset()]
    }

    /// 协议版本
    pub fn version(&self) -> u8 {
        self.bytes[self.layout.version_offset()]
    }

    /// 负载（不含 CRC）
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.layout.payload_offset()..self.bytes.len() - CRC_LEN]
    }

    /// 原始字节
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}
