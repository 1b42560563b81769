//! # Fieldlink Protocol
//!
//! 指令协议帧定义（无 IO 依赖）
//!
//! ## 模块
//!
//! - `bcd`: BCD 长度字段编解码
//! - `crc`: 逐位计算的 CRC-16
//! - `frame`: 帧布局、帧构建与校验
//! - `frame_id`: 6 位滚动帧序号（每个会话一份）
//! - `assembler`: 字节流 → 完整帧的重组器
//!
//! ## 帧格式
//!
//! ```text
//! [header:1][frameId:1][state:1][length:BCD][command:1][version:1][payload..][crc16:2]
//! ```
//!
//! - `length` 为 BCD 编码，表示从 length 字段之后到帧尾（含 crc）的字节数
//! - `crc16` 覆盖字节 `[1, len-3]`，大端存放
//! - 超过 10 KiB 的帧跳过校验（性能考虑，保持与现网设备一致）

pub mod assembler;
pub mod bcd;
pub mod crc;
pub mod frame;
pub mod frame_id;

pub use assembler::FrameAssembler;
pub use bcd::{decode_bcd, encode_bcd};
pub use crc::crc16;
pub use frame::{FrameLayout, FrameView, DEFAULT_HEADER, CHECKSUM_LIMIT};
pub use frame_id::{FrameIdSequence, FRAME_ID_MASK};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid header byte: 0x{actual:02X} (expected 0x{expected:02X})")]
    InvalidHeader { expected: u8, actual: u8 },

    #[error("Invalid BCD digit in byte 0x{byte:02X}")]
    InvalidBcd { byte: u8 },

    #[error("Value {value} does not fit into {digits} BCD digits")]
    BcdOverflow { value: u64, digits: u8 },

    #[error("Unsupported BCD width: {digits} digits (expected an even count in 2..=8)")]
    UnsupportedLengthDigits { digits: u8 },

    #[error("Length field mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },
}
