//! 帧重组器
//!
//! 从字节流中切出完整帧：按帧头重同步，读取 BCD 长度字段，
//! 字节不足时继续缓存。匹配逻辑永远只看到完整帧。

use crate::frame::FrameLayout;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

/// 帧重组器
///
/// # Example
///
/// ```
/// use fieldlink_protocol::{FrameAssembler, FrameLayout};
///
/// let layout = FrameLayout::default();
/// let frame = layout.encode(0, 0, 0x01, 0, &[1, 2, 3]).unwrap();
///
/// let mut assembler = FrameAssembler::new(layout);
/// assembler.push(&frame[..4]);
/// assert!(assembler.next_frame().is_none());
/// assembler.push(&frame[4..]);
/// assert_eq!(assembler.next_frame().unwrap().as_ref(), frame.as_slice());
/// ```
#[derive(Debug)]
pub struct FrameAssembler {
    layout: FrameLayout,
    buffer: BytesMut,
    /// 重同步时丢弃的字节数
    discarded: u64,
}

impl FrameAssembler {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            buffer: BytesMut::with_capacity(1024),
            discarded: 0,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// 追加收到的字节
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// 当前缓存字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 累计丢弃的字节数
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// 清空缓存（重连后调用）
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// 取出下一帧完整帧
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            // 1. 丢弃帧头之前的噪声
            match self.buffer.iter().position(|&b| b == self.layout.header) {
                Some(0) => {},
                Some(pos) => self.skip(pos),
                None => {
                    let len = self.buffer.len();
                    self.skip(len);
                    return None;
                },
            }

            // 2. 读取长度字段
            let total = match self.layout.declared_total_len(&self.buffer) {
                Ok(Some(total)) => total,
                Ok(None) => return None,
                Err(e) => {
                    trace!("Resync on bad length field: {}", e);
                    self.skip(1);
                    continue;
                },
            };

            if total < self.layout.min_frame_len() || total > self.layout.max_frame_len {
                trace!("Resync on implausible frame length {}", total);
                self.skip(1);
                continue;
            }

            // 3. 等待剩余字节
            if self.buffer.len() < total {
                return None;
            }

            return Some(self.buffer.split_to(total).freeze());
        }
    }

    /// 取出当前所有完整帧
    pub fn drain_frames(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn skip(&mut self, count: usize) {
        if count > 0 {
            self.buffer.advance(count);
            self.discarded += count as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        FrameLayout::default().encode(0, 0, 0x01, 0, payload).unwrap()
    }

    #[test]
    fn test_assembles_split_frame() {
        let f = frame(&[1, 2, 3, 4]);
        let mut assembler = FrameAssembler::new(FrameLayout::default());
        for byte in &f {
            assert!(assembler.next_frame().is_none());
            assembler.push(&[*byte]);
        }
        assert_eq!(assembler.next_frame().unwrap().as_ref(), f.as_slice());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_extracts_back_to_back_frames() {
        let a = frame(&[1]);
        let b = frame(&[2, 2]);
        let mut assembler = FrameAssembler::new(FrameLayout::default());
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        assembler.push(&stream);

        let frames = assembler.drain_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), a.as_slice());
        assert_eq!(frames[1].as_ref(), b.as_slice());
    }

    #[test]
    fn test_skips_leading_noise() {
        let f = frame(&[9, 9]);
        let mut assembler = FrameAssembler::new(FrameLayout::default());
        assembler.push(&[0x00, 0x13, 0x37]);
        assembler.push(&f);
        assert_eq!(assembler.next_frame().unwrap().as_ref(), f.as_slice());
        assert_eq!(assembler.discarded(), 3);
    }

    #[test]
    fn test_resyncs_after_bad_length() {
        let f = frame(&[7]);
        let mut assembler = FrameAssembler::new(FrameLayout::default());
        // 帧头后跟非法 BCD 长度
        assembler.push(&[0xAA, 0x00, 0x00, 0xFF, 0xFF]);
        assembler.push(&f);
        assert_eq!(assembler.next_frame().unwrap().as_ref(), f.as_slice());
    }

    #[test]
    fn test_corrupted_crc_still_delimited() {
        // 重组器只负责切帧，CRC 由匹配逻辑判定
        let mut f = frame(&[1, 2]);
        let last = f.len() - 1;
        f[last] ^= 0xFF;
        let mut assembler = FrameAssembler::new(FrameLayout::default());
        assembler.push(&f);
        assert_eq!(assembler.next_frame().unwrap().len(), f.len());
    }
}
