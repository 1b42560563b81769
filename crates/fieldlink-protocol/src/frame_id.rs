//! 帧序号
//!
//! 半双工链路上用 6 位滚动序号关联请求与应答。
//! 每个会话（一个逻辑对话，通常是一个 Device）持有独立的序号，
//! 不同连接之间互不干扰。

use std::sync::atomic::{AtomicU8, Ordering};

/// 帧序号掩码（6 位）
pub const FRAME_ID_MASK: u8 = 0x3F;

/// 尚未分配过序号
const NONE: u8 = 0xFF;

/// 6 位滚动帧序号
///
/// # Example
///
/// ```
/// use fieldlink_protocol::FrameIdSequence;
///
/// let seq = FrameIdSequence::new();
/// let id = seq.next_frame_id();
/// assert!(seq.is_same_frame_id(id));
/// ```
#[derive(Debug)]
pub struct FrameIdSequence {
    counter: AtomicU8,
    last: AtomicU8,
}

impl Default for FrameIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameIdSequence {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU8::new(0),
            last: AtomicU8::new(NONE),
        }
    }

    /// 取下一个帧序号（0..=63 循环）
    ///
    /// `u8` 在 256 处回绕，256 是 64 的整数倍，掩码后序列保持连续。
    pub fn next_frame_id(&self) -> u8 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) & FRAME_ID_MASK;
        self.last.store(id, Ordering::Relaxed);
        id
    }

    /// 最近一次分配的帧序号
    pub fn last_frame_id(&self) -> Option<u8> {
        match self.last.load(Ordering::Relaxed) {
            NONE => None,
            id => Some(id),
        }
    }

    /// 是否与最近一次分配的序号一致
    pub fn is_same_frame_id(&self, frame_id: u8) -> bool {
        self.last_frame_id() == Some(frame_id & FRAME_ID_MASK)
    }

    /// 重置（重连后调用）
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
        self.last.store(NONE, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wraps_at_64() {
        let seq = FrameIdSequence::new();
        let ids: Vec<u8> = (0..130).map(|_| seq.next_frame_id()).collect();

        assert_eq!(ids[0], 0);
        assert_eq!(ids[63], 63);
        assert_eq!(ids[64], 0);
        assert_eq!(ids[129], 1);
        assert!(ids.iter().all(|&id| id <= 63));
    }

    #[test]
    fn test_last_returned_value_is_accepted() {
        let seq = FrameIdSequence::new();
        assert!(!seq.is_same_frame_id(0));

        let mut last = 0;
        for _ in 0..200 {
            last = seq.next_frame_id();
        }
        assert!(seq.is_same_frame_id(last));
        assert!(!seq.is_same_frame_id((last + 1) & FRAME_ID_MASK));
    }

    #[test]
    fn test_sequences_are_independent() {
        let a = FrameIdSequence::new();
        let b = FrameIdSequence::new();
        for _ in 0..10 {
            a.next_frame_id();
        }
        assert_eq!(b.next_frame_id(), 0);
        assert_eq!(a.last_frame_id(), Some(9));
    }

    #[test]
    fn test_counter_consistent_across_u8_wrap() {
        let seq = FrameIdSequence::new();
        for n in 0..1000u32 {
            assert_eq!(seq.next_frame_id() as u32, n % 64);
        }
    }

    #[test]
    fn test_reset() {
        let seq = FrameIdSequence::new();
        seq.next_frame_id();
        seq.reset();
        assert_eq!(seq.last_frame_id(), None);
        assert_eq!(seq.next_frame_id(), 0);
    }
}
