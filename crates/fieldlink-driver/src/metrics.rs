//! 指令池指标
//!
//! 原子计数器，任何线程都可以无锁读取。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 指令池实时指标
///
/// # 使用示例
///
/// ```rust
/// use fieldlink_driver::PoolMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = PoolMetrics::default();
/// metrics.enqueued.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().enqueued, 1);
/// ```
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// 成功入队的指令数
    pub enqueued: AtomicU64,

    /// 入队被拒绝的指令数（链路断开或队列已满）
    pub rejected: AtomicU64,

    /// 已执行的指令数（含失败）
    pub executed: AtomicU64,

    /// 执行失败的指令数（无结果或上下文带异常）
    pub failed: AtomicU64,

    /// 因链路断开被丢弃、未执行的指令数
    pub discarded: AtomicU64,

    /// 同步执行等待超时次数
    pub sync_timeouts: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取快照
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            sync_timeouts: self.sync_timeouts.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.enqueued.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.executed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.discarded.store(0, Ordering::Relaxed);
        self.sync_timeouts.store(0, Ordering::Relaxed);
    }
}

/// 指令池指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub executed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub sync_timeouts: u64,
}

impl PoolMetricsSnapshot {
    /// 执行失败率（百分比）
    pub fn failure_rate(&self) -> f64 {
        if self.executed == 0 {
            return 0.0;
        }
        (self.failed as f64 / self.executed as f64) * 100.0
    }

    /// 入队拒绝率（百分比）
    pub fn rejection_rate(&self) -> f64 {
        let offered = self.enqueued + self.rejected;
        if offered == 0 {
            return 0.0;
        }
        (self.rejected as f64 / offered as f64) * 100.0
    }
}
