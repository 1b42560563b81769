//! 采样器（连接健康状态机）
//!
//! 挂在指令池上的 [`PoolHooks`]：
//!
//! - 链路首次打开后，每个采样周期入队一次采样指令
//! - 连续失败计数达到阈值时判定 Offline，触发重连，采样周期退避到恢复周期
//! - 任意一次成功往返恢复 Online，并重置计数与周期
//!
//! 少于阈值的偶发失败不会改变状态。

use crate::config::SamplerDescription;
use crate::device::Device;
use crate::instruction::InstructionDescription;
use crate::pool::{InstructionPool, PoolHooks, Priority};
use crate::status::DeviceStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 健康检测
pub struct HealthMonitor {
    description: SamplerDescription,
    failures: AtomicU32,
    interval_ms: AtomicU64,
    last_sample: Mutex<Option<Instant>>,
}

impl HealthMonitor {
    pub fn new(description: SamplerDescription) -> Self {
        let interval_ms = description.sample_interval_ms;
        Self {
            description,
            failures: AtomicU32::new(0),
            interval_ms: AtomicU64::new(interval_ms),
            last_sample: Mutex::new(None),
        }
    }

    pub fn description(&self) -> &SamplerDescription {
        &self.description
    }

    /// 当前连续失败次数
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// 当前采样周期（离线时为恢复周期）
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// 到期则占用本轮采样
    fn sample_due(&self) -> bool {
        let mut last = self.last_sample.lock();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= self.current_interval(),
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    fn on_success(&self, device: &Device) {
        self.failures.store(0, Ordering::Release);
        self.interval_ms
            .store(self.description.sample_interval_ms, Ordering::Release);
        device.update_status(DeviceStatus::Online);
    }

    fn on_failure(&self, device: &Device, instruction: Option<&str>) {
        let threshold = self.description.detection_count.max(1);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        trace!("Device {}: failure {}/{}", device.name(), failures, threshold);
        if failures < threshold {
            return;
        }

        if failures == threshold {
            warn!(
                "Device {}: {} consecutive failures, marking offline",
                device.name(),
                failures
            );
            self.interval_ms
                .store(self.description.resume_interval_ms, Ordering::Release);
        }
        device.update_status(DeviceStatus::Offline);

        let sampling = instruction.is_none_or(|name| name == self.description.sample_instruction);
        let channel = device.channel();
        if sampling && channel.reopenable() {
            debug!("Device {}: reopening {}", device.name(), channel.key());
            channel.reopen();
        }
    }
}

impl PoolHooks for HealthMonitor {
    fn before_drain(&self, pool: &InstructionPool) {
        let device = pool.device();
        if !device.channel().has_opened() || device.status() == DeviceStatus::Disabled {
            return;
        }
        if !self.sample_due() {
            return;
        }
        if !device.channel().connected() {
            // 队列非空时本轮丢弃整批并上报一次失败，这里不再重复计数
            if pool.pending_len() == 0 {
                self.error_handle(device, Some(&self.description.sample_instruction), true);
            }
            return;
        }
        let sample = InstructionDescription::new(self.description.sample_instruction.clone());
        if pool.add_instruction(sample, Priority::Normal).is_none() {
            debug!("Device {}: sample not queued", device.name());
        }
    }

    fn error_handle(&self, device: &Device, instruction: Option<&str>, failed: bool) {
        if device.status() == DeviceStatus::Disabled {
            return;
        }
        if failed {
            self.on_failure(device, instruction);
        } else {
            self.on_success(device);
        }
    }
}
