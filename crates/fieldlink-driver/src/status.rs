//! 设备状态
//!
//! 状态转换规则集中在这里：
//!
//! - 健康检测只会在 `Unknown` / `Online` / `Offline` 之间切换
//! - `Disabled` 是粘性状态，只有 [`AtomicDeviceStatus::enable`] 能离开
//! - 目标状态与当前状态相同时不算转换，不触发通知

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceStatus {
    /// 尚未完成过一次成功往返（默认）
    #[default]
    Unknown = 0,
    /// 连续失败达到阈值
    Offline = 1,
    /// 最近一次往返成功
    Online = 2,
    /// 被应用禁用
    Disabled = 3,
}

impl DeviceStatus {
    /// 从 u8 转换，无效值视为 Unknown
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Offline,
            2 => Self::Online,
            3 => Self::Disabled,
            _ => Self::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }

    /// 计算一次健康更新后的新状态
    ///
    /// 返回 `None` 表示不发生转换。
    pub fn transition(self, requested: DeviceStatus) -> Option<DeviceStatus> {
        if self == requested || self == Self::Disabled || requested == Self::Disabled {
            return None;
        }
        Some(requested)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Online => "online",
            DeviceStatus::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// 一次状态转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device: String,
    pub old: DeviceStatus,
    pub new: DeviceStatus,
}

/// 设备状态（原子版本，健康检测线程与应用线程共享）
#[derive(Debug, Default)]
pub struct AtomicDeviceStatus {
    inner: AtomicU8,
}

impl AtomicDeviceStatus {
    pub fn new(status: DeviceStatus) -> Self {
        Self {
            inner: AtomicU8::new(status.as_u8()),
        }
    }

    pub fn get(&self) -> DeviceStatus {
        DeviceStatus::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// 按 [`DeviceStatus::transition`] 规则更新
    ///
    /// 返回 `(old, new)`，未发生转换时返回 `None`。
    pub fn update(&self, requested: DeviceStatus) -> Option<(DeviceStatus, DeviceStatus)> {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            let old = DeviceStatus::from_u8(current);
            let new = old.transition(requested)?;
            match self.inner.compare_exchange(
                current,
                new.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((old, new)),
                Err(actual) => current = actual,
            }
        }
    }

    /// 禁用（任何状态 → Disabled）
    pub fn disable(&self) -> Option<(DeviceStatus, DeviceStatus)> {
        let old = DeviceStatus::from_u8(
            self.inner
                .swap(DeviceStatus::Disabled.as_u8(), Ordering::AcqRel),
        );
        (old != DeviceStatus::Disabled).then_some((old, DeviceStatus::Disabled))
    }

    /// 启用（Disabled → Unknown，其他状态不变）
    pub fn enable(&self) -> Option<(DeviceStatus, DeviceStatus)> {
        self.inner
            .compare_exchange(
                DeviceStatus::Disabled.as_u8(),
                DeviceStatus::Unknown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| (DeviceStatus::Disabled, DeviceStatus::Unknown))
    }
}
