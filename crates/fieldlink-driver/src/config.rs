//! 配置
//!
//! 所有描述都是纯数据（POD），带 `Default`，时长以 `*_ms` 整数表示。
//!
//! ```toml
//! [[devices]]
//! name = "meter-1"
//!
//! [devices.channel]
//! kind = "tcp_client"
//! address = "10.0.0.12"
//! port = 9000
//!
//! [devices.instruction_set]
//! layout = { header = 0xAA, length_digits = 4 }
//! instructions = [
//!     { name = "sample", command = 0x01 },
//!     { name = "read", command = 0x02, timeout_ms = 500 },
//! ]
//!
//! [devices.pool]
//! tick_interval_ms = 20
//! sampler = { sample_interval_ms = 3000 }
//! ```

use crate::error::ConfigError;
use fieldlink_protocol::{FrameLayout, ProtocolError, DEFAULT_HEADER};
use fieldlink_transport::ChannelDescription;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 内置帧协议指令集工厂名
pub const FRAME_FACTORY: &str = "frame";

/// 健康检测配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerDescription {
    /// 正常采样周期
    pub sample_interval_ms: u64,
    /// 离线后的采样（重连）周期
    pub resume_interval_ms: u64,
    /// 连续失败多少次判定离线
    pub detection_count: u32,
    /// 采样指令名
    pub sample_instruction: String,
}

impl Default for SamplerDescription {
    fn default() -> Self {
        Self {
            sample_interval_ms: 3000,
            resume_interval_ms: 10_000,
            detection_count: 3,
            sample_instruction: "sample".to_string(),
        }
    }
}

impl SamplerDescription {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn resume_interval(&self) -> Duration {
        Duration::from_millis(self.resume_interval_ms)
    }
}

/// 指令池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDescription {
    /// 队列排空周期
    pub tick_interval_ms: u64,
    /// 同一批次内按优先级排序（稳定排序，同优先级保持入队顺序）
    pub priority_sort: bool,
    /// 队列上限
    pub max_pending: usize,
    /// 健康检测（`None` 为普通指令池）
    pub sampler: Option<SamplerDescription>,
}

impl Default for PoolDescription {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            priority_sort: false,
            max_pending: 256,
            sampler: None,
        }
    }
}

impl PoolDescription {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// 帧布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutDescription {
    pub header: u8,
    pub length_digits: u8,
    /// 0 表示使用默认上限
    pub max_frame_len: usize,
}

impl Default for LayoutDescription {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER,
            length_digits: 4,
            max_frame_len: 0,
        }
    }
}

impl LayoutDescription {
    pub fn to_layout(&self) -> Result<FrameLayout, ProtocolError> {
        let layout = FrameLayout::new(self.header, self.length_digits)?;
        Ok(if self.max_frame_len > 0 {
            layout.with_max_frame_len(self.max_frame_len)
        } else {
            layout
        })
    }
}

/// 一条帧协议指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionEntry {
    pub name: String,
    pub command: u8,
    pub version: u8,
    pub timeout_ms: Option<u64>,
    pub expects_reply: bool,
    pub check_frame_id: bool,
}

impl Default for InstructionEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: 0,
            version: 0,
            timeout_ms: None,
            expects_reply: true,
            check_frame_id: true,
        }
    }
}

impl InstructionEntry {
    pub fn new(name: impl Into<String>, command: u8) -> Self {
        Self {
            name: name.into(),
            command,
            ..Default::default()
        }
    }
}

/// 指令集配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionSetDescription {
    /// 工厂名（见 `DriverManagerBuilder::factory`）
    pub factory: String,
    pub layout: LayoutDescription,
    pub instructions: Vec<InstructionEntry>,
}

impl Default for InstructionSetDescription {
    fn default() -> Self {
        Self {
            factory: FRAME_FACTORY.to_string(),
            layout: LayoutDescription::default(),
            instructions: Vec::new(),
        }
    }
}

/// 设备配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub channel: ChannelDescription,
    #[serde(default)]
    pub instruction_set: InstructionSetDescription,
    #[serde(default)]
    pub pool: PoolDescription,
    /// 接收转发目标（设备名）
    #[serde(default)]
    pub forward_to: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl DeviceDescription {
    pub fn new(name: impl Into<String>, channel: ChannelDescription) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            channel,
            instruction_set: InstructionSetDescription::default(),
            pool: PoolDescription::default(),
            forward_to: Vec::new(),
        }
    }
}

/// 整个设备集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetDescription {
    #[serde(default)]
    pub devices: Vec<DeviceDescription>,
}

impl FleetDescription {
    pub fn new(devices: Vec<DeviceDescription>) -> Self {
        Self { devices }
    }

    /// 解析 TOML 并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let fleet: FleetDescription = toml::from_str(text)?;
        fleet.validate()?;
        Ok(fleet)
    }

    /// 从文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceDescription> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// 校验配置
    ///
    /// 工厂名是否已注册在打开时检查。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.is_empty() {
                return Err(ConfigError::MissingName(index));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            device
                .channel
                .validate()
                .map_err(|source| ConfigError::Channel {
                    device: device.name.clone(),
                    source,
                })?;
            validate_instructions(device)?;
            validate_pool(device)?;
        }
        for device in &self.devices {
            for target in &device.forward_to {
                if !names.contains(target.as_str()) {
                    return Err(ConfigError::UnknownForwardTarget {
                        device: device.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn validate_instructions(device: &DeviceDescription) -> Result<(), ConfigError> {
    let set = &device.instruction_set;
    if set.factory != FRAME_FACTORY {
        return Ok(());
    }
    set.layout
        .to_layout()
        .map_err(|e| ConfigError::InvalidInstruction {
            name: format!("{}/layout", device.name),
            reason: e.to_string(),
        })?;
    let mut names = HashSet::new();
    for entry in &set.instructions {
        if entry.name.is_empty() {
            return Err(ConfigError::InvalidInstruction {
                name: format!("{}/#{}", device.name, names.len()),
                reason: "missing name".to_string(),
            });
        }
        if !names.insert(entry.name.as_str()) {
            return Err(ConfigError::InvalidInstruction {
                name: entry.name.clone(),
                reason: "duplicate name".to_string(),
            });
        }
    }
    if let Some(sampler) = &device.pool.sampler
        && !names.contains(sampler.sample_instruction.as_str())
    {
        return Err(ConfigError::InvalidInstruction {
            name: sampler.sample_instruction.clone(),
            reason: format!("sample instruction not defined for `{}`", device.name),
        });
    }
    Ok(())
}

fn validate_pool(device: &DeviceDescription) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPool {
        device: device.name.clone(),
        reason: reason.to_string(),
    };
    if device.pool.max_pending == 0 {
        return Err(invalid("max_pending must be positive"));
    }
    if let Some(sampler) = &device.pool.sampler {
        if sampler.detection_count == 0 {
            return Err(invalid("detection_count must be positive"));
        }
        if sampler.sample_interval_ms == 0 || sampler.resume_interval_ms == 0 {
            return Err(invalid("sampler intervals must be positive"));
        }
    }
    Ok(())
}
