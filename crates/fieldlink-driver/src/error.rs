//! 驱动层错误类型定义

use fieldlink_protocol::ProtocolError;
use fieldlink_transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// 配置错误
///
/// 构造阶段直接失败，不会重试。
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 读取配置文件失败
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML 解析失败
    #[error("Invalid fleet description: {0}")]
    Parse(#[from] toml::de::Error),

    /// 设备缺少名称
    #[error("Device #{0} has no name")]
    MissingName(usize),

    /// 设备名称重复
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),

    /// 未注册的指令集工厂
    #[error("Unknown instruction set factory: {0}")]
    UnknownFactory(String),

    /// 指令定义无效
    #[error("Invalid instruction `{name}`: {reason}")]
    InvalidInstruction { name: String, reason: String },

    /// 指令池配置无效
    #[error("Invalid pool for device `{device}`: {reason}")]
    InvalidPool { device: String, reason: String },

    /// 接收转发目标不存在
    #[error("Device `{device}` forwards to unknown device `{target}`")]
    UnknownForwardTarget { device: String, target: String },

    /// 链路配置无效
    #[error("Invalid channel for device `{device}`: {source}")]
    Channel {
        device: String,
        #[source]
        source: TransportError,
    },
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 传输错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// 链路未连接
    #[error("Channel not connected")]
    NotConnected,

    /// 设备已禁用
    #[error("Device `{0}` is disabled")]
    Disabled(String),

    /// 指令集中没有该指令
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),

    /// 未知设备
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// 服务端绑定失败（重试耗尽）
    #[error("Failed to bind {0}")]
    BindFailed(String),

    /// 设备返回非零状态
    #[error("Device reported state 0x{state:02X}")]
    Rejected { state: u8 },

    /// 无效输入（如上下文缺少必需字段）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 后台线程错误
    #[error("Worker thread error: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Protocol(ProtocolError::InvalidLength {
            expected: 9,
            actual: 4,
        });
        assert!(format!("{}", err).contains("Invalid frame length"));

        assert_eq!(format!("{}", DriverError::Timeout), "Operation timeout");
        assert_eq!(
            format!("{}", DriverError::Rejected { state: 0x1F }),
            "Device reported state 0x1F"
        );

        let err = DriverError::UnknownInstruction("sample".to_string());
        assert!(format!("{}", err).contains("sample"));
    }

    #[test]
    fn test_from_transport_error() {
        let err: DriverError = TransportError::NotConnected.into();
        assert!(matches!(err, DriverError::Transport(TransportError::NotConnected)));
    }

    #[test]
    fn test_from_config_error() {
        let err: DriverError = ConfigError::UnknownFactory("modbus".to_string()).into();
        match err {
            DriverError::Config(ConfigError::UnknownFactory(name)) => assert_eq!(name, "modbus"),
            other => panic!("Expected Config variant, got {:?}", other),
        }
    }
}
