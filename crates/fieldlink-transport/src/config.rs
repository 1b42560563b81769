//! 链路配置
//!
//! POD 风格：所有时间以 `*_ms` 整数表示，通过访问器转换为 `Duration`。

use crate::TransportError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 传输介质
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    TcpClient,
    TcpServer,
    Udp,
    UdpServer,
    Serial,
    Bluetooth,
    BluetoothServer,
}

impl TransportKind {
    /// 是否为服务端（一个链路服务多个对端）
    pub fn is_server(self) -> bool {
        matches!(
            self,
            TransportKind::TcpServer | TransportKind::UdpServer | TransportKind::BluetoothServer
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::TcpClient => "tcp_client",
            TransportKind::TcpServer => "tcp_server",
            TransportKind::Udp => "udp",
            TransportKind::UdpServer => "udp_server",
            TransportKind::Serial => "serial",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::BluetoothServer => "bluetooth_server",
        }
    }
}

/// 接收/发送策略
///
/// - `Async`: 独立定时线程轮询
/// - `Sync`: 由事件循环直接推送 / 调用线程直接写
/// - `Multiplexing`: 所有对端共享一个定时线程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Async,
    #[default]
    Sync,
    Multiplexing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// 串口参数（`address` 字段为设备路径，如 `/dev/ttyUSB0`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// TLS 证书材料（仅 TCP 服务端）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    /// 配置后要求客户端证书
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// 链路静态配置
///
/// # Example
///
/// ```
/// use fieldlink_transport::{ChannelDescription, StrategyKind};
///
/// let mut desc = ChannelDescription::tcp_server("127.0.0.1", 0);
/// desc.max_connections = 5;
/// desc.receiver = StrategyKind::Sync;
/// assert!(desc.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDescription {
    /// 可选名称（日志与线程名）
    pub name: Option<String>,
    pub kind: TransportKind,
    /// IP/主机名、串口路径或蓝牙地址
    pub address: String,
    /// 端口（蓝牙为 RFCOMM 通道号）
    pub port: u16,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub reuse_address: bool,
    /// 0 表示使用系统默认
    pub send_buffer_size: usize,
    /// 0 表示使用系统默认（读缓冲区为 4096）
    pub receive_buffer_size: usize,
    pub no_delay: bool,
    pub blocking: bool,
    pub receiver: StrategyKind,
    pub sender: StrategyKind,
    pub max_connections: usize,
    /// 对端空闲超时（0 表示不检测）
    pub idle_timeout_ms: u64,
    /// 断线后是否允许自动重连
    pub reopen: bool,
    pub bind_attempts: u32,
    pub bind_retry_delay_ms: u64,
    /// 断开对端清理周期
    pub sweep_interval_ms: u64,
    /// 对端标记删除后的宽限期
    pub delete_grace_ms: u64,
    /// 异步/多路复用策略的轮询周期
    pub poll_interval_ms: u64,
    pub tls: Option<TlsFiles>,
    pub serial: Option<SerialSettings>,
}

impl Default for ChannelDescription {
    fn default() -> Self {
        Self {
            name: None,
            kind: TransportKind::TcpClient,
            address: String::new(),
            port: 0,
            send_timeout_ms: 3000,
            receive_timeout_ms: 3000,
            open_timeout_ms: 3000,
            close_timeout_ms: 1000,
            reuse_address: true,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            no_delay: true,
            blocking: true,
            receiver: StrategyKind::Sync,
            sender: StrategyKind::Sync,
            max_connections: 1024,
            idle_timeout_ms: 0,
            reopen: true,
            bind_attempts: 5,
            bind_retry_delay_ms: 1000,
            sweep_interval_ms: 1000,
            delete_grace_ms: 100,
            poll_interval_ms: 10,
            tls: None,
            serial: None,
        }
    }
}

/// 默认读缓冲区大小
pub const DEFAULT_READ_BUFFER: usize = 4096;

impl ChannelDescription {
    fn with_kind(kind: TransportKind, address: &str, port: u16) -> Self {
        Self {
            kind,
            address: address.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn tcp_client(address: &str, port: u16) -> Self {
        Self::with_kind(TransportKind::TcpClient, address, port)
    }

    pub fn tcp_server(address: &str, port: u16) -> Self {
        Self::with_kind(TransportKind::TcpServer, address, port)
    }

    pub fn udp(address: &str, port: u16) -> Self {
        Self::with_kind(TransportKind::Udp, address, port)
    }

    pub fn udp_server(address: &str, port: u16) -> Self {
        Self::with_kind(TransportKind::UdpServer, address, port)
    }

    pub fn serial(path: &str, settings: SerialSettings) -> Self {
        Self {
            serial: Some(settings),
            ..Self::with_kind(TransportKind::Serial, path, 0)
        }
    }

    pub fn bluetooth(address: &str, channel: u8) -> Self {
        Self::with_kind(TransportKind::Bluetooth, address, channel as u16)
    }

    pub fn bluetooth_server(address: &str, channel: u8) -> Self {
        Self::with_kind(TransportKind::BluetoothServer, address, channel as u16)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// 空闲超时（`None` 表示不检测）
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// 实际使用的读缓冲区大小
    pub fn read_buffer_size(&self) -> usize {
        if self.receive_buffer_size > 0 {
            self.receive_buffer_size
        } else {
            DEFAULT_READ_BUFFER
        }
    }

    /// 唯一标识（同一管理器内相同 key 的设备共享一个 Channel）
    pub fn key(&self) -> String {
        format!("{}://{}:{}", self.kind.as_str(), self.address, self.port)
    }

    /// 日志/线程名
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.address, self.port),
        }
    }

    /// 校验配置
    ///
    /// # 错误
    /// - `TransportError::Config`: 缺少地址/端口、TLS 用在非 TCP 服务端、连接数为 0 等
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.address.trim().is_empty() {
            return Err(TransportError::Config(format!(
                "{} channel requires an address",
                self.kind.as_str()
            )));
        }
        match self.kind {
            TransportKind::TcpClient | TransportKind::Udp if self.port == 0 => {
                return Err(TransportError::Config(format!(
                    "{} channel {} requires a non-zero port",
                    self.kind.as_str(),
                    self.address
                )));
            },
            TransportKind::Bluetooth | TransportKind::BluetoothServer
                if self.port == 0 || self.port > 30 =>
            {
                return Err(TransportError::Config(format!(
                    "RFCOMM channel must be in 1..=30, got {}",
                    self.port
                )));
            },
            _ => {},
        }
        if self.tls.is_some() && self.kind != TransportKind::TcpServer {
            return Err(TransportError::Config(
                "TLS material is only supported on tcp_server channels".to_string(),
            ));
        }
        if self.kind.is_server() && self.max_connections == 0 {
            return Err(TransportError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.kind.is_server() && self.bind_attempts == 0 {
            return Err(TransportError::Config(
                "bind_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
