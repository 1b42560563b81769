//! # Fieldlink Transport Layer
//!
//! 传输层抽象，为上层提供统一的 `Interactive` 接口：
//!
//! | 变体 | 说明 |
//! |---|---|
//! | `TcpClient` | TCP 客户端 |
//! | `TcpServer` | TCP 服务端，mio 事件循环（epoll/kqueue/IOCP）分发多连接 |
//! | `UdpClient` | UDP（connect 到固定对端） |
//! | `UdpServer` | UDP 服务端，按源地址区分对端 |
//! | `SerialInteractive` | 串口 |
//! | `BluetoothClient` / `BluetoothServer` | RFCOMM（仅 Linux） |
//!
//! 发送/接收在稳态下不会 panic，也不会把 IO 错误抛给应用：
//! 失败以 `Err(TransportError)` / `Ok(0)` 返回，由上层折算为设备健康状态。
//! 只有构造阶段的配置错误会直接失败（见 [`build_interactive`]）。

pub mod bluetooth;
pub mod config;
pub mod endpoint;
pub mod hooks;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
mod sockopt;
pub mod tcp_client;
pub mod tcp_server;
pub mod thread_util;
pub mod udp;
pub mod udp_server;

pub use bluetooth::{BluetoothClient, BluetoothServer};
pub use config::{
    ChannelDescription, DataBits, FlowControl, Parity, SerialSettings, StopBits, StrategyKind,
    TlsFiles, TransportKind,
};
pub use endpoint::Endpoint;
pub use hooks::{PeerCallback, ServerHooks};
#[cfg(feature = "serial")]
pub use serial::SerialInteractive;
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use udp::UdpClient;
pub use udp_server::UdpServer;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed by peer")]
    Disconnected,
    #[error("Send timeout")]
    Timeout,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// 是否意味着链路已断开
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::NotConnected | TransportError::Disconnected => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// 传输能力接口
///
/// 所有方法都以 `&self` 调用，实现者自行处理内部同步，
/// 以便接收线程阻塞读取时，发送线程仍可并发写入。
pub trait Interactive: Send + Sync {
    /// 静态配置
    fn description(&self) -> &ChannelDescription;

    /// 打开链路（服务端为绑定+监听）
    fn open(&self) -> bool;

    /// 关闭链路
    fn close(&self);

    /// 链路是否可用
    fn connected(&self) -> bool;

    /// 内核缓冲区中可读字节数
    fn available(&self) -> usize {
        0
    }

    /// 发送数据，返回写入的字节数
    fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// 接收数据
    ///
    /// - `timeout = None`: 阻塞模式使用配置的 `receive_timeout`，非阻塞模式立即返回
    /// - 返回 `Ok(0)` 表示超时/无数据
    fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError>;

    /// 本端地址
    fn local_endpoint(&self) -> Endpoint {
        Endpoint::empty()
    }

    /// 对端地址
    fn peer_endpoint(&self) -> Endpoint {
        Endpoint::empty()
    }

    /// 数据是否由传输层主动推送（服务端的对端链路）
    ///
    /// 推送型链路不应再由上层起接收线程轮询。
    fn is_push(&self) -> bool {
        false
    }

    /// 服务端能力（非服务端返回 `None`）
    fn as_server(&self) -> Option<&dyn ServerInteractive> {
        None
    }
}

/// 服务端额外能力：管理多个对端
pub trait ServerInteractive: Send + Sync {
    /// 当前对端数量
    fn client_count(&self) -> usize;

    /// 当前所有对端地址
    fn clients(&self) -> Vec<Endpoint>;

    /// 按对端地址取链路
    fn get_client(&self, peer: &Endpoint) -> Option<Arc<dyn Interactive>>;

    /// 标记关闭某个对端（由清理定时器实际移除）
    fn close_client(&self, peer: &Endpoint) -> bool;

    /// accept/close 通知
    fn hooks(&self) -> &ServerHooks;
}

/// 对端数据处理器
///
/// 每个对端一个实例，由 [`PeerHandlerFactory`] 在 accept 时创建。
pub trait PeerHandler: Send + Sync {
    /// 收到对端字节（可能是不完整帧，由处理器自行重组）
    fn on_data(&self, data: &[u8]);

    /// 对端被移除
    fn on_closed(&self) {}
}

/// 对端处理器工厂
pub trait PeerHandlerFactory: Send + Sync {
    /// 为新对端创建处理器
    ///
    /// # 参数
    /// - `peer`: 对端地址
    /// - `link`: 指向该对端的链路，处理器通过它回发数据
    fn create(&self, peer: &Endpoint, link: Arc<dyn Interactive>) -> Arc<dyn PeerHandler>;
}

/// 丢弃所有数据的处理器（未配置工厂时使用）
pub struct DiscardHandler;

impl PeerHandler for DiscardHandler {
    fn on_data(&self, data: &[u8]) {
        tracing::trace!("Discarding {} bytes (no peer handler installed)", data.len());
    }
}

/// 默认工厂
pub struct DiscardFactory;

impl PeerHandlerFactory for DiscardFactory {
    fn create(&self, _peer: &Endpoint, _link: Arc<dyn Interactive>) -> Arc<dyn PeerHandler> {
        Arc::new(DiscardHandler)
    }
}

/// 按配置构造传输实例
///
/// 配置错误（缺少地址、TLS 文件不可读等）在这里直接返回错误，不会重试。
///
/// # 参数
/// - `description`: 链路配置
/// - `factory`: 服务端对端处理器工厂（客户端类传输忽略）
pub fn build_interactive(
    description: &ChannelDescription,
    factory: Option<Arc<dyn PeerHandlerFactory>>,
) -> Result<Arc<dyn Interactive>, TransportError> {
    description.validate()?;
    let factory =
        factory.unwrap_or_else(|| Arc::new(DiscardFactory) as Arc<dyn PeerHandlerFactory>);

    let interactive: Arc<dyn Interactive> = match description.kind {
        TransportKind::TcpClient => Arc::new(TcpClient::new(description.clone())),
        TransportKind::TcpServer => Arc::new(TcpServer::new(description.clone(), factory)?),
        TransportKind::Udp => Arc::new(UdpClient::new(description.clone())),
        TransportKind::UdpServer => Arc::new(UdpServer::new(description.clone(), factory)),
        TransportKind::Serial => build_serial(description)?,
        TransportKind::Bluetooth => Arc::new(BluetoothClient::new(description.clone())?),
        TransportKind::BluetoothServer => {
            Arc::new(BluetoothServer::new(description.clone(), factory)?)
        },
    };
    Ok(interactive)
}

#[cfg(feature = "serial")]
fn build_serial(description: &ChannelDescription) -> Result<Arc<dyn Interactive>, TransportError> {
    Ok(Arc::new(SerialInteractive::new(description.clone())))
}

#[cfg(not(feature = "serial"))]
fn build_serial(_description: &ChannelDescription) -> Result<Arc<dyn Interactive>, TransportError> {
    Err(TransportError::Unsupported(
        "serial support disabled (enable the `serial` feature)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::NotConnected.is_disconnect());
        assert!(TransportError::Disconnected.is_disconnect());
        assert!(
            TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                .is_disconnect()
        );
        assert!(!TransportError::Timeout.is_disconnect());
        assert!(
            !TransportError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock))
                .is_disconnect()
        );
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let description = ChannelDescription {
            kind: TransportKind::TcpClient,
            address: String::new(),
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            build_interactive(&description, None),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_build_tcp_client() {
        let description = ChannelDescription::tcp_client("127.0.0.1", 9);
        let interactive = build_interactive(&description, None).unwrap();
        assert!(!interactive.connected());
        assert!(interactive.as_server().is_none());
    }
}
