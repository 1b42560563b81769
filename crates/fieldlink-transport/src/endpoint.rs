//! 网络端点（地址 + 端口）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// 网络对端标识
///
/// 按值比较；`Endpoint::empty()` 表示“未设置”。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// 空端点
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.port == 0
    }

    /// 解析为 `SocketAddr`（支持主机名）
    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", self),
                )
            })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoint() {
        assert!(Endpoint::empty().is_empty());
        assert!(!Endpoint::new("127.0.0.1", 0).is_empty());
    }

    #[test]
    fn test_from_socket_addr_and_display() {
        let addr: SocketAddr = "192.168.1.7:9000".parse().unwrap();
        let endpoint = Endpoint::from(addr);
        assert_eq!(endpoint, Endpoint::new("192.168.1.7", 9000));
        assert_eq!(endpoint.to_string(), "192.168.1.7:9000");
        assert_eq!(endpoint.to_socket_addr().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_display() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(Endpoint::from(addr).to_string(), "[::1]:80");
    }
}
