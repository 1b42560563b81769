//! UDP 客户端（connect 到固定对端）

use crate::{ChannelDescription, Endpoint, Interactive, TransportError, sockopt};
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

/// UDP 链路
pub struct UdpClient {
    description: ChannelDescription,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpClient {
    pub fn new(description: ChannelDescription) -> Self {
        Self {
            description,
            socket: RwLock::new(None),
        }
    }

    fn current(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket.read().clone().ok_or(TransportError::NotConnected)
    }

    fn bind_and_connect(&self) -> std::io::Result<UdpSocket> {
        let desc = &self.description;
        let remote = Endpoint::new(desc.address.clone(), desc.port).to_socket_addr()?;
        let local: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().map_err(std::io::Error::other)?
        } else {
            "0.0.0.0:0".parse().map_err(std::io::Error::other)?
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        sockopt::set_buffer_sizes(&socket, desc.send_buffer_size, desc.receive_buffer_size);
        if desc.blocking {
            if desc.send_timeout_ms > 0 {
                socket.set_write_timeout(Some(desc.send_timeout()))?;
            }
        } else {
            socket.set_nonblocking(true)?;
        }
        Ok(socket)
    }
}

impl Interactive for UdpClient {
    fn description(&self) -> &ChannelDescription {
        &self.description
    }

    fn open(&self) -> bool {
        self.close();
        match self.bind_and_connect() {
            Ok(socket) => {
                info!(
                    "UDP link to {}:{} ready",
                    self.description.address, self.description.port
                );
                *self.socket.write() = Some(Arc::new(socket));
                true
            },
            Err(e) => {
                warn!(
                    "UDP link to {}:{} failed: {}",
                    self.description.address, self.description.port, e
                );
                false
            },
        }
    }

    fn close(&self) {
        self.socket.write().take();
    }

    fn connected(&self) -> bool {
        self.socket.read().is_some()
    }

    fn available(&self) -> usize {
        match self.socket.read().as_ref() {
            Some(socket) => sockopt::bytes_available(socket.as_ref()),
            None => 0,
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let socket = self.current()?;
        match socket.send(data) {
            Ok(n) => {
                trace!("UDP sent {} bytes", n);
                Ok(n)
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout)
            },
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let socket = self.current()?;
        if self.description.blocking {
            let timeout = timeout
                .unwrap_or_else(|| self.description.receive_timeout())
                .max(Duration::from_millis(1));
            socket.set_read_timeout(Some(timeout))?;
        }
        match socket.recv(buffer) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            // 对端端口不可达（ICMP），链路本身仍然可用
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.socket
            .read()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(Endpoint::from)
            .unwrap_or_default()
    }

    fn peer_endpoint(&self) -> Endpoint {
        Endpoint::new(self.description.address.clone(), self.description.port)
    }
}
