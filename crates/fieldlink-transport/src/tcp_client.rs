//! TCP 客户端

use crate::{ChannelDescription, Endpoint, Interactive, TransportError, sockopt};
use parking_lot::RwLock;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// TCP 客户端链路
///
/// 连接以 `Arc<TcpStream>` 持有：接收线程阻塞读取时，发送方仍可通过 `&TcpStream` 并发写入。
pub struct TcpClient {
    description: ChannelDescription,
    stream: RwLock<Option<Arc<TcpStream>>>,
    /// 读写过程中检测到断线
    broken: AtomicBool,
}

impl TcpClient {
    pub fn new(description: ChannelDescription) -> Self {
        Self {
            description,
            stream: RwLock::new(None),
            broken: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Result<Arc<TcpStream>, TransportError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.stream.read().clone().ok_or(TransportError::NotConnected)
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let desc = &self.description;
        let addr = Endpoint::new(desc.address.clone(), desc.port).to_socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, desc.open_timeout())?;
        stream.set_nodelay(desc.no_delay)?;
        sockopt::set_buffer_sizes(&stream, desc.send_buffer_size, desc.receive_buffer_size);
        if desc.blocking {
            if desc.send_timeout_ms > 0 {
                stream.set_write_timeout(Some(desc.send_timeout()))?;
            }
        } else {
            stream.set_nonblocking(true)?;
        }
        Ok(stream)
    }

    fn mark_broken(&self, err: &TransportError) {
        if err.is_disconnect() && !self.broken.swap(true, Ordering::AcqRel) {
            warn!(
                "TCP link {} lost: {}",
                self.description.display_name(),
                err
            );
        }
    }
}

impl Interactive for TcpClient {
    fn description(&self) -> &ChannelDescription {
        &self.description
    }

    fn open(&self) -> bool {
        self.close();
        match self.connect() {
            Ok(stream) => {
                info!(
                    "TCP client connected to {}:{}",
                    self.description.address, self.description.port
                );
                *self.stream.write() = Some(Arc::new(stream));
                self.broken.store(false, Ordering::Release);
                true
            },
            Err(e) => {
                warn!(
                    "TCP client failed to connect to {}:{}: {}",
                    self.description.address, self.description.port, e
                );
                false
            },
        }
    }

    fn close(&self) {
        if let Some(stream) = self.stream.write().take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("TCP client {} closed", self.description.display_name());
        }
    }

    fn connected(&self) -> bool {
        !self.broken.load(Ordering::Acquire) && self.stream.read().is_some()
    }

    fn available(&self) -> usize {
        match self.stream.read().as_ref() {
            Some(stream) => sockopt::bytes_available(stream.as_ref()),
            None => 0,
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.current()?;
        match (&*stream).write_all(data) {
            Ok(()) => {
                trace!("TCP sent {} bytes", data.len());
                Ok(data.len())
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout)
            },
            Err(e) => {
                let err = TransportError::Io(e);
                self.mark_broken(&err);
                Err(err)
            },
        }
    }

    fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let stream = self.current()?;
        if self.description.blocking {
            let timeout = timeout
                .unwrap_or_else(|| self.description.receive_timeout())
                .max(Duration::from_millis(1));
            stream.set_read_timeout(Some(timeout))?;
        }

        match (&*stream).read(buffer) {
            Ok(0) => {
                let err = TransportError::Disconnected;
                self.mark_broken(&err);
                Err(err)
            },
            Ok(n) => {
                trace!("TCP received {} bytes", n);
                Ok(n)
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                let err = TransportError::Io(e);
                self.mark_broken(&err);
                Err(err)
            },
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.stream
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

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}
