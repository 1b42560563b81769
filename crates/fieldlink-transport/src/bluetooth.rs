//! 蓝牙 RFCOMM 链路
//!
//! 仅 Linux（BlueZ 内核套接字）。其他平台构造时返回 `TransportError::Unsupported`。
//! 服务端没有就绪事件循环可用，采用“accept 线程 + 每对端接收线程”的回退方案，
//! 对外契约与 TCP 服务端一致。

use crate::{ChannelDescription, TransportError};

/// 解析 `XX:XX:XX:XX:XX:XX`，返回内核使用的小端字节序
pub fn parse_bdaddr(address: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = address.split(':');
    for slot in out.iter_mut().rev() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// `parse_bdaddr` 的逆过程
pub fn format_bdaddr(bdaddr: &[u8; 6]) -> String {
    bdaddr
        .iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn check_address(description: &ChannelDescription) -> Result<[u8; 6], TransportError> {
    parse_bdaddr(&description.address).ok_or_else(|| {
        TransportError::Config(format!(
            "invalid Bluetooth address '{}'",
            description.address
        ))
    })
}

#[cfg(target_os = "linux")]
mod rfcomm {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::time::Duration;

    const BTPROTO_RFCOMM: libc::c_int = 3;

    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    fn sockaddr(bdaddr: [u8; 6], channel: u8) -> SockaddrRc {
        SockaddrRc {
            rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: bdaddr,
            rc_channel: channel,
        }
    }

    fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    /// RFCOMM 流套接字
    pub(super) struct RfcommSocket {
        fd: OwnedFd,
    }

    impl RfcommSocket {
        pub(super) fn new() -> io::Result<Self> {
            // SAFETY: 参数均为常量，返回值在下方检查
            let fd = cvt(unsafe {
                libc::socket(
                    libc::AF_BLUETOOTH,
                    libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                    BTPROTO_RFCOMM,
                )
            })?;
            // SAFETY: fd 刚由 socket() 创建，由 OwnedFd 独占
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        fn raw(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            // SAFETY: fcntl 只读写文件状态标志
            let flags = cvt(unsafe { libc::fcntl(self.raw(), libc::F_GETFL) })?;
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            cvt(unsafe { libc::fcntl(self.raw(), libc::F_SETFL, flags) })?;
            Ok(())
        }

        /// 带超时的 connect
        pub(super) fn connect(&self, bdaddr: [u8; 6], channel: u8, timeout: Duration) -> io::Result<()> {
            let addr = sockaddr(bdaddr, channel);
            self.set_nonblocking(true)?;
            // SAFETY: addr 为正确布局的 sockaddr_rc
            let ret = unsafe {
                libc::connect(
                    self.raw(),
                    &addr as *const SockaddrRc as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINPROGRESS) {
                    return Err(err);
                }
                if !self.poll(libc::POLLOUT, Some(timeout))? {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "RFCOMM connect timeout"));
                }
                let mut so_error: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                // SAFETY: so_error/len 指向有效的栈变量
                cvt(unsafe {
                    libc::getsockopt(
                        self.raw(),
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut libc::c_int as *mut libc::c_void,
                        &mut len,
                    )
                })?;
                if so_error != 0 {
                    return Err(io::Error::from_raw_os_error(so_error));
                }
            }
            self.set_nonblocking(false)
        }

        pub(super) fn bind_listen(&self, bdaddr: [u8; 6], channel: u8, backlog: i32) -> io::Result<()> {
            let addr = sockaddr(bdaddr, channel);
            // SAFETY: addr 为正确布局的 sockaddr_rc
            cvt(unsafe {
                libc::bind(
                    self.raw(),
                    &addr as *const SockaddrRc as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
                )
            })?;
            cvt(unsafe { libc::listen(self.raw(), backlog) })?;
            Ok(())
        }

        pub(super) fn accept(&self) -> io::Result<(RfcommSocket, [u8; 6])> {
            let mut addr = sockaddr([0; 6], 0);
            let mut len = std::mem::size_of::<SockaddrRc>() as libc::socklen_t;
            // SAFETY: addr/len 指向有效的栈变量
            let fd = cvt(unsafe {
                libc::accept4(
                    self.raw(),
                    &mut addr as *mut SockaddrRc as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_CLOEXEC,
                )
            })?;
            // SAFETY: fd 刚由 accept4() 创建
            let socket = RfcommSocket {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            };
            Ok((socket, addr.rc_bdaddr))
        }

        /// 等待就绪，返回是否就绪
        pub(super) fn poll(&self, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
            let mut pfd = libc::pollfd {
                fd: self.raw(),
                events,
                revents: 0,
            };
            let timeout_ms = match timeout {
                Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
                None => -1,
            };
            // SAFETY: pfd 为单个有效的 pollfd
            match cvt(unsafe { libc::poll(&mut pfd, 1, timeout_ms) }) {
                Ok(n) => Ok(n > 0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
                Err(e) => Err(e),
            }
        }

        pub(super) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            // SAFETY: buf 可写 buf.len() 字节
            cvt_size(unsafe {
                libc::recv(
                    self.raw(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            })
        }

        pub(super) fn send(&self, buf: &[u8]) -> io::Result<usize> {
            // SAFETY: buf 可读 buf.len() 字节
            cvt_size(unsafe {
                libc::send(
                    self.raw(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            })
        }

        pub(super) fn bytes_available(&self) -> usize {
            let mut count: libc::c_int = 0;
            // SAFETY: FIONREAD 只写入一个 c_int
            let ret = unsafe {
                libc::ioctl(self.raw(), libc::FIONREAD, &mut count as *mut libc::c_int)
            };
            if ret < 0 { 0 } else { count.max(0) as usize }
        }

        pub(super) fn shutdown(&self) {
            // SAFETY: 对已打开的 fd 调用 shutdown
            unsafe {
                libc::shutdown(self.raw(), libc::SHUT_RDWR);
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::rfcomm::RfcommSocket;
    use super::{check_address, format_bdaddr};
    use crate::thread_util::join_logged;
    use crate::{
        ChannelDescription, Endpoint, Interactive, PeerHandler, PeerHandlerFactory, ServerHooks,
        ServerInteractive, TransportError,
    };
    use parking_lot::{Mutex, RwLock};
    use std::collections::HashMap;
    use std::io::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};
    use tracing::{debug, error, info, trace, warn};

    const POLL_SLICE: Duration = Duration::from_millis(100);

    fn send_all(socket: &RfcommSocket, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut written = 0;
        while written < data.len() {
            if !socket.poll(libc::POLLOUT, Some(timeout))? {
                return Err(TransportError::Timeout);
            }
            match socket.send(&data[written..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(written)
    }

    /// RFCOMM 客户端
    pub struct BluetoothClient {
        description: ChannelDescription,
        bdaddr: [u8; 6],
        socket: RwLock<Option<Arc<RfcommSocket>>>,
        broken: AtomicBool,
    }

    impl BluetoothClient {
        pub fn new(description: ChannelDescription) -> Result<Self, TransportError> {
            let bdaddr = check_address(&description)?;
            Ok(Self {
                description,
                bdaddr,
                socket: RwLock::new(None),
                broken: AtomicBool::new(false),
            })
        }

        fn current(&self) -> Result<Arc<RfcommSocket>, TransportError> {
            if self.broken.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            self.socket.read().clone().ok_or(TransportError::NotConnected)
        }

        fn fail(&self, err: TransportError) -> TransportError {
            if err.is_disconnect() && !self.broken.swap(true, Ordering::AcqRel) {
                warn!("RFCOMM link {} lost: {}", self.description.address, err);
            }
            err
        }
    }

    impl Interactive for BluetoothClient {
        fn description(&self) -> &ChannelDescription {
            &self.description
        }

        fn open(&self) -> bool {
            self.close();
            let result = RfcommSocket::new().and_then(|socket| {
                socket.connect(
                    self.bdaddr,
                    self.description.port as u8,
                    self.description.open_timeout(),
                )?;
                Ok(socket)
            });
            match result {
                Ok(socket) => {
                    info!(
                        "RFCOMM connected to {} channel {}",
                        self.description.address, self.description.port
                    );
                    *self.socket.write() = Some(Arc::new(socket));
                    self.broken.store(false, Ordering::Release);
                    true
                },
                Err(e) => {
                    warn!("RFCOMM connect to {} failed: {}", self.description.address, e);
                    false
                },
            }
        }

        fn close(&self) {
            if let Some(socket) = self.socket.write().take() {
                socket.shutdown();
            }
        }

        fn connected(&self) -> bool {
            !self.broken.load(Ordering::Acquire) && self.socket.read().is_some()
        }

        fn available(&self) -> usize {
            self.socket
                .read()
                .as_ref()
                .map(|s| s.bytes_available())
                .unwrap_or(0)
        }

        fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
            let socket = self.current()?;
            send_all(&socket, data, self.description.send_timeout()).map_err(|e| self.fail(e))
        }

        fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
            let socket = self.current()?;
            let timeout = timeout.unwrap_or_else(|| self.description.receive_timeout());
            if !socket.poll(libc::POLLIN, Some(timeout))? {
                return Ok(0);
            }
            match socket.recv(buffer) {
                Ok(0) => Err(self.fail(TransportError::Disconnected)),
                Ok(n) => {
                    trace!("RFCOMM received {} bytes", n);
                    Ok(n)
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    Ok(0)
                },
                Err(e) => Err(self.fail(TransportError::Io(e))),
            }
        }

        fn peer_endpoint(&self) -> Endpoint {
            Endpoint::new(self.description.address.clone(), self.description.port)
        }
    }

    impl Drop for BluetoothClient {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// 服务端对端
    struct BtPeer {
        description: ChannelDescription,
        endpoint: Endpoint,
        socket: RfcommSocket,
        handler: RwLock<Option<Arc<dyn PeerHandler>>>,
        alive: AtomicBool,
        close_flag: AtomicBool,
        reader: Mutex<Option<JoinHandle<()>>>,
    }

    impl BtPeer {
        fn teardown(&self) {
            self.alive.store(false, Ordering::Release);
            self.socket.shutdown();
            if let Some(handler) = self.handler.write().take() {
                handler.on_closed();
            }
            join_logged(self.reader.lock().take(), "RFCOMM peer", POLL_SLICE * 10);
        }
    }

    impl Interactive for BtPeer {
        fn description(&self) -> &ChannelDescription {
            &self.description
        }

        fn open(&self) -> bool {
            self.connected()
        }

        fn close(&self) {
            self.close_flag.store(true, Ordering::Release);
        }

        fn connected(&self) -> bool {
            self.alive.load(Ordering::Acquire) && !self.close_flag.load(Ordering::Acquire)
        }

        fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
            if !self.connected() {
                return Err(TransportError::NotConnected);
            }
            send_all(&self.socket, data, self.description.send_timeout())
        }

        fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
            Ok(0)
        }

        fn peer_endpoint(&self) -> Endpoint {
            self.endpoint.clone()
        }

        fn is_push(&self) -> bool {
            true
        }
    }

    struct BtShared {
        description: ChannelDescription,
        factory: Arc<dyn PeerHandlerFactory>,
        hooks: ServerHooks,
        peers: RwLock<HashMap<Endpoint, Arc<BtPeer>>>,
        running: AtomicBool,
    }

    /// RFCOMM 服务端
    pub struct BluetoothServer {
        shared: Arc<BtShared>,
        bdaddr: [u8; 6],
        worker: Mutex<Option<JoinHandle<()>>>,
    }

    impl BluetoothServer {
        pub fn new(
            description: ChannelDescription,
            factory: Arc<dyn PeerHandlerFactory>,
        ) -> Result<Self, TransportError> {
            let bdaddr = check_address(&description)?;
            Ok(Self {
                shared: Arc::new(BtShared {
                    description,
                    factory,
                    hooks: ServerHooks::new(),
                    peers: RwLock::new(HashMap::new()),
                    running: AtomicBool::new(false),
                }),
                bdaddr,
                worker: Mutex::new(None),
            })
        }

        fn bind(&self) -> Option<RfcommSocket> {
            let desc = &self.shared.description;
            let attempts = desc.bind_attempts.max(1);
            for attempt in 1..=attempts {
                let result = RfcommSocket::new().and_then(|socket| {
                    socket.bind_listen(self.bdaddr, desc.port as u8, 16)?;
                    Ok(socket)
                });
                match result {
                    Ok(socket) => return Some(socket),
                    Err(e) => {
                        warn!(
                            "RFCOMM bind channel {} failed (attempt {}/{}): {}",
                            desc.port, attempt, attempts, e
                        );
                        if attempt < attempts {
                            std::thread::sleep(desc.bind_retry_delay());
                        }
                    },
                }
            }
            error!("Giving up binding RFCOMM channel {}", desc.port);
            None
        }
    }

    impl Interactive for BluetoothServer {
        fn description(&self) -> &ChannelDescription {
            &self.shared.description
        }

        fn open(&self) -> bool {
            if self.shared.running.load(Ordering::Acquire) {
                return true;
            }
            self.close();
            let Some(listener) = self.bind() else {
                return false;
            };
            self.shared.running.store(true, Ordering::Release);
            let shared = self.shared.clone();
            let spawned = std::thread::Builder::new()
                .name("fieldlink-bt-accept".to_string())
                .spawn(move || accept_loop(shared, listener));
            match spawned {
                Ok(handle) => {
                    *self.worker.lock() = Some(handle);
                    info!("RFCOMM server listening on channel {}", self.shared.description.port);
                    true
                },
                Err(e) => {
                    error!("Failed to spawn RFCOMM accept thread: {}", e);
                    self.shared.running.store(false, Ordering::Release);
                    false
                },
            }
        }

        fn close(&self) {
            self.shared.running.store(false, Ordering::Release);
            join_logged(self.worker.lock().take(), "RFCOMM accept", POLL_SLICE * 20);
            let peers: Vec<Arc<BtPeer>> =
                self.shared.peers.write().drain().map(|(_, p)| p).collect();
            for peer in peers {
                self.shared.hooks.fire_closed(&peer.endpoint);
                peer.teardown();
            }
        }

        fn connected(&self) -> bool {
            self.shared.running.load(Ordering::Acquire)
        }

        fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
            let peers: Vec<Arc<BtPeer>> = self.shared.peers.read().values().cloned().collect();
            let delivered = peers.iter().filter(|p| p.send(data).is_ok()).count();
            if delivered > 0 {
                Ok(data.len())
            } else {
                Err(TransportError::NotConnected)
            }
        }

        fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
            Ok(0)
        }

        fn is_push(&self) -> bool {
            true
        }

        fn as_server(&self) -> Option<&dyn ServerInteractive> {
            Some(self)
        }
    }

    impl ServerInteractive for BluetoothServer {
        fn client_count(&self) -> usize {
            self.shared.peers.read().len()
        }

        fn clients(&self) -> Vec<Endpoint> {
            self.shared.peers.read().keys().cloned().collect()
        }

        fn get_client(&self, peer: &Endpoint) -> Option<Arc<dyn Interactive>> {
            self.shared
                .peers
                .read()
                .get(peer)
                .map(|p| p.clone() as Arc<dyn Interactive>)
        }

        fn close_client(&self, peer: &Endpoint) -> bool {
            match self.shared.peers.read().get(peer) {
                Some(p) => {
                    p.close();
                    true
                },
                None => false,
            }
        }

        fn hooks(&self) -> &ServerHooks {
            &self.shared.hooks
        }
    }

    impl Drop for BluetoothServer {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn accept_loop(shared: Arc<BtShared>, listener: RfcommSocket) {
        let sweep_interval = shared.description.sweep_interval();
        let mut last_sweep = Instant::now();

        while shared.running.load(Ordering::Acquire) {
            match listener.poll(libc::POLLIN, Some(POLL_SLICE)) {
                Ok(true) => match listener.accept() {
                    Ok((socket, bdaddr)) => admit(&shared, socket, bdaddr),
                    Err(e) => debug!("RFCOMM accept failed: {}", e),
                },
                Ok(false) => {},
                Err(e) => {
                    error!("RFCOMM listener poll failed: {}", e);
                    break;
                },
            }

            if last_sweep.elapsed() >= sweep_interval {
                last_sweep = Instant::now();
                let stale: Vec<Arc<BtPeer>> = {
                    let mut peers = shared.peers.write();
                    let keys: Vec<Endpoint> = peers
                        .iter()
                        .filter(|(_, p)| !p.connected())
                        .map(|(k, _)| k.clone())
                        .collect();
                    keys.iter().filter_map(|k| peers.remove(k)).collect()
                };
                for peer in stale {
                    shared.hooks.fire_closed(&peer.endpoint);
                    peer.teardown();
                }
            }
        }
    }

    fn admit(shared: &Arc<BtShared>, socket: RfcommSocket, bdaddr: [u8; 6]) {
        let desc = &shared.description;
        if shared.peers.read().len() >= desc.max_connections {
            warn!("Rejecting RFCOMM peer: max_connections reached");
            socket.shutdown();
            return;
        }
        let endpoint = Endpoint::new(format_bdaddr(&bdaddr), desc.port);
        let peer = Arc::new(BtPeer {
            description: ChannelDescription {
                address: endpoint.address.clone(),
                ..desc.clone()
            },
            endpoint: endpoint.clone(),
            socket,
            handler: RwLock::new(None),
            alive: AtomicBool::new(true),
            close_flag: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        let handler = shared
            .factory
            .create(&endpoint, peer.clone() as Arc<dyn Interactive>);
        *peer.handler.write() = Some(handler);

        let reader_peer = Arc::downgrade(&peer);
        let running = shared.clone();
        let buffer_size = desc.read_buffer_size();
        let spawned = std::thread::Builder::new()
            .name("fieldlink-bt-peer".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; buffer_size];
                while running.running.load(Ordering::Acquire) {
                    let Some(peer) = reader_peer.upgrade() else { break };
                    if !peer.alive.load(Ordering::Acquire) {
                        break;
                    }
                    match peer.socket.poll(libc::POLLIN, Some(POLL_SLICE)) {
                        Ok(true) => match peer.socket.recv(&mut buf) {
                            Ok(0) => peer.alive.store(false, Ordering::Release),
                            Ok(n) => {
                                let handler = peer.handler.read().clone();
                                if let Some(handler) = handler {
                                    handler.on_data(&buf[..n]);
                                }
                            },
                            Err(e) if e.kind() == ErrorKind::Interrupted => {},
                            Err(_) => peer.alive.store(false, Ordering::Release),
                        },
                        Ok(false) => {},
                        Err(_) => peer.alive.store(false, Ordering::Release),
                    }
                }
            });
        match spawned {
            Ok(handle) => *peer.reader.lock() = Some(handle),
            Err(e) => {
                warn!("Failed to spawn RFCOMM reader: {}", e);
                return;
            },
        }
        shared.peers.write().insert(endpoint.clone(), peer);
        debug!("RFCOMM peer {} connected", endpoint);
        shared.hooks.fire_accepted(&endpoint);
    }
}

#[cfg(target_os = "linux")]
pub use imp::{BluetoothClient, BluetoothServer};

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::check_address;
    use crate::{
        ChannelDescription, Endpoint, Interactive, PeerHandlerFactory, ServerHooks,
        ServerInteractive, TransportError,
    };
    use std::sync::Arc;
    use std::time::Duration;

    /// RFCOMM 客户端（当前平台不支持）
    pub struct BluetoothClient {
        description: ChannelDescription,
    }

    impl BluetoothClient {
        pub fn new(description: ChannelDescription) -> Result<Self, TransportError> {
            check_address(&description)?;
            Err(TransportError::Unsupported(
                "Bluetooth RFCOMM is only available on Linux".to_string(),
            ))
        }
    }

    impl Interactive for BluetoothClient {
        fn description(&self) -> &ChannelDescription {
            &self.description
        }
        fn open(&self) -> bool {
            false
        }
        fn close(&self) {}
        fn connected(&self) -> bool {
            false
        }
        fn send(&self, _data: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::NotConnected)
        }
        fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    /// RFCOMM 服务端（当前平台不支持）
    pub struct BluetoothServer {
        description: ChannelDescription,
        hooks: ServerHooks,
    }

    impl BluetoothServer {
        pub fn new(
            description: ChannelDescription,
            _factory: Arc<dyn PeerHandlerFactory>,
        ) -> Result<Self, TransportError> {
            check_address(&description)?;
            Err(TransportError::Unsupported(
                "Bluetooth RFCOMM is only available on Linux".to_string(),
            ))
        }
    }

    impl Interactive for BluetoothServer {
        fn description(&self) -> &ChannelDescription {
            &self.description
        }
        fn open(&self) -> bool {
            false
        }
        fn close(&self) {}
        fn connected(&self) -> bool {
            false
        }
        fn send(&self, _data: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::NotConnected)
        }
        fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
            Err(TransportError::NotConnected)
        }
        fn as_server(&self) -> Option<&dyn ServerInteractive> {
            Some(self)
        }
    }

    impl ServerInteractive for BluetoothServer {
        fn client_count(&self) -> usize {
            0
        }
        fn clients(&self) -> Vec<Endpoint> {
            Vec::new()
        }
        fn get_client(&self, _peer: &Endpoint) -> Option<Arc<dyn Interactive>> {
            None
        }
        fn close_client(&self, _peer: &Endpoint) -> bool {
            false
        }
        fn hooks(&self) -> &ServerHooks {
            &self.hooks
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use imp::{BluetoothClient, BluetoothServer};
