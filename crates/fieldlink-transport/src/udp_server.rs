//! UDP 服务端
//!
//! 单个接收线程循环 `recv_from`，按源地址区分对端：
//! 某个源地址第一次出现时视为 accept，空闲超时或被请求关闭时视为 close。

use crate::thread_util::join_logged;
use crate::{
    ChannelDescription, Endpoint, Interactive, PeerHandler, PeerHandlerFactory, ServerHooks,
    ServerInteractive, TransportError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 接收线程检查退出标志的周期
const RECV_SLICE: Duration = Duration::from_millis(100);

/// UDP 对端（按源地址）
struct UdpPeer {
    description: ChannelDescription,
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    endpoint: Endpoint,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
    last_active: Mutex<Instant>,
    close_flag: AtomicBool,
    removed: AtomicBool,
}

impl UdpPeer {
    fn idle(&self) -> bool {
        match self.description.idle_timeout() {
            Some(idle) => self.last_active.lock().elapsed() >= idle,
            None => false,
        }
    }

    fn teardown(&self) {
        self.removed.store(true, Ordering::Release);
        if let Some(handler) = self.handler.write().take() {
            handler.on_closed();
        }
    }
}

impl Interactive for UdpPeer {
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
        !self.removed.load(Ordering::Acquire) && !self.close_flag.load(Ordering::Acquire)
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.socket.send_to(data, self.addr)?)
    }

    fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.socket
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or_default()
    }

    fn peer_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_push(&self) -> bool {
        true
    }
}

struct UdpShared {
    description: ChannelDescription,
    factory: Arc<dyn PeerHandlerFactory>,
    hooks: ServerHooks,
    peers: RwLock<HashMap<SocketAddr, Arc<UdpPeer>>>,
    running: AtomicBool,
}

/// UDP 服务端链路
pub struct UdpServer {
    shared: Arc<UdpShared>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    pub fn new(description: ChannelDescription, factory: Arc<dyn PeerHandlerFactory>) -> Self {
        Self {
            shared: Arc::new(UdpShared {
                description,
                factory,
                hooks: ServerHooks::new(),
                peers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            socket: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    fn bind(&self) -> Option<UdpSocket> {
        let desc = &self.shared.description;
        let addr = match Endpoint::new(desc.address.clone(), desc.port).to_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Invalid UDP listen address: {}", e);
                return None;
            },
        };
        let attempts = desc.bind_attempts.max(1);
        for attempt in 1..=attempts {
            match UdpSocket::bind(addr) {
                Ok(socket) => return Some(socket),
                Err(e) => {
                    warn!("UDP bind {} failed (attempt {}/{}): {}", addr, attempt, attempts, e);
                    if attempt < attempts {
                        std::thread::sleep(desc.bind_retry_delay());
                    }
                },
            }
        }
        error!("Giving up binding UDP {} after {} attempts", addr, attempts);
        None
    }
}

impl Interactive for UdpServer {
    fn description(&self) -> &ChannelDescription {
        &self.shared.description
    }

    fn open(&self) -> bool {
        if self.shared.running.load(Ordering::Acquire) {
            return true;
        }
        self.close();

        let Some(socket) = self.bind() else {
            return false;
        };
        if let Err(e) = socket.set_read_timeout(Some(RECV_SLICE)) {
            error!("Failed to configure UDP socket: {}", e);
            return false;
        }
        let socket = Arc::new(socket);
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let recv_socket = socket.clone();
        let spawned = std::thread::Builder::new()
            .name("fieldlink-udp-server".to_string())
            .spawn(move || recv_loop(shared, recv_socket));
        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                error!("Failed to spawn UDP receive thread: {}", e);
                self.shared.running.store(false, Ordering::Release);
                return false;
            },
        }
        info!(
            "UDP server listening on {}",
            socket.local_addr().map(Endpoint::from).unwrap_or_default()
        );
        *self.socket.write() = Some(socket);
        true
    }

    fn close(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        join_logged(
            self.worker.lock().take(),
            "UDP receive",
            RECV_SLICE * 20,
        );
        let peers: Vec<Arc<UdpPeer>> = self.shared.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            self.shared.hooks.fire_closed(&peer.endpoint);
            peer.teardown();
        }
        self.socket.write().take();
        if was_running {
            info!("UDP server closed");
        }
    }

    fn connected(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 广播到所有已知对端
    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let peers: Vec<Arc<UdpPeer>> = self.shared.peers.read().values().cloned().collect();
        let mut delivered = false;
        for peer in peers {
            if peer.send(data).is_ok() {
                delivered = true;
            }
        }
        if delivered {
            Ok(data.len())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.socket
            .read()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(Endpoint::from)
            .unwrap_or_default()
    }

    fn is_push(&self) -> bool {
        true
    }

    fn as_server(&self) -> Option<&dyn ServerInteractive> {
        Some(self)
    }
}

impl ServerInteractive for UdpServer {
    fn client_count(&self) -> usize {
        self.shared.peers.read().len()
    }

    fn clients(&self) -> Vec<Endpoint> {
        self.shared
            .peers
            .read()
            .values()
            .map(|p| p.endpoint.clone())
            .collect()
    }

    fn get_client(&self, peer: &Endpoint) -> Option<Arc<dyn Interactive>> {
        let addr = peer.to_socket_addr().ok()?;
        self.shared
            .peers
            .read()
            .get(&addr)
            .map(|p| p.clone() as Arc<dyn Interactive>)
    }

    fn close_client(&self, peer: &Endpoint) -> bool {
        let Ok(addr) = peer.to_socket_addr() else {
            return false;
        };
        match self.shared.peers.read().get(&addr) {
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

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn recv_loop(shared: Arc<UdpShared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; shared.description.read_buffer_size().max(64 * 1024)];
    let sweep_interval = shared.description.sweep_interval();
    let mut last_sweep = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                trace!("UDP datagram of {} bytes from {}", n, addr);
                let Some(peer) = peer_for(&shared, &socket, addr) else {
                    continue;
                };
                *peer.last_active.lock() = Instant::now();
                let handler = peer.handler.read().clone();
                if let Some(handler) = handler {
                    handler.on_data(&buf[..n]);
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                debug!("UDP receive error: {}", e);
            },
        }

        if last_sweep.elapsed() >= sweep_interval {
            last_sweep = Instant::now();
            sweep(&shared);
        }
    }
}

/// 查找或创建来源地址对应的对端；达到 `max_connections` 时新来源被拒绝
fn peer_for(
    shared: &Arc<UdpShared>,
    socket: &Arc<UdpSocket>,
    addr: SocketAddr,
) -> Option<Arc<UdpPeer>> {
    if let Some(peer) = shared.peers.read().get(&addr) {
        return Some(peer.clone());
    }

    let endpoint = Endpoint::from(addr);
    let active = shared
        .peers
        .read()
        .values()
        .filter(|p| !p.close_flag.load(Ordering::Acquire))
        .count();
    if active >= shared.description.max_connections {
        warn!(
            "Rejecting datagram from {}: max_connections ({}) reached",
            endpoint, shared.description.max_connections
        );
        return None;
    }

    let peer = Arc::new(UdpPeer {
        description: ChannelDescription {
            address: endpoint.address.clone(),
            port: endpoint.port,
            ..shared.description.clone()
        },
        socket: socket.clone(),
        addr,
        endpoint: endpoint.clone(),
        handler: RwLock::new(None),
        last_active: Mutex::new(Instant::now()),
        close_flag: AtomicBool::new(false),
        removed: AtomicBool::new(false),
    });
    let handler = shared
        .factory
        .create(&endpoint, peer.clone() as Arc<dyn Interactive>);
    *peer.handler.write() = Some(handler);
    shared.peers.write().insert(addr, peer.clone());
    debug!("New UDP peer {}", endpoint);
    shared.hooks.fire_accepted(&endpoint);
    Some(peer)
}

fn sweep(shared: &UdpShared) {
    let stale: Vec<Arc<UdpPeer>> = {
        let mut peers = shared.peers.write();
        let addrs: Vec<SocketAddr> = peers
            .iter()
            .filter(|(_, p)| p.idle() || p.close_flag.load(Ordering::Acquire))
            .map(|(addr, _)| *addr)
            .collect();
        addrs.iter().filter_map(|addr| peers.remove(addr)).collect()
    };
    for peer in stale {
        debug!("Removing UDP peer {}", peer.endpoint);
        shared.hooks.fire_closed(&peer.endpoint);
        peer.teardown();
    }
}
