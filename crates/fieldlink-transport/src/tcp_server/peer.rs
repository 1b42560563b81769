//! 服务端对端（Client）
//!
//! 每个被 accept 的连接包装为一个 `PeerClient`，持有：
//! - 套接字（以及可选的 TLS 会话）
//! - 一个接收策略和一个发送策略（async / sync / multiplexing）
//! - 删除标志：`close_flag`（应用请求关闭）、`delete_flag` + `delete_start`（宽限期移除）
//!
//! 读路径始终由 reactor 线程驱动（边沿触发必须读空）；
//! 接收策略只决定数据在哪个线程上交付给处理器：
//! `Sync` 直接在 reactor 线程上交付，`Async` 由对端自己的定时线程交付，
//! `Multiplexing` 由服务端共享的定时线程交付。

use super::reactor::ReactorHandle;
use crate::thread_util::join_logged;
use crate::{ChannelDescription, Endpoint, Interactive, PeerHandler, StrategyKind, TransportError};
use bytes::{Buf, BytesMut};
use mio::Token;
use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};
use rustls::ServerConnection;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 单个对端待发送数据上限
const MAX_OUTBOUND: usize = 8 * 1024 * 1024;

/// 接收策略
struct Receiver {
    kind: StrategyKind,
    inbound: Mutex<BytesMut>,
    last_active: Mutex<Instant>,
    idle_timeout: Option<Duration>,
}

impl Receiver {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// 空闲超时检查
    fn connected(&self) -> bool {
        match self.idle_timeout {
            Some(idle) => self.last_active.lock().elapsed() < idle,
            None => true,
        }
    }
}

/// 发送策略
struct Sender {
    kind: StrategyKind,
    outbound: Mutex<BytesMut>,
}

/// 服务端对端
pub(crate) struct PeerClient {
    token: Token,
    description: ChannelDescription,
    peer: Endpoint,
    local: Endpoint,
    stream: TcpStream,
    tls: Option<Mutex<ServerConnection>>,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
    receiver: Receiver,
    sender: Sender,
    /// 套接字仍然可用
    alive: AtomicBool,
    /// 应用请求关闭
    close_flag: AtomicBool,
    delete_flag: AtomicBool,
    delete_start: Mutex<Option<Instant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerClient {
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        peer: Endpoint,
        server: &ChannelDescription,
        tls: Option<ServerConnection>,
    ) -> Arc<Self> {
        let local = stream.local_addr().map(Endpoint::from).unwrap_or_default();
        let description = ChannelDescription {
            address: peer.address.clone(),
            port: peer.port,
            ..server.clone()
        };
        Arc::new(Self {
            token,
            peer,
            local,
            stream,
            tls: tls.map(Mutex::new),
            handler: RwLock::new(None),
            receiver: Receiver {
                kind: description.receiver,
                inbound: Mutex::new(BytesMut::new()),
                last_active: Mutex::new(Instant::now()),
                idle_timeout: description.idle_timeout(),
            },
            sender: Sender {
                kind: description.sender,
                outbound: Mutex::new(BytesMut::new()),
            },
            description,
            alive: AtomicBool::new(true),
            close_flag: AtomicBool::new(false),
            delete_flag: AtomicBool::new(false),
            delete_start: Mutex::new(None),
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.peer
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn PeerHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn PeerHandler>> {
        self.handler.read().clone()
    }

    /// 是否需要独立定时线程
    pub(crate) fn needs_timer(&self) -> bool {
        self.receiver.kind == StrategyKind::Async || self.sender.kind == StrategyKind::Async
    }

    /// 是否由共享定时线程服务
    pub(crate) fn is_multiplexed(&self) -> bool {
        self.receiver.kind == StrategyKind::Multiplexing
            || self.sender.kind == StrategyKind::Multiplexing
    }

    /// 启动对端定时线程（异步策略）
    ///
    /// 线程只持有弱引用，对端被释放后自然退出。
    pub(crate) fn start_timer(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.description.poll_interval();
        let name = format!("fieldlink-peer-{}", self.token.0);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            loop {
                std::thread::sleep(interval);
                let Some(peer) = weak.upgrade() else { break };
                if peer.delete_flag.load(Ordering::Acquire) {
                    break;
                }
                peer.service();
            }
        });
        match spawned {
            Ok(handle) => *self.timer.lock() = Some(handle),
            Err(e) => warn!("Failed to spawn timer for peer {}: {}", self.peer, e),
        }
    }

    /// 读就绪：读空内核缓冲区
    pub(crate) fn on_readable(&self) {
        let chunks = if self.tls.is_some() {
            self.read_tls()
        } else {
            self.read_plain()
        };
        if chunks.is_empty() {
            return;
        }
        self.receiver.touch();

        match self.receiver.kind {
            StrategyKind::Sync => {
                if let Some(handler) = self.handler() {
                    for chunk in &chunks {
                        handler.on_data(chunk);
                    }
                }
            },
            StrategyKind::Async | StrategyKind::Multiplexing => {
                let mut inbound = self.receiver.inbound.lock();
                for chunk in &chunks {
                    inbound.extend_from_slice(chunk);
                }
            },
        }
    }

    /// 写就绪：继续发送积压数据
    pub(crate) fn on_writable(&self) {
        self.flush();
    }

    /// 定时服务：交付缓存的入站数据并刷新出站数据
    pub(crate) fn service(&self) {
        if self.receiver.kind != StrategyKind::Sync {
            let pending = {
                let mut inbound = self.receiver.inbound.lock();
                if inbound.is_empty() {
                    None
                } else {
                    Some(inbound.split().freeze())
                }
            };
            if let Some(data) = pending
                && let Some(handler) = self.handler()
            {
                handler.on_data(&data);
            }
        }
        self.flush();
    }

    fn read_plain(&self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.description.read_buffer_size()];
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => {
                    debug!("Peer {} closed the connection", self.peer);
                    self.alive.store(false, Ordering::Release);
                    break;
                },
                Ok(n) => {
                    trace!("Peer {} sent {} bytes", self.peer, n);
                    chunks.push(buf[..n].to_vec());
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Peer {} read error: {}", self.peer, e);
                    self.alive.store(false, Ordering::Release);
                    break;
                },
            }
        }
        chunks
    }

    fn read_tls(&self) -> Vec<Vec<u8>> {
        let Some(tls) = &self.tls else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.description.read_buffer_size()];
        let mut conn = tls.lock();
        let mut io = &self.stream;
        loop {
            match conn.read_tls(&mut io) {
                Ok(0) => {
                    self.alive.store(false, Ordering::Release);
                    break;
                },
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        warn!("TLS error from peer {}: {}", self.peer, e);
                        let _ = conn.write_tls(&mut io);
                        self.alive.store(false, Ordering::Release);
                        break;
                    }
                    loop {
                        match conn.reader().read(&mut buf) {
                            Ok(0) => {
                                self.alive.store(false, Ordering::Release);
                                break;
                            },
                            Ok(n) => chunks.push(buf[..n].to_vec()),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => {
                                debug!("Peer {} TLS read error: {}", self.peer, e);
                                self.alive.store(false, Ordering::Release);
                                break;
                            },
                        }
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Peer {} read error: {}", self.peer, e);
                    self.alive.store(false, Ordering::Release);
                    break;
                },
            }
        }
        // 握手应答
        self.flush_tls(&mut conn);
        chunks
    }

    /// 刷新出站数据（持有出站锁，保证与写就绪事件串行）
    fn flush(&self) {
        if let Some(tls) = &self.tls {
            let mut conn = tls.lock();
            self.flush_tls(&mut conn);
            return;
        }
        let mut outbound = self.sender.outbound.lock();
        self.write_buffered(&mut outbound);
    }

    fn write_buffered(&self, outbound: &mut BytesMut) {
        while !outbound.is_empty() {
            match (&self.stream).write(outbound) {
                Ok(0) => {
                    self.alive.store(false, Ordering::Release);
                    outbound.clear();
                },
                Ok(n) => outbound.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Peer {} write error: {}", self.peer, e);
                    self.alive.store(false, Ordering::Release);
                    outbound.clear();
                },
            }
        }
    }

    fn flush_tls(&self, conn: &mut ServerConnection) {
        let mut io = &self.stream;
        while conn.wants_write() {
            match conn.write_tls(&mut io) {
                Ok(_) => {},
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Peer {} TLS write error: {}", self.peer, e);
                    self.alive.store(false, Ordering::Release);
                    break;
                },
            }
        }
    }

    /// 应被清理（断开、空闲超时或应用请求关闭）
    pub(crate) fn should_remove(&self) -> bool {
        !self.connected() || self.close_flag.load(Ordering::Acquire)
    }

    pub(crate) fn request_close(&self) {
        self.close_flag.store(true, Ordering::Release);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.delete_flag.load(Ordering::Acquire)
    }

    /// 标记删除，返回是否为首次标记
    pub(crate) fn mark_deleted(&self) -> bool {
        if self.delete_flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.delete_start.lock() = Some(Instant::now());
        true
    }

    /// 标记删除后经过的时间
    pub(crate) fn deleted_for(&self) -> Option<Duration> {
        self.delete_start.lock().map(|start| start.elapsed())
    }

    /// 拆除：注销事件、关闭套接字、通知处理器
    ///
    /// 调用后不再有事件交付到该对端。
    pub(crate) fn teardown(&self, reactor: Option<&ReactorHandle>) {
        self.alive.store(false, Ordering::Release);
        self.delete_flag.store(true, Ordering::Release);
        if let Some(reactor) = reactor
            && let Err(e) = reactor.deregister_peer(&self.stream)
        {
            trace!("Deregister peer {}: {}", self.peer, e);
        }
        if let Some(tls) = &self.tls {
            let mut conn = tls.lock();
            conn.send_close_notify();
            self.flush_tls(&mut conn);
        }
        let _ = self.stream.shutdown(Shutdown::Both);

        // 打破 handler -> link -> handler 的引用环
        if let Some(handler) = self.handler.write().take() {
            handler.on_closed();
        }
        join_logged(self.timer.lock().take(), "peer timer", Duration::from_secs(1));
    }
}

impl Interactive for PeerClient {
    fn description(&self) -> &ChannelDescription {
        &self.description
    }

    /// 对端链路由服务端 accept 产生，无法主动重新打开
    fn open(&self) -> bool {
        self.connected()
    }

    /// 请求关闭，由服务端清理定时器实际移除
    fn close(&self) {
        self.request_close();
    }

    fn connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
            && !self.delete_flag.load(Ordering::Acquire)
            && self.receiver.connected()
    }

    fn available(&self) -> usize {
        self.receiver.inbound.lock().len()
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected() || self.close_flag.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        if let Some(tls) = &self.tls {
            let mut conn = tls.lock();
            conn.writer().write_all(data)?;
            if self.sender.kind == StrategyKind::Sync {
                self.flush_tls(&mut conn);
            }
            return Ok(data.len());
        }

        let mut outbound = self.sender.outbound.lock();
        if outbound.len() + data.len() > MAX_OUTBOUND {
            warn!("Peer {} outbound buffer full", self.peer);
            return Err(TransportError::Timeout);
        }
        outbound.extend_from_slice(data);
        if self.sender.kind == StrategyKind::Sync {
            self.write_buffered(&mut outbound);
        }
        if self.alive.load(Ordering::Acquire) {
            Ok(data.len())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    /// 对端数据由事件循环推送给处理器，这里总是返回 `Ok(0)`
    fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
        if self.connected() {
            Ok(0)
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    fn peer_endpoint(&self) -> Endpoint {
        self.peer.clone()
    }

    fn is_push(&self) -> bool {
        true
    }
}
