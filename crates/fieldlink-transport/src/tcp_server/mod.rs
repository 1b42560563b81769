//! TCP 服务端
//!
//! 一个 reactor 线程处理所有连接的 accept 与读写就绪事件，
//! 另有一个低频清理线程移除断开/被请求关闭的对端，
//! 配置了 `Multiplexing` 策略时再加一个共享定时线程。
//!
//! ```text
//!             ┌──────────── fieldlink-reactor ────────────┐
//! listener ──►│ accept → 设置选项 → 注册 → PeerClient → on_accept │
//! peers    ──►│ readable → 读空 → 接收策略 → PeerHandler     │
//! waker    ──►│ close() 唤醒 → 退出                          │
//!             └───────────────────────────────────────────┘
//! fieldlink-sweep: 断开/关闭的对端 → on_close → 注销 → 宽限期后释放
//! ```

mod peer;
mod reactor;
mod tls;

use crate::thread_util::{join_logged, sleep_while_running};
use crate::{
    ChannelDescription, Endpoint, Interactive, PeerHandlerFactory, ServerHooks,
    ServerInteractive, StrategyKind, TransportError, sockopt,
};
use mio::net::TcpListener;
use mio::{Events, Token};
use parking_lot::{Mutex, RwLock};
use peer::PeerClient;
use reactor::{FIRST_PEER, LISTENER, Reactor, ReactorHandle, WAKE};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 后台线程 join 超时
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 对端表：按 token 分发事件，按地址供应用查询
#[derive(Default)]
struct ClientTable {
    by_token: HashMap<Token, Arc<PeerClient>>,
    by_endpoint: HashMap<Endpoint, Token>,
}

impl ClientTable {
    fn insert(&mut self, client: Arc<PeerClient>) {
        self.by_endpoint.insert(client.endpoint().clone(), client.token());
        self.by_token.insert(client.token(), client);
    }

    fn remove(&mut self, token: Token) -> Option<Arc<PeerClient>> {
        let client = self.by_token.remove(&token)?;
        if self.by_endpoint.get(client.endpoint()) == Some(&token) {
            self.by_endpoint.remove(client.endpoint());
        }
        Some(client)
    }

    fn active(&self) -> impl Iterator<Item = &Arc<PeerClient>> {
        self.by_token.values().filter(|c| !c.is_deleted())
    }
}

/// reactor 与清理线程共享的状态
struct ServerShared {
    description: ChannelDescription,
    factory: Arc<dyn PeerHandlerFactory>,
    hooks: ServerHooks,
    tls: Option<Arc<rustls::ServerConfig>>,
    clients: RwLock<ClientTable>,
    running: AtomicBool,
    next_token: AtomicUsize,
    reactor: RwLock<Option<ReactorHandle>>,
}

impl ServerShared {
    fn snapshot(&self) -> Vec<Arc<PeerClient>> {
        self.clients.read().by_token.values().cloned().collect()
    }

    fn client(&self, token: Token) -> Option<Arc<PeerClient>> {
        self.clients.read().by_token.get(&token).cloned()
    }
}

#[derive(Default)]
struct Workers {
    reactor: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
    mux: Option<JoinHandle<()>>,
}

/// TCP 服务端链路
pub struct TcpServer {
    shared: Arc<ServerShared>,
    workers: Mutex<Workers>,
    local: RwLock<Endpoint>,
}

impl TcpServer {
    /// 创建服务端（不绑定）
    ///
    /// # 错误
    /// - `TransportError::Config`: TLS 证书/私钥不可读或不匹配
    pub fn new(
        description: ChannelDescription,
        factory: Arc<dyn PeerHandlerFactory>,
    ) -> Result<Self, TransportError> {
        let tls = match &description.tls {
            Some(files) => Some(tls::load_server_config(files)?),
            None => None,
        };
        Ok(Self {
            shared: Arc::new(ServerShared {
                description,
                factory,
                hooks: ServerHooks::new(),
                tls,
                clients: RwLock::new(ClientTable::default()),
                running: AtomicBool::new(false),
                next_token: AtomicUsize::new(FIRST_PEER),
                reactor: RwLock::new(None),
            }),
            workers: Mutex::new(Workers::default()),
            local: RwLock::new(Endpoint::empty()),
        })
    }

    /// 绑定监听地址，失败时按配置重试
    fn bind(&self) -> Option<TcpListener> {
        let desc = &self.shared.description;
        let addr = match Endpoint::new(desc.address.clone(), desc.port).to_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Invalid listen address {}:{}: {}", desc.address, desc.port, e);
                return None;
            },
        };
        if !desc.reuse_address {
            debug!("reuse_address=false has no effect, listeners always set SO_REUSEADDR");
        }

        let attempts = desc.bind_attempts.max(1);
        for attempt in 1..=attempts {
            match TcpListener::bind(addr) {
                Ok(listener) => return Some(listener),
                Err(e) => {
                    warn!("Bind {} failed (attempt {}/{}): {}", addr, attempt, attempts, e);
                    if attempt < attempts {
                        std::thread::sleep(desc.bind_retry_delay());
                    }
                },
            }
        }
        error!("Giving up binding {} after {} attempts", addr, attempts);
        None
    }

    fn spawn_workers(&self, reactor: Reactor, listener: TcpListener) -> std::io::Result<()> {
        let mut workers = self.workers.lock();

        let shared = self.shared.clone();
        workers.reactor = Some(
            std::thread::Builder::new()
                .name("fieldlink-reactor".to_string())
                .spawn(move || reactor_loop(shared, reactor, listener))?,
        );

        let shared = self.shared.clone();
        workers.sweep = Some(
            std::thread::Builder::new()
                .name("fieldlink-sweep".to_string())
                .spawn(move || sweep_loop(shared))?,
        );

        let desc = &self.shared.description;
        if desc.receiver == StrategyKind::Multiplexing || desc.sender == StrategyKind::Multiplexing
        {
            let shared = self.shared.clone();
            workers.mux = Some(
                std::thread::Builder::new()
                    .name("fieldlink-mux".to_string())
                    .spawn(move || mux_loop(shared))?,
            );
        }
        Ok(())
    }
}

impl Interactive for TcpServer {
    fn description(&self) -> &ChannelDescription {
        &self.shared.description
    }

    fn open(&self) -> bool {
        if self.shared.running.load(Ordering::Acquire) {
            return true;
        }
        // 回收上一次运行留下的线程
        self.close();

        let Some(mut listener) = self.bind() else {
            return false;
        };
        let reactor = match Reactor::new() {
            Ok(reactor) => reactor,
            Err(e) => {
                error!("Failed to create reactor: {}", e);
                return false;
            },
        };
        if let Err(e) = reactor.register_listener(&mut listener) {
            error!("Failed to register listener: {}", e);
            return false;
        }

        let local = listener.local_addr().map(Endpoint::from).unwrap_or_default();
        *self.shared.reactor.write() = Some(reactor.handle());
        self.shared.running.store(true, Ordering::Release);

        if let Err(e) = self.spawn_workers(reactor, listener) {
            error!("Failed to spawn server threads: {}", e);
            self.close();
            return false;
        }
        info!(
            "TCP server {} listening on {}{}",
            self.shared.description.display_name(),
            local,
            if self.shared.tls.is_some() { " (TLS)" } else { "" }
        );
        *self.local.write() = local;
        true
    }

    fn close(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        if let Some(handle) = self.shared.reactor.read().as_ref() {
            handle.wake();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        join_logged(workers.reactor, "Reactor", JOIN_TIMEOUT);
        join_logged(workers.sweep, "Sweep", JOIN_TIMEOUT);
        join_logged(workers.mux, "Multiplexing timer", JOIN_TIMEOUT);

        let reactor = self.shared.reactor.write().take();
        let clients: Vec<Arc<PeerClient>> = {
            let mut table = self.shared.clients.write();
            table.by_endpoint.clear();
            table.by_token.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            if client.mark_deleted() {
                self.shared.hooks.fire_closed(client.endpoint());
            }
            client.teardown(reactor.as_ref());
        }

        *self.local.write() = Endpoint::empty();
        if was_running {
            info!(
                "TCP server {} closed",
                self.shared.description.display_name()
            );
        }
    }

    fn connected(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 广播到所有在线对端
    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let clients: Vec<Arc<PeerClient>> = self.shared.clients.read().active().cloned().collect();
        let mut delivered = false;
        for client in clients {
            if client.send(data).is_ok() {
                delivered = true;
            }
        }
        if delivered {
            Ok(data.len())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// 服务端数据由事件循环推送给各对端处理器
    fn receive(&self, _buffer: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.read().clone()
    }

    fn is_push(&self) -> bool {
        true
    }

    fn as_server(&self) -> Option<&dyn ServerInteractive> {
        Some(self)
    }
}

impl ServerInteractive for TcpServer {
    fn client_count(&self) -> usize {
        self.shared.clients.read().active().count()
    }

    fn clients(&self) -> Vec<Endpoint> {
        self.shared
            .clients
            .read()
            .active()
            .map(|c| c.endpoint().clone())
            .collect()
    }

    fn get_client(&self, peer: &Endpoint) -> Option<Arc<dyn Interactive>> {
        let table = self.shared.clients.read();
        let token = table.by_endpoint.get(peer)?;
        let client = table.by_token.get(token)?;
        if client.is_deleted() {
            return None;
        }
        Some(client.clone() as Arc<dyn Interactive>)
    }

    fn close_client(&self, peer: &Endpoint) -> bool {
        let table = self.shared.clients.read();
        match table.by_endpoint.get(peer).and_then(|t| table.by_token.get(t)) {
            Some(client) if !client.is_deleted() => {
                client.request_close();
                true
            },
            _ => false,
        }
    }

    fn hooks(&self) -> &ServerHooks {
        &self.shared.hooks
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// reactor 线程主循环
fn reactor_loop(shared: Arc<ServerShared>, mut reactor: Reactor, mut listener: TcpListener) {
    let handle = reactor.handle();
    let mut events = Events::with_capacity(1024);
    debug!("Reactor started");

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = reactor.wait(&mut events, None) {
            error!("Reactor wait failed: {}", e);
            break;
        }
        for event in events.iter() {
            match event.token() {
                WAKE => {},
                LISTENER => accept_pending(&shared, &handle, &mut listener),
                token => {
                    let Some(client) = shared.client(token) else {
                        continue;
                    };
                    if client.is_deleted() {
                        continue;
                    }
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        client.on_readable();
                    }
                    if event.is_writable() {
                        client.on_writable();
                    }
                },
            }
        }
    }
    debug!("Reactor stopped");
}

/// 接受所有挂起的连接
fn accept_pending(shared: &Arc<ServerShared>, reactor: &ReactorHandle, listener: &mut TcpListener) {
    loop {
        let (mut stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Accept failed: {}", e);
                return;
            },
        };
        let peer = Endpoint::from(addr);
        let desc = &shared.description;

        let active = shared.clients.read().active().count();
        if active >= desc.max_connections {
            warn!(
                "Rejecting {}: max_connections ({}) reached",
                peer, desc.max_connections
            );
            drop(stream);
            continue;
        }

        if let Err(e) = stream.set_nodelay(desc.no_delay) {
            trace!("set_nodelay on {}: {}", peer, e);
        }
        sockopt::set_buffer_sizes(&stream, desc.send_buffer_size, desc.receive_buffer_size);

        let tls = match &shared.tls {
            Some(config) => match rustls::ServerConnection::new(config.clone()) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!("TLS session for {} failed: {}", peer, e);
                    continue;
                },
            },
            None => None,
        };

        let token = Token(shared.next_token.fetch_add(1, Ordering::Relaxed));
        if let Err(e) = reactor.register_peer(&mut stream, token) {
            warn!("Failed to register {}: {}", peer, e);
            continue;
        }

        let client = PeerClient::new(token, stream, peer.clone(), desc, tls);
        let handler = shared
            .factory
            .create(&peer, client.clone() as Arc<dyn Interactive>);
        client.set_handler(handler);
        if client.needs_timer() {
            client.start_timer();
        }
        shared.clients.write().insert(client);

        debug!("Accepted {} as token {}", peer, token.0);
        shared.hooks.fire_accepted(&peer);
    }
}

/// 清理线程：两阶段移除断开/被请求关闭的对端
///
/// 1. 标记删除 → close 通知 → 注销 → 关闭套接字
/// 2. 宽限期后从对端表中释放
fn sweep_loop(shared: Arc<ServerShared>) {
    let interval = shared.description.sweep_interval();
    let grace = shared.description.delete_grace();

    while sleep_while_running(&shared.running, interval) {
        let reactor = shared.reactor.read().clone();
        for client in shared.snapshot() {
            if client.should_remove() && client.mark_deleted() {
                debug!("Removing peer {}", client.endpoint());
                shared.hooks.fire_closed(client.endpoint());
                client.teardown(reactor.as_ref());
            }
        }

        let expired: Vec<Token> = shared
            .clients
            .read()
            .by_token
            .values()
            .filter(|c| c.deleted_for().is_some_and(|elapsed| elapsed >= grace))
            .map(|c| c.token())
            .collect();
        if !expired.is_empty() {
            let mut table = shared.clients.write();
            for token in expired {
                table.remove(token);
            }
        }
    }
}

/// 多路复用定时线程：一个线程服务所有对端
fn mux_loop(shared: Arc<ServerShared>) {
    let interval = shared.description.poll_interval();
    while sleep_while_running(&shared.running, interval) {
        for client in shared.snapshot() {
            if client.is_multiplexed() && !client.is_deleted() {
                client.service();
            }
        }
    }
}
