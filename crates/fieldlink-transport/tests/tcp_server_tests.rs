//! TCP 服务端集成测试
//!
//! 使用回环地址上的真实套接字验证：
//! 1. 多连接 accept 与计数
//! 2. close() 能唤醒阻塞中的事件循环并及时退出
//! 3. max_connections 限制
//! 4. close_client / 断线后的清理与 close 通知
//! 5. 三种接收/发送策略下的数据交付
//! 6. TLS

use fieldlink_transport::{
    ChannelDescription, Endpoint, Interactive, PeerHandler, PeerHandlerFactory, ServerInteractive,
    StrategyKind, TcpServer, TlsFiles,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// 回显处理器：记录收到的数据并原样回发
struct EchoHandler {
    link: Arc<dyn Interactive>,
    received: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicUsize>,
}

impl PeerHandler for EchoHandler {
    fn on_data(&self, data: &[u8]) {
        self.received.lock().extend_from_slice(data);
        let _ = self.link.send(data);
    }

    fn on_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct EchoFactory {
    received: Arc<Mutex<Vec<u8>>>,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl PeerHandlerFactory for EchoFactory {
    fn create(&self, _peer: &Endpoint, link: Arc<dyn Interactive>) -> Arc<dyn PeerHandler> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(EchoHandler {
            link,
            received: self.received.clone(),
            closed: self.closed.clone(),
        })
    }
}

fn server_description() -> ChannelDescription {
    let mut desc = ChannelDescription::tcp_server("127.0.0.1", 0);
    desc.sweep_interval_ms = 20;
    desc.delete_grace_ms = 10;
    desc.poll_interval_ms = 5;
    desc
}

fn start(desc: ChannelDescription) -> (TcpServer, Arc<EchoFactory>, u16) {
    let factory = Arc::new(EchoFactory::default());
    let server = TcpServer::new(desc, factory.clone()).unwrap();
    assert!(server.open());
    let port = server.local_endpoint().port;
    assert_ne!(port, 0);
    (server, factory, port)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).unwrap();
    let mut out = vec![0u8; payload.len()];
    stream.read_exact(&mut out).unwrap();
    out
}

#[test]
fn test_accepts_multiple_clients() {
    let mut desc = server_description();
    desc.max_connections = 5;
    let (server, factory, port) = start(desc);

    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    server.hooks().on_accept(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let _a = connect(port);
    let _b = connect(port);
    let _c = connect(port);

    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 3));
    assert!(wait_until(Duration::from_secs(3), || {
        accepted.load(Ordering::SeqCst) == 3
    }));
    assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    assert_eq!(server.clients().len(), 3);
}

#[test]
fn test_close_wakes_blocked_reactor() {
    let (server, _factory, port) = start(server_description());
    let _client = connect(port);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 1));

    // 事件循环此时阻塞在无超时的 wait 中
    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    server.close();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!server.connected());
    assert_eq!(server.client_count(), 0);
}

#[test]
fn test_reopen_after_close() {
    let (server, _factory, _port) = start(server_description());
    server.close();
    assert!(server.open());
    let port = server.local_endpoint().port;
    let mut client = connect(port);
    assert_eq!(echo_roundtrip(&mut client, b"again"), b"again");
}

#[test]
fn test_max_connections_rejects_extra_peers() {
    let mut desc = server_description();
    desc.max_connections = 2;
    let (server, _factory, port) = start(desc);

    let _a = connect(port);
    let _b = connect(port);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 2));

    let mut c = connect(port);
    let mut buf = [0u8; 1];
    // 多余的连接被直接关闭
    let n = c.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(server.client_count(), 2);
}

#[test]
fn test_sync_strategy_echo() {
    let (server, factory, port) = start(server_description());
    let mut client = connect(port);
    assert_eq!(echo_roundtrip(&mut client, b"hello"), b"hello");
    assert_eq!(factory.received.lock().as_slice(), b"hello");
    drop(server);
}

#[test]
fn test_async_strategy_echo() {
    let mut desc = server_description();
    desc.receiver = StrategyKind::Async;
    desc.sender = StrategyKind::Async;
    let (_server, _factory, port) = start(desc);
    let mut client = connect(port);
    assert_eq!(echo_roundtrip(&mut client, b"async"), b"async");
}

#[test]
fn test_multiplexing_strategy_echo() {
    let mut desc = server_description();
    desc.receiver = StrategyKind::Multiplexing;
    desc.sender = StrategyKind::Multiplexing;
    let (_server, _factory, port) = start(desc);
    let mut a = connect(port);
    let mut b = connect(port);
    assert_eq!(echo_roundtrip(&mut a, b"first"), b"first");
    assert_eq!(echo_roundtrip(&mut b, b"second"), b"second");
}

#[test]
fn test_close_client_is_swept() {
    let (server, factory, port) = start(server_description());
    let closed_hook = Arc::new(Mutex::new(Vec::<Endpoint>::new()));
    let sink = closed_hook.clone();
    server.hooks().on_close(move |peer| sink.lock().push(peer.clone()));

    let mut client = connect(port);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 1));
    let peer = server.clients()[0].clone();
    assert!(server.get_client(&peer).is_some());

    assert!(server.close_client(&peer));
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 0));
    assert!(server.get_client(&peer).is_none());
    assert!(wait_until(Duration::from_secs(3), || {
        factory.closed.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(closed_hook.lock().as_slice(), &[peer.clone()]);

    // 服务端已关闭套接字
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    assert!(!server.close_client(&peer));
}

#[test]
fn test_peer_disconnect_is_swept() {
    let (server, factory, port) = start(server_description());
    let client = connect(port);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 1));

    drop(client);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 0));
    assert!(wait_until(Duration::from_secs(3), || {
        factory.closed.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn test_idle_timeout_disconnects_silent_peer() {
    let mut desc = server_description();
    desc.idle_timeout_ms = 100;
    let (server, _factory, port) = start(desc);
    let _client = connect(port);
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 1));
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 0));
}

#[test]
fn test_bind_conflict_fails_after_retries() {
    let (first, _factory, port) = start(server_description());
    let mut desc = server_description();
    desc.port = port;
    desc.bind_attempts = 2;
    desc.bind_retry_delay_ms = 10;
    let second = TcpServer::new(desc, Arc::new(EchoFactory::default())).unwrap();
    assert!(!second.open());
    drop(first);
}

#[test]
fn test_tls_echo() {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = certified.cert.pem();
    let cert_file = dir.path().join("cert.pem");
    let key_file = dir.path().join("key.pem");
    std::fs::write(&cert_file, &cert_pem).unwrap();
    std::fs::write(&key_file, certified.key_pair.serialize_pem()).unwrap();

    let mut desc = server_description();
    desc.tls = Some(TlsFiles {
        key_file,
        cert_file,
        ca_file: None,
    });
    let (_server, factory, port) = start(desc);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = rustls::RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
    let mut tls = rustls::StreamOwned::new(conn, connect(port));

    tls.write_all(b"secret").unwrap();
    let mut out = [0u8; 6];
    tls.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"secret");
    assert_eq!(factory.received.lock().as_slice(), b"secret");
}
