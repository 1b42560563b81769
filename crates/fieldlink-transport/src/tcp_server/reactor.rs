//! 就绪事件循环
//!
//! 基于 mio（Linux 上为 epoll，BSD/macOS 为 kqueue，Windows 为 IOCP）。
//! 对外只暴露 register / deregister / wait / wake 四个操作，
//! `wake` 是关闭流程的一部分：`close()` 通过它把阻塞在 `wait` 中的线程唤醒。

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 监听套接字
pub(crate) const LISTENER: Token = Token(0);
/// 退出/唤醒信号
pub(crate) const WAKE: Token = Token(1);
/// 对端 token 起始值
pub(crate) const FIRST_PEER: usize = 2;

/// 事件循环（由 reactor 线程独占）
pub(crate) struct Reactor {
    poll: Poll,
    handle: ReactorHandle,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        Ok(Self {
            poll,
            handle: ReactorHandle {
                registry: Arc::new(registry),
                waker: Arc::new(waker),
            },
        })
    }

    /// 跨线程句柄（注册/注销/唤醒）
    pub(crate) fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub(crate) fn register_listener(&self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER, Interest::READABLE)
    }

    /// 阻塞等待就绪事件
    ///
    /// 被信号打断时返回空事件集而不是错误。
    pub(crate) fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            },
            Err(e) => Err(e),
        }
    }
}

/// 事件循环句柄
#[derive(Clone)]
pub(crate) struct ReactorHandle {
    registry: Arc<Registry>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// 注册对端（读 + 写就绪，边沿触发）
    pub(crate) fn register_peer(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.registry
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// 注销对端
    ///
    /// 必须在释放对端之前调用，之后该 token 不会再产生事件。
    #[cfg(unix)]
    pub(crate) fn deregister_peer(&self, stream: &TcpStream) -> io::Result<()> {
        use mio::unix::SourceFd;
        use std::os::fd::AsRawFd;

        let fd = stream.as_raw_fd();
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// 注销对端（非 unix 平台在关闭套接字时由系统移除）
    #[cfg(not(unix))]
    pub(crate) fn deregister_peer(&self, _stream: &TcpStream) -> io::Result<()> {
        Ok(())
    }

    /// 唤醒阻塞中的 `wait`
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!("Failed to wake reactor: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wake_interrupts_wait() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.wake();
        });

        let mut events = Events::with_capacity(8);
        let start = Instant::now();
        reactor.wait(&mut events, Some(Duration::from_secs(10))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|e| e.token() == WAKE));
        waker.join().unwrap();
    }

    #[test]
    fn test_listener_readiness() {
        let mut reactor = Reactor::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        reactor.register_listener(&mut listener).unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while !seen && Instant::now() < deadline {
            reactor
                .wait(&mut events, Some(Duration::from_millis(100)))
                .unwrap();
            seen = events.iter().any(|e| e.token() == LISTENER);
        }
        assert!(seen);
    }
}
