//! Mock 传输（无硬件/无套接字，用于上层测试）
//!
//! 启用 `mock` feature 后可用。支持：
//! - 控制 `open()` 结果与连接状态
//! - 记录所有发送的数据
//! - 注入入站数据，或安装应答脚本（收到请求后自动产生回复）

use crate::{ChannelDescription, Interactive, TransportError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// 应答脚本：返回 `Some(reply)` 时把回复放入入站队列
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Mock 链路
///
/// # Example
///
/// ```
/// use fieldlink_transport::mock::MockInteractive;
/// use fieldlink_transport::{ChannelDescription, Interactive};
///
/// let mock = MockInteractive::new(ChannelDescription::tcp_client("mock", 1));
/// mock.set_responder(|request| Some(request.to_vec()));
/// assert!(mock.open());
/// mock.send(b"echo").unwrap();
///
/// let mut buf = [0u8; 8];
/// let n = mock.receive(&mut buf, None).unwrap();
/// assert_eq!(&buf[..n], b"echo");
/// ```
pub struct MockInteractive {
    description: ChannelDescription,
    connected: AtomicBool,
    open_result: AtomicBool,
    open_count: AtomicUsize,
    push: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<VecDeque<u8>>,
    inbound_ready: Condvar,
    responder: Mutex<Option<Responder>>,
}

impl MockInteractive {
    pub fn new(description: ChannelDescription) -> Self {
        Self {
            description,
            connected: AtomicBool::new(false),
            open_result: AtomicBool::new(true),
            open_count: AtomicUsize::new(0),
            push: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            responder: Mutex::new(None),
        }
    }

    /// 设置后续 `open()` 的结果
    pub fn set_open_result(&self, result: bool) {
        self.open_result.store(result, Ordering::SeqCst);
    }

    /// 模拟链路断开/恢复
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.inbound_ready.notify_all();
    }

    /// 模拟推送型链路
    pub fn set_push(&self, push: bool) {
        self.push.store(push, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// 已发送的数据（每次 `send` 一条）
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// 注入入站数据
    pub fn inject(&self, data: &[u8]) {
        self.inbound.lock().extend(data.iter().copied());
        self.inbound_ready.notify_all();
    }

    /// 安装应答脚本
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        self.responder.lock().take();
    }
}

impl Interactive for MockInteractive {
    fn description(&self) -> &ChannelDescription {
        &self.description
    }

    fn open(&self) -> bool {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let result = self.open_result.load(Ordering::SeqCst);
        self.connected.store(result, Ordering::SeqCst);
        result
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().clear();
        self.inbound_ready.notify_all();
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn available(&self) -> usize {
        self.inbound.lock().len()
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(data.to_vec());
        let reply = match self.responder.lock().as_mut() {
            Some(responder) => responder(data),
            None => None,
        };
        if let Some(reply) = reply {
            self.inject(&reply);
        }
        Ok(data.len())
    }

    fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.description.receive_timeout());
        let mut inbound = self.inbound.lock();
        loop {
            if !self.connected() {
                return Err(TransportError::NotConnected);
            }
            if !inbound.is_empty() {
                let n = buffer.len().min(inbound.len());
                for (slot, byte) in buffer.iter_mut().zip(inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self.inbound_ready.wait_until(&mut inbound, deadline).timed_out() {
                return Ok(0);
            }
        }
    }

    fn is_push(&self) -> bool {
        self.push.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mock() -> MockInteractive {
        MockInteractive::new(ChannelDescription::tcp_client("mock", 1))
    }

    #[test]
    fn test_open_result_controls_connection() {
        let m = mock();
        m.set_open_result(false);
        assert!(!m.open());
        assert!(!m.connected());
        assert!(m.send(b"x").is_err());

        m.set_open_result(true);
        assert!(m.open());
        assert_eq!(m.open_count(), 2);
    }

    #[test]
    fn test_receive_times_out_with_zero() {
        let m = mock();
        m.open();
        let mut buf = [0u8; 4];
        assert_eq!(
            m.receive(&mut buf, Some(Duration::from_millis(10))).unwrap(),
            0
        );
    }

    #[test]
    fn test_inject_wakes_blocked_receiver() {
        let m = Arc::new(mock());
        m.open();
        let injector = m.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            injector.inject(&[1, 2, 3]);
        });
        let mut buf = [0u8; 8];
        let n = m.receive(&mut buf, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        handle.join().unwrap();
    }

    #[test]
    fn test_records_sent_frames() {
        let m = mock();
        m.open();
        m.send(b"a").unwrap();
        m.send(b"bc").unwrap();
        assert_eq!(m.sent(), vec![b"a".to_vec(), b"bc".to_vec()]);
    }
}
