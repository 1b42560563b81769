//! 链路
//!
//! 一个 `Channel` 绑定一份 [`ChannelDescription`] 与一个传输实例，
//! 同一管理器内每个端点只有一个 `Channel`，可以服务多个设备。
//!
//! 入站字节的交付方式取决于传输：
//!
//! - 推送型（服务端对端链路）：传输层直接调用 [`Channel::dispatch`]
//! - `async` 接收策略：后台泵线程循环 `receive()`，再分发给所有绑定设备
//! - `sync` 接收策略：执行指令的线程在等待应答时自行读取

use crate::device::Device;
use crate::events::ChannelHooks;
use fieldlink_transport::thread_util::{join_logged, sleep_while_running};
use fieldlink_transport::{
    ChannelDescription, Interactive, ServerInteractive, StrategyKind, TransportError,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 泵线程单次 receive 的最长阻塞时间
const PUMP_POLL: Duration = Duration::from_millis(100);

/// 泵线程 join 超时
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 泵线程及其专属的停止标志
struct Pump {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

/// 链路
pub struct Channel {
    key: String,
    interactive: Arc<dyn Interactive>,
    devices: RwLock<Vec<Weak<Device>>>,
    pump: Mutex<Option<Pump>>,
    opened_once: AtomicBool,
    reopening: AtomicBool,
    opened: ChannelHooks,
    closed: ChannelHooks,
}

impl Channel {
    pub fn new(interactive: Arc<dyn Interactive>) -> Arc<Self> {
        Arc::new(Self {
            key: interactive.description().key(),
            interactive,
            devices: RwLock::new(Vec::new()),
            pump: Mutex::new(None),
            opened_once: AtomicBool::new(false),
            reopening: AtomicBool::new(false),
            opened: ChannelHooks::new(),
            closed: ChannelHooks::new(),
        })
    }

    /// 唯一标识（`kind://address:port`）
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> &ChannelDescription {
        self.interactive.description()
    }

    pub fn interactive(&self) -> &Arc<dyn Interactive> {
        &self.interactive
    }

    /// 服务端能力
    pub fn server(&self) -> Option<&dyn ServerInteractive> {
        self.interactive.as_server()
    }

    /// 打开链路
    ///
    /// 成功后触发 opened 通知，需要时启动接收泵。
    pub fn open(self: &Arc<Self>) -> bool {
        if !self.interactive.open() {
            debug!("Channel {} failed to open", self.key);
            return false;
        }
        self.opened_once.store(true, Ordering::Release);
        self.start_pump();
        info!("Channel {} opened", self.key);
        self.opened.fire(&self.key);
        true
    }

    /// 关闭链路
    pub fn close(&self) {
        self.stop_pump();
        self.interactive.close();
        info!("Channel {} closed", self.key);
        self.closed.fire(&self.key);
    }

    /// 强制重连（即使当前仍显示已连接）
    ///
    /// 已有重连在进行时直接返回 false。
    pub fn reopen(self: &Arc<Self>) -> bool {
        if self.reopening.swap(true, Ordering::AcqRel) {
            debug!("Channel {} reopen already in progress", self.key);
            return false;
        }
        info!("Reopening channel {}", self.key);
        self.stop_pump();
        self.interactive.close();
        self.closed.fire(&self.key);
        for device in self.devices() {
            device.reset_session();
        }
        let opened = self.open();
        self.reopening.store(false, Ordering::Release);
        opened
    }

    pub fn connected(&self) -> bool {
        self.interactive.connected()
    }

    /// 是否曾经成功打开过
    pub fn has_opened(&self) -> bool {
        self.opened_once.load(Ordering::Acquire)
    }

    /// 是否允许自动重连
    pub fn reopenable(&self) -> bool {
        self.description().reopen
    }

    pub fn is_push(&self) -> bool {
        self.interactive.is_push()
    }

    pub fn pump_active(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|pump| pump.running.load(Ordering::Acquire))
    }

    /// 入站数据是否由后台交付（推送或泵线程）
    pub fn delivers_inbound(&self) -> bool {
        self.is_push() || self.pump_active()
    }

    pub fn receive_timeout(&self) -> Duration {
        self.description().receive_timeout()
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let sent = self.interactive.send(data)?;
        trace!("Channel {} sent {} bytes", self.key, sent);
        Ok(sent)
    }

    pub fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        self.interactive.receive(buffer, timeout)
    }

    /// 绑定设备（只持有弱引用）
    pub fn bind(&self, device: &Arc<Device>) {
        let mut devices = self.devices.write();
        devices.retain(|d| d.strong_count() > 0);
        devices.push(Arc::downgrade(device));
    }

    /// 当前绑定的设备
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// 把入站字节分发给所有绑定设备
    pub fn dispatch(&self, data: &[u8]) {
        trace!("Channel {} received {} bytes", self.key, data.len());
        for device in self.devices() {
            device.on_bytes(data);
        }
    }

    /// 链路打开通知（参数为链路 key）
    pub fn on_opened<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.opened.subscribe(callback);
    }

    /// 链路关闭通知（参数为链路 key）
    pub fn on_closed<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.closed.subscribe(callback);
    }

    fn needs_pump(&self) -> bool {
        let description = self.description();
        !self.is_push()
            && !description.kind.is_server()
            && description.receiver != StrategyKind::Sync
    }

    fn start_pump(self: &Arc<Self>) {
        if !self.needs_pump() {
            return;
        }
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let channel = Arc::downgrade(self);
        let interactive = self.interactive.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let buffer_size = self.description().read_buffer_size();
        let spawned = std::thread::Builder::new()
            .name(format!("fieldlink-pump-{}", self.description().display_name()))
            .spawn(move || pump_loop(channel, interactive, flag, buffer_size));
        match spawned {
            Ok(handle) => *pump = Some(Pump { handle, running }),
            Err(e) => warn!("Channel {}: failed to spawn receive pump: {}", self.key, e),
        }
    }

    fn stop_pump(&self) {
        let Some(pump) = self.pump.lock().take() else {
            return;
        };
        pump.running.store(false, Ordering::Release);
        if pump.handle.thread().id() == std::thread::current().id() {
            // 在泵线程内部触发的关闭：本线程看到自己的标志后退出，不 join 自己
            return;
        }
        join_logged(Some(pump.handle), "receive pump", PUMP_JOIN_TIMEOUT);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.running.store(false, Ordering::Release);
        }
    }
}

fn pump_loop(
    channel: Weak<Channel>,
    interactive: Arc<dyn Interactive>,
    running: Arc<AtomicBool>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    debug!("Receive pump started");
    while running.load(Ordering::Acquire) {
        match interactive.receive(&mut buffer, Some(PUMP_POLL)) {
            Ok(0) => {},
            Ok(n) => match channel.upgrade() {
                Some(channel) => channel.dispatch(&buffer[..n]),
                None => break,
            },
            Err(e) if e.is_disconnect() => {
                // 等待健康检测触发重连
                sleep_while_running(&running, PUMP_POLL);
            },
            Err(e) => {
                warn!("Receive pump error: {}", e);
                sleep_while_running(&running, PUMP_POLL);
            },
        }
    }
    debug!("Receive pump stopped");
}
