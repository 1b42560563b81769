//! 事件与回调
//!
//! 每种通知一个订阅列表：
//!
//! | 通知 | 事件类型 |
//! |---|---|
//! | 设备收到匹配帧 | [`ReceivedEvent`] |
//! | 设备状态变化 | [`StatusChange`](crate::StatusChange) |
//! | 链路打开/关闭 | 链路 key（`&str`） |
//!
//! 触发时先复制回调列表再逐个调用，回调里可以安全地再注册回调。

use crate::status::StatusChange;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 订阅列表
pub struct Hooks<E: ?Sized> {
    callbacks: RwLock<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E: ?Sized> Default for Hooks<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }
}

impl<E: ?Sized> Hooks<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册回调
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// 触发所有回调
    pub fn fire(&self, event: &E) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    pub fn clear(&self) {
        self.callbacks.write().clear();
    }
}

/// 设备收到匹配帧
pub type ReceivedHooks = Hooks<ReceivedEvent>;
/// 设备状态变化
pub type StatusHooks = Hooks<StatusChange>;
/// 链路打开/关闭
pub type ChannelHooks = Hooks<str>;

/// 收到事件
///
/// 只针对完整、校验通过且匹配到指令的帧触发。
/// 订阅者调用 [`ReceivedEvent::set_handled`] 后，设备不再执行默认的指令解析
/// （用于文件传输等自定义二进制负载的路由）。
#[derive(Debug)]
pub struct ReceivedEvent {
    device: String,
    instruction: String,
    frame: Bytes,
    payload: Bytes,
    handled: AtomicBool,
}

impl ReceivedEvent {
    pub fn new(
        device: impl Into<String>,
        instruction: impl Into<String>,
        frame: Bytes,
        payload: Bytes,
    ) -> Self {
        Self {
            device: device.into(),
            instruction: instruction.into(),
            frame,
            payload,
            handled: AtomicBool::new(false),
        }
    }

    /// 收到帧的设备名
    pub fn device(&self) -> &str {
        &self.device
    }

    /// 匹配到的指令名
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// 完整帧
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// 解码后的负载
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 帧序号
    pub fn frame_id(&self) -> u8 {
        self.frame.get(1).copied().unwrap_or(0)
    }

    /// 标记为已处理，跳过默认执行
    pub fn set_handled(&self) {
        self.handled.store(true, Ordering::Release);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }
}
