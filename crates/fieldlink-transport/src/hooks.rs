//! 服务端对端事件钩子
//!
//! accept / close 通知以订阅列表表示，回调在锁外执行：
//! 触发时先克隆回调列表再逐个调用，回调内部可以安全地再次注册回调。

use crate::Endpoint;
use parking_lot::RwLock;
use std::sync::Arc;

/// 对端事件回调
///
/// 在事件循环或清理线程上调用，必须尽快返回。
pub type PeerCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

/// accept/close 订阅列表
#[derive(Default)]
pub struct ServerHooks {
    accepted: RwLock<Vec<PeerCallback>>,
    closed: RwLock<Vec<PeerCallback>>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅新连接
    pub fn on_accept<F>(&self, callback: F)
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.accepted.write().push(Arc::new(callback));
    }

    /// 订阅连接移除
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.closed.write().push(Arc::new(callback));
    }

    pub fn fire_accepted(&self, peer: &Endpoint) {
        let callbacks = self.accepted.read().clone();
        for callback in callbacks {
            callback(peer);
        }
    }

    pub fn fire_closed(&self, peer: &Endpoint) {
        let callbacks = self.closed.read().clone();
        for callback in callbacks {
            callback(peer);
        }
    }

    /// 清空所有订阅
    pub fn clear(&self) {
        self.accepted.write().clear();
        self.closed.write().clear();
    }
}

impl std::fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHooks")
            .field("accepted", &self.accepted.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_calls_every_subscriber() {
        let hooks = ServerHooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            hooks.on_accept(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.fire_accepted(&Endpoint::new("127.0.0.1", 1));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        hooks.fire_closed(&Endpoint::new("127.0.0.1", 1));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reentrant_subscription() {
        let hooks = Arc::new(ServerHooks::new());
        let inner = hooks.clone();
        hooks.on_close(move |_| {
            // 回调中再次订阅不会死锁
            inner.on_close(|_| {});
        });
        hooks.fire_closed(&Endpoint::empty());
        assert_eq!(hooks.closed.read().len(), 2);

        hooks.clear();
        assert_eq!(hooks.closed.read().len(), 0);
    }
}
