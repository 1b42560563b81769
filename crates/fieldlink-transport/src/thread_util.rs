//! 后台线程工具

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};

/// 带超时的 join
///
/// 在独立的看门狗线程中 join，调用方只阻塞到超时为止。
pub trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// join 后台线程，超时只记录日志
pub fn join_logged(handle: Option<JoinHandle<()>>, what: &str, timeout: Duration) {
    if let Some(handle) = handle
        && handle.join_timeout(timeout).is_err()
    {
        tracing::error!(
            "{} thread panicked or failed to shut down within {:?}",
            what,
            timeout
        );
    }
}

/// 可被运行标志打断的睡眠
///
/// 以 10ms 为粒度检查 `running`，返回 `false` 表示已被要求退出。
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}
