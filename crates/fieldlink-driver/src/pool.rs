//! 指令池（调度队列）
//!
//! 每个设备一个指令池，后台定时器周期性地排空队列：
//!
//! ```text
//! queued ──tick──► executing ──► processed
//!    └──────tick（链路断开）──────► discarded
//! ```
//!
//! - 入队永不阻塞；链路已知断开且未暂停时直接拒绝，描述当场释放
//! - 每次 tick 只在交换队列时持锁，执行期间不持锁
//! - 链路断开时整批丢弃，健康回调只调用一次
//! - 同步调用方等待到接收超时为止，超时返回 `None`；
//!   之后执行完成的结果由指令池自行释放

use crate::config::PoolDescription;
use crate::context::InstructionContext;
use crate::device::Device;
use crate::instruction::InstructionDescription;
use crate::metrics::PoolMetrics;
use crate::sampler::HealthMonitor;
use fieldlink_transport::thread_util::{join_logged, sleep_while_running};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 入队凭证
pub type Ticket = u64;

/// 定时器线程 join 超时
const TIMER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 指令优先级
///
/// 只在开启 `priority_sort` 的指令池中生效，作为入队顺序之后的次要排序键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// 指令池回调
pub trait PoolHooks: Send + Sync {
    /// 每次排空前调用（可在此补充入队）
    fn before_drain(&self, pool: &InstructionPool) {
        let _ = pool;
    }

    /// 每条指令的执行结果
    ///
    /// `instruction = None` 表示整批因链路断开被丢弃。
    fn error_handle(&self, device: &Device, instruction: Option<&str>, failed: bool);
}

struct Packet {
    ticket: Ticket,
    priority: Priority,
    description: InstructionDescription,
}

/// 同步调用方持有的凭证状态
enum Completion {
    Pending,
    Done(Option<InstructionContext>),
}

/// 指令池
pub struct InstructionPool {
    device: Arc<Device>,
    description: PoolDescription,
    queue: Mutex<Vec<Packet>>,
    /// 同步调用方保留的凭证
    retained: Mutex<HashMap<Ticket, Completion>>,
    completed: Condvar,
    next_ticket: AtomicU64,
    running: Arc<AtomicBool>,
    paused: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    hooks: RwLock<Vec<Arc<dyn PoolHooks>>>,
    health: Option<Arc<HealthMonitor>>,
    metrics: PoolMetrics,
}

impl InstructionPool {
    /// 创建指令池
    ///
    /// 配置了 `sampler` 时附带健康检测。
    pub fn new(device: Arc<Device>, description: PoolDescription) -> Arc<Self> {
        let health = description
            .sampler
            .clone()
            .map(|sampler| Arc::new(HealthMonitor::new(sampler)));
        let hooks: Vec<Arc<dyn PoolHooks>> = health
            .iter()
            .map(|h| h.clone() as Arc<dyn PoolHooks>)
            .collect();
        Arc::new(Self {
            device,
            description,
            queue: Mutex::new(Vec::new()),
            retained: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            next_ticket: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            timer: Mutex::new(None),
            hooks: RwLock::new(hooks),
            health,
            metrics: PoolMetrics::new(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn description(&self) -> &PoolDescription {
        &self.description
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// 健康检测（普通指令池为 `None`）
    pub fn health(&self) -> Option<&Arc<HealthMonitor>> {
        self.health.as_ref()
    }

    /// 追加回调
    pub fn add_hooks(&self, hooks: Arc<dyn PoolHooks>) {
        self.hooks.write().push(hooks);
    }

    /// 队列中等待执行的指令数
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 异步入队
    ///
    /// 被拒绝时返回 `None`，描述在此释放。
    pub fn add_instruction(
        &self,
        description: InstructionDescription,
        priority: Priority,
    ) -> Option<Ticket> {
        self.enqueue(description, priority, false)
    }

    /// 同步执行：入队后阻塞等待结果
    ///
    /// 超时或被拒绝时返回 `None`；设备返回的错误状态体现在上下文的异常槽中。
    pub fn execute_instruction_sync(
        &self,
        description: InstructionDescription,
        priority: Priority,
    ) -> Option<InstructionContext> {
        let timeout = self.reply_timeout(&description);
        let ticket = self.enqueue(description, priority, true)?;
        // 排队等待最多一个 tick
        let deadline = Instant::now() + timeout + self.description.tick_interval();

        let mut retained = self.retained.lock();
        loop {
            match retained.get(&ticket) {
                Some(Completion::Done(_)) => {
                    return match retained.remove(&ticket) {
                        Some(Completion::Done(result)) => result,
                        _ => None,
                    };
                },
                Some(Completion::Pending) => {},
                None => return None,
            }
            if self.completed.wait_until(&mut retained, deadline).timed_out() {
                if let Some(Completion::Done(result)) = retained.remove(&ticket) {
                    return result;
                }
                // 交给指令池：执行完成后结果直接释放
                self.metrics.sync_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Pool {}: ticket {} timed out", self.device.name(), ticket);
                return None;
            }
        }
    }

    fn reply_timeout(&self, description: &InstructionDescription) -> Duration {
        description
            .timeout
            .or_else(|| {
                self.device
                    .instructions()
                    .find(&description.name)
                    .and_then(|(instruction, _guard)| instruction.timeout())
            })
            .unwrap_or_else(|| self.device.channel().receive_timeout())
    }

    fn enqueue(
        &self,
        description: InstructionDescription,
        priority: Priority,
        retain: bool,
    ) -> Option<Ticket> {
        if !self.is_paused() && !self.device.channel().connected() {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Pool {}: rejected {} (channel disconnected)",
                self.device.name(),
                description.name
            );
            return None;
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.description.max_pending {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Pool {}: queue full ({}), rejected {}",
                self.device.name(),
                self.description.max_pending,
                description.name
            );
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        if retain {
            self.retained.lock().insert(ticket, Completion::Pending);
        }
        queue.push(Packet {
            ticket,
            priority,
            description,
        });
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        trace!("Pool {}: queued ticket {}", self.device.name(), ticket);
        Some(ticket)
    }

    fn complete(&self, ticket: Ticket, result: Option<InstructionContext>) {
        let mut retained = self.retained.lock();
        if let Some(slot) = retained.get_mut(&ticket) {
            *slot = Completion::Done(result);
            self.completed.notify_all();
        }
    }

    fn report(&self, instruction: Option<&str>, failed: bool) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.error_handle(&self.device, instruction, failed);
        }
    }

    /// 排空一次队列
    ///
    /// 由定时器线程调用，也可手动驱动（测试或自定义事件循环）。
    pub fn tick(&self) {
        if self.is_paused() {
            return;
        }
        let hooks = self.hooks.read().clone();
        for hook in &hooks {
            hook.before_drain(self);
        }
        self.device.instructions().maybe_reclaim();

        let mut batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return;
        }

        if !self.device.channel().connected() {
            let count = batch.len() as u64;
            for packet in batch {
                self.complete(packet.ticket, None);
            }
            self.metrics.discarded.fetch_add(count, Ordering::Relaxed);
            debug!(
                "Pool {}: discarded {} packets (channel disconnected)",
                self.device.name(),
                count
            );
            self.report(None, true);
            return;
        }

        if self.description.priority_sort {
            // 稳定排序：同优先级保持入队顺序
            batch.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        for packet in batch {
            let result = self.device.execute(&packet.description);
            let failed = match &result {
                Ok(context) => context.has_exception(),
                Err(e) => {
                    debug!(
                        "Pool {}: {} failed: {}",
                        self.device.name(),
                        packet.description.name,
                        e
                    );
                    true
                },
            };
            self.metrics.executed.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            }
            self.report(Some(&packet.description.name), failed);
            self.complete(packet.ticket, result.ok());
        }
    }

    /// 启动定时器线程
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::downgrade(self);
        let running = self.running.clone();
        let interval = self.description.tick_interval();
        let spawned = std::thread::Builder::new()
            .name(format!("fieldlink-pool-{}", self.device.name()))
            .spawn(move || timer_loop(pool, running, interval));
        match spawned {
            Ok(handle) => {
                *self.timer.lock() = Some(handle);
                info!("Pool {} started", self.device.name());
            },
            Err(e) => {
                warn!("Pool {}: failed to spawn timer: {}", self.device.name(), e);
                self.running.store(false, Ordering::Release);
            },
        }
    }

    /// 停止定时器线程，丢弃仍在排队的指令
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.timer.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            join_logged(Some(handle), "pool timer", TIMER_JOIN_TIMEOUT);
        }

        let leftover = std::mem::take(&mut *self.queue.lock());
        if !leftover.is_empty() {
            self.metrics
                .discarded
                .fetch_add(leftover.len() as u64, Ordering::Relaxed);
            for packet in leftover {
                self.complete(packet.ticket, None);
            }
        }
        debug!("Pool {} stopped", self.device.name());
    }

    /// 暂停：保持链路状态，tick 不再执行，入队不再因断线被拒绝
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

impl Drop for InstructionPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn timer_loop(pool: Weak<InstructionPool>, running: Arc<AtomicBool>, interval: Duration) {
    while sleep_while_running(&running, interval) {
        match pool.upgrade() {
            Some(pool) => pool.tick(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::context::{KEY_PAYLOAD, KEY_REPLY};
    use crate::{FrameInstruction, InstructionSet};
    use fieldlink_protocol::FrameLayout;
    use fieldlink_transport::ChannelDescription;
    use fieldlink_transport::mock::MockInteractive;

    fn setup(description: PoolDescription) -> (Arc<MockInteractive>, Arc<InstructionPool>) {
        let mut channel_description = ChannelDescription::tcp_client("mock", 1);
        channel_description.receive_timeout_ms = 200;
        let mock = Arc::new(MockInteractive::new(channel_description));
        let channel = Channel::new(mock.clone());
        let layout = FrameLayout::default();
        let set = Arc::new(InstructionSet::new(
            "meter",
            layout,
            vec![
                Arc::new(FrameInstruction::new("sample", layout, 0x01)),
                Arc::new(FrameInstruction::new("read", layout, 0x02)),
            ],
        ));
        let device = Device::new("meter-1", set, &channel);
        assert!(channel.open());
        (mock, InstructionPool::new(device, description))
    }

    fn read(tag: u8) -> InstructionDescription {
        InstructionDescription::new("read")
            .with_context(InstructionContext::new().with(KEY_PAYLOAD, vec![tag]))
    }

    #[test]
    fn test_tick_executes_in_arrival_order() {
        let (mock, pool) = setup(PoolDescription::default());
        mock.set_responder(|request| Some(request.to_vec()));
        for tag in 0..3 {
            assert!(pool.add_instruction(read(tag), Priority::Normal).is_some());
        }
        assert_eq!(pool.pending_len(), 3);
        pool.tick();
        assert_eq!(pool.pending_len(), 0);

        let sent: Vec<u8> = mock
            .sent()
            .iter()
            .map(|frame| frame[FrameLayout::default().payload_offset()])
            .collect();
        assert_eq!(sent, vec![0, 1, 2]);
        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.executed, 3);
        assert_eq!(snapshot.failed, 0);
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let (mock, pool) = setup(PoolDescription {
            priority_sort: true,
            ..Default::default()
        });
        mock.set_responder(|request| Some(request.to_vec()));
        pool.add_instruction(read(0), Priority::Low);
        pool.add_instruction(read(1), Priority::High);
        pool.add_instruction(read(2), Priority::Normal);
        pool.add_instruction(read(3), Priority::High);
        pool.tick();

        let order: Vec<u8> = mock
            .sent()
            .iter()
            .map(|frame| frame[FrameLayout::default().payload_offset()])
            .collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_queue_limit() {
        let (_mock, pool) = setup(PoolDescription {
            max_pending: 2,
            ..Default::default()
        });
        assert!(pool.add_instruction(read(0), Priority::Normal).is_some());
        assert!(pool.add_instruction(read(1), Priority::Normal).is_some());
        assert!(pool.add_instruction(read(2), Priority::Normal).is_none());
        assert_eq!(pool.metrics().snapshot().rejected, 1);
    }

    #[test]
    fn test_paused_pool_accepts_but_does_not_execute() {
        let (mock, pool) = setup(PoolDescription::default());
        pool.pause();
        mock.set_connected(false);
        assert!(pool.add_instruction(read(0), Priority::Normal).is_some());
        pool.tick();
        assert_eq!(pool.pending_len(), 1);

        pool.resume();
        pool.tick();
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.metrics().snapshot().discarded, 1);
    }

    #[test]
    fn test_sync_execution_returns_context() {
        let (mock, pool) = setup(PoolDescription {
            tick_interval_ms: 5,
            ..Default::default()
        });
        mock.set_responder(|request| Some(request.to_vec()));
        pool.start();
        let context = pool.execute_instruction_sync(read(9), Priority::Normal).unwrap();
        assert_eq!(context.get_bytes(KEY_REPLY), Some(&[9][..]));
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn test_stop_discards_queued_packets() {
        let (_mock, pool) = setup(PoolDescription::default());
        pool.add_instruction(read(0), Priority::Normal);
        pool.stop();
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.metrics().snapshot().discarded, 1);
    }
}
