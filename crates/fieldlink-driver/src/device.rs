//! 设备
//!
//! 设备 = 指令集 + 所属链路 + 会话状态。
//!
//! 入站字节先经 [`FrameAssembler`] 重组为完整帧，再按以下顺序处理：
//!
//! 1. 转发给接收转发目标（共享同一物理链路的其他逻辑设备）
//! 2. 优先交给等待应答的执行者（帧序号关联）
//! 3. 否则在指令集中查找匹配指令（先静态后动态）
//! 4. 触发 received 事件；订阅者未标记 handled 时执行默认解析
//!
//! 校验失败或没有匹配指令的帧静默丢弃，不触发任何通知。

use crate::channel::Channel;
use crate::context::InstructionContext;
use crate::error::DriverError;
use crate::events::{ReceivedEvent, ReceivedHooks, StatusHooks};
use crate::instruction::{Instruction, InstructionDescription, InstructionSession};
use crate::instruction_set::{ExecutionGuard, InstructionSet};
use crate::status::{AtomicDeviceStatus, DeviceStatus, StatusChange};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use fieldlink_protocol::FrameAssembler;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// 等待应答的执行者
struct PendingReply {
    id: u64,
    instruction: Arc<dyn Instruction>,
    reply: Sender<Bytes>,
}

/// 设备
pub struct Device {
    name: String,
    instructions: Arc<InstructionSet>,
    session: InstructionSession,
    channel: Arc<Channel>,
    assembler: Mutex<FrameAssembler>,
    pending: Mutex<Vec<PendingReply>>,
    next_pending: AtomicU64,
    fanout: RwLock<Vec<Weak<Device>>>,
    /// 接收转发注册时从源设备重新绑定的同名指令
    rebound: RwLock<HashMap<String, Arc<dyn Instruction>>>,
    received: Arc<ReceivedHooks>,
    status: AtomicDeviceStatus,
    status_hooks: StatusHooks,
    last_received: Mutex<HashMap<String, InstructionContext>>,
}

impl Device {
    /// 创建设备并绑定到链路
    pub fn new(
        name: impl Into<String>,
        instructions: Arc<InstructionSet>,
        channel: &Arc<Channel>,
    ) -> Arc<Self> {
        Self::with_received_hooks(name, instructions, channel, Arc::new(ReceivedHooks::new()))
    }

    /// 与其他设备共享 received 订阅（服务端对端设备沿用模板设备的订阅）
    pub fn with_received_hooks(
        name: impl Into<String>,
        instructions: Arc<InstructionSet>,
        channel: &Arc<Channel>,
        received: Arc<ReceivedHooks>,
    ) -> Arc<Self> {
        let assembler = FrameAssembler::new(*instructions.layout());
        let device = Arc::new(Self {
            name: name.into(),
            instructions,
            session: InstructionSession::new(),
            channel: channel.clone(),
            assembler: Mutex::new(assembler),
            pending: Mutex::new(Vec::new()),
            next_pending: AtomicU64::new(0),
            fanout: RwLock::new(Vec::new()),
            rebound: RwLock::new(HashMap::new()),
            received,
            status: AtomicDeviceStatus::new(DeviceStatus::Unknown),
            status_hooks: StatusHooks::new(),
            last_received: Mutex::new(HashMap::new()),
        });
        channel.bind(&device);
        device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn instructions(&self) -> &Arc<InstructionSet> {
        &self.instructions
    }

    pub fn session(&self) -> &InstructionSession {
        &self.session
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.get()
    }

    /// 订阅 received 事件
    pub fn on_received<F>(&self, callback: F)
    where
        F: Fn(&ReceivedEvent) + Send + Sync + 'static,
    {
        self.received.subscribe(callback);
    }

    pub fn received_hooks(&self) -> &Arc<ReceivedHooks> {
        &self.received
    }

    /// 订阅状态变化
    pub fn on_status_changed<F>(&self, callback: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.status_hooks.subscribe(callback);
    }

    /// 健康检测结果（只在 Unknown/Online/Offline 之间切换）
    ///
    /// 返回是否发生了状态转换。
    pub fn update_status(&self, requested: DeviceStatus) -> bool {
        let change = self.status.update(requested);
        self.notify(change)
    }

    /// 禁用设备，执行请求直接失败，健康检测不再改变状态
    pub fn disable(&self) -> bool {
        let change = self.status.disable();
        self.notify(change)
    }

    /// 重新启用（回到 Unknown，等待下一次健康检测）
    pub fn enable(&self) -> bool {
        let change = self.status.enable();
        self.notify(change)
    }

    fn notify(&self, change: Option<(DeviceStatus, DeviceStatus)>) -> bool {
        let Some((old, new)) = change else {
            return false;
        };
        info!("Device {} status: {} -> {}", self.name, old, new);
        self.status_hooks.fire(&StatusChange {
            device: self.name.clone(),
            old,
            new,
        });
        true
    }

    /// 最近一次收到的非请求帧（按指令名）解析出的上下文
    pub fn last_received(&self, instruction: &str) -> Option<InstructionContext> {
        self.last_received.lock().get(instruction).cloned()
    }

    /// 清除动态指令
    pub fn clear_dynamic_instructions(&self) -> u64 {
        self.instructions.clear_dynamic_instructions()
    }

    /// 重连后重置会话（帧序号与未完成的重组缓存）
    pub fn reset_session(&self) {
        self.session.reset();
        self.assembler.lock().clear();
    }

    /// 注册接收转发目标
    ///
    /// 目标中与本设备同名的指令会重新绑定到本设备的定义，
    /// 以便目标能在这条共享链路上关联自己发出的请求。
    pub fn add_fanout(&self, target: &Arc<Device>) {
        if std::ptr::eq(self, Arc::as_ptr(target)) {
            return;
        }
        let mut rebound = 0usize;
        {
            let mut table = target.rebound.write();
            for name in target.instructions.names() {
                if let Some((instruction, _guard)) = self.instructions.find(&name) {
                    table.insert(name, instruction);
                    rebound += 1;
                }
            }
        }
        let mut fanout = self.fanout.write();
        fanout.retain(|d| d.strong_count() > 0);
        fanout.push(Arc::downgrade(target));
        debug!(
            "Device {} forwards to {} ({} instructions rebound)",
            self.name, target.name, rebound
        );
    }

    /// 当前接收转发目标
    pub fn fanout_targets(&self) -> SmallVec<[Arc<Device>; 4]> {
        self.fanout.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// 查找指令：重新绑定的优先，其次本设备指令集
    fn resolve(&self, name: &str) -> Option<(Arc<dyn Instruction>, ExecutionGuard)> {
        if let Some(instruction) = self.rebound.read().get(name) {
            return Some((instruction.clone(), ExecutionGuard::detached()));
        }
        self.instructions.find(name)
    }

    /// 找出匹配该帧的指令（先静态，再动态）
    pub fn match_instruction(&self, frame: &[u8]) -> Option<Arc<dyn Instruction>> {
        self.instructions
            .match_frame(&self.session, frame)
            .map(|(instruction, _guard)| instruction)
    }

    /// 执行一条指令：构建请求、发送、等待并解析应答
    ///
    /// 没有应答的指令发送成功即返回请求上下文。
    pub fn execute(
        &self,
        description: &InstructionDescription,
    ) -> Result<InstructionContext, DriverError> {
        if self.status() == DeviceStatus::Disabled {
            return Err(DriverError::Disabled(self.name.clone()));
        }
        let (instruction, _guard) = self
            .resolve(&description.name)
            .ok_or_else(|| DriverError::UnknownInstruction(description.name.clone()))?;
        if !self.channel.connected() {
            return Err(DriverError::NotConnected);
        }

        self.instructions.maybe_reclaim();
        let mut context = description.context.clone();
        let request = instruction.build(&self.session, &context)?;
        if !instruction.expects_reply() {
            self.channel.send(&request)?;
            return Ok(context);
        }

        let timeout = description
            .timeout
            .or_else(|| instruction.timeout())
            .unwrap_or_else(|| self.channel.receive_timeout());
        let (tx, rx) = bounded(1);
        let id = self.register_pending(instruction.clone(), tx);
        if let Err(e) = self.channel.send(&request) {
            self.cancel_pending(id);
            return Err(e.into());
        }
        let reply = self.wait_reply(&rx, timeout);
        self.cancel_pending(id);
        let reply = reply?;

        instruction.parse(&reply, &mut context)?;
        trace!("Device {}: {} completed", self.name, instruction.name());
        Ok(context)
    }

    /// 从链路读取一次并分发，返回读取的字节数
    pub fn receive(&self, timeout: Duration) -> Result<usize, DriverError> {
        let mut buffer = vec![0u8; self.channel.description().read_buffer_size()];
        let n = self.channel.receive(&mut buffer, Some(timeout))?;
        if n > 0 {
            self.channel.dispatch(&buffer[..n]);
        }
        Ok(n)
    }

    /// 入站字节（可能是不完整帧）
    pub fn on_bytes(&self, data: &[u8]) {
        let frames = {
            let mut assembler = self.assembler.lock();
            assembler.push(data);
            assembler.drain_frames()
        };
        for frame in frames {
            self.handle_frame(frame, true);
        }
        self.instructions.maybe_reclaim();
    }

    fn register_pending(&self, instruction: Arc<dyn Instruction>, reply: Sender<Bytes>) -> u64 {
        let id = self.next_pending.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push(PendingReply {
            id,
            instruction,
            reply,
        });
        id
    }

    fn cancel_pending(&self, id: u64) {
        self.pending.lock().retain(|p| p.id != id);
    }

    fn wait_reply(&self, rx: &Receiver<Bytes>, timeout: Duration) -> Result<Bytes, DriverError> {
        if self.channel.delivers_inbound() {
            return rx.recv_timeout(timeout).map_err(|_| DriverError::Timeout);
        }

        // 同步接收策略：本线程自己读
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(reply) = rx.try_recv() {
                return Ok(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout);
            }
            self.receive(deadline - now)?;
        }
    }

    fn handle_frame(&self, frame: Bytes, forward: bool) {
        if forward {
            // 同一 Channel 上的目标已由 Channel::dispatch 直接收到
            for target in self.fanout_targets() {
                if !Arc::ptr_eq(target.channel(), &self.channel) {
                    target.handle_frame(frame.clone(), false);
                }
            }
        }

        let waiter = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|p| p.instruction.matches(&self.session, &frame))
                .map(|index| pending.remove(index))
        };
        let (instruction, _guard) = match &waiter {
            Some(waiter) => (waiter.instruction.clone(), ExecutionGuard::detached()),
            None => match self.instructions.match_frame(&self.session, &frame) {
                Some(found) => found,
                None => {
                    trace!("Device {}: dropping unmatched frame ({} bytes)", self.name, frame.len());
                    return;
                },
            },
        };

        let payload = self.payload_of(&frame);
        let event = ReceivedEvent::new(self.name.as_str(), instruction.name(), frame.clone(), payload);
        self.received.fire(&event);
        if event.is_handled() {
            // 已被订阅者接管；等待者继续等待后续帧
            if let Some(waiter) = waiter {
                self.pending.lock().push(waiter);
            }
            return;
        }

        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.try_send(frame);
            },
            None => {
                let mut context = InstructionContext::new();
                match instruction.parse(&frame, &mut context) {
                    Ok(()) => {
                        self.last_received
                            .lock()
                            .insert(instruction.name().to_string(), context);
                    },
                    Err(e) => debug!("Device {}: {} parse failed: {}", self.name, instruction.name(), e),
                }
            },
        }
    }

    fn payload_of(&self, frame: &Bytes) -> Bytes {
        let layout = self.instructions.layout();
        match layout.view(frame) {
            Some(view) => {
                let start = layout.payload_offset();
                frame.slice(start..start + view.payload().len())
            },
            None => Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameInstruction;
    use crate::context::{KEY_PAYLOAD, KEY_REPLY};
    use fieldlink_protocol::FrameLayout;
    use fieldlink_transport::mock::MockInteractive;
    use fieldlink_transport::{ChannelDescription, StrategyKind};
    use std::sync::atomic::AtomicUsize;

    fn instruction_set() -> Arc<InstructionSet> {
        let layout = FrameLayout::default();
        Arc::new(InstructionSet::new(
            "meter",
            layout,
            vec![
                Arc::new(FrameInstruction::new("sample", layout, 0x01)),
                Arc::new(FrameInstruction::new("read", layout, 0x02)),
                Arc::new(FrameInstruction::new("notify", layout, 0x05).check_frame_id(false)),
                Arc::new(FrameInstruction::new("reset", layout, 0x09).expects_reply(false)),
            ],
        ))
    }

    fn setup(receiver: StrategyKind) -> (Arc<MockInteractive>, Arc<Channel>, Arc<Device>) {
        let mut description = ChannelDescription::tcp_client("mock", 1);
        description.receiver = receiver;
        description.receive_timeout_ms = 300;
        let mock = Arc::new(MockInteractive::new(description));
        let channel = Channel::new(mock.clone());
        let device = Device::new("meter-1", instruction_set(), &channel);
        assert!(channel.open());
        (mock, channel, device)
    }

    fn read_request() -> InstructionDescription {
        InstructionDescription::new("read")
            .with_context(InstructionContext::new().with(KEY_PAYLOAD, vec![0x10, 0x20]))
    }

    #[test]
    fn test_execute_inline_receive() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        mock.set_responder(|request| Some(request.to_vec()));
        let context = device.execute(&read_request()).unwrap();
        assert_eq!(context.get_bytes(KEY_REPLY), Some(&[0x10, 0x20][..]));
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_execute_with_receive_pump() {
        let (mock, channel, device) = setup(StrategyKind::Async);
        assert!(channel.pump_active());
        mock.set_responder(|request| Some(request.to_vec()));
        let context = device.execute(&read_request()).unwrap();
        assert_eq!(context.get_bytes(KEY_REPLY), Some(&[0x10, 0x20][..]));
        channel.close();
    }

    #[test]
    fn test_reply_split_across_reads_is_reassembled() {
        let mut description = ChannelDescription::tcp_client("mock", 1);
        description.receive_buffer_size = 4;
        let mock = Arc::new(MockInteractive::new(description));
        let channel = Channel::new(mock.clone());
        let device = Device::new("meter-1", instruction_set(), &channel);
        assert!(channel.open());

        // 每次最多读 4 字节，应答需要多次读取才能拼成完整帧
        mock.set_responder(|request| Some(request.to_vec()));
        let context = device.execute(&read_request()).unwrap();
        assert_eq!(context.get_bytes(KEY_REPLY), Some(&[0x10, 0x20][..]));
    }

    #[test]
    fn test_execute_times_out_without_reply() {
        let (_mock, _channel, device) = setup(StrategyKind::Sync);
        let start = Instant::now();
        let result = device.execute(&read_request().with_timeout(Duration::from_millis(50)));
        assert!(matches!(result, Err(DriverError::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(device.pending.lock().is_empty());
    }

    #[test]
    fn test_execute_without_reply_returns_immediately() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        let context = device.execute(&InstructionDescription::new("reset")).unwrap();
        assert!(!context.has_exception());
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_execute_errors() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        assert!(matches!(
            device.execute(&InstructionDescription::new("missing")),
            Err(DriverError::UnknownInstruction(_))
        ));

        device.disable();
        assert!(matches!(
            device.execute(&read_request()),
            Err(DriverError::Disabled(_))
        ));
        device.enable();

        mock.set_connected(false);
        assert!(matches!(
            device.execute(&read_request()),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn test_device_state_becomes_exception() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        let layout = FrameLayout::default();
        mock.set_responder(move |request| Some(layout.encode(request[1], 0x33, 0x02, 0, &[]).unwrap()));
        let context = device.execute(&read_request()).unwrap();
        assert!(context.has_exception());
        assert_eq!(context.exception().map(|e| e.code), Some(0x33));
    }

    #[test]
    fn test_received_event_and_corrupted_frame() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        let events = Arc::new(Mutex::new(Vec::<(String, Vec<u8>)>::new()));
        let sink = events.clone();
        device.on_received(move |event| {
            sink.lock()
                .push((event.instruction().to_string(), event.payload().to_vec()));
        });

        let layout = FrameLayout::default();
        let good = layout.encode(3, 0, 0x05, 0, &[1, 2, 3]).unwrap();
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x5A;

        mock.inject(&bad);
        device.receive(Duration::from_millis(50)).unwrap();
        assert!(events.lock().is_empty());
        assert!(device.last_received("notify").is_none());

        mock.inject(&good);
        device.receive(Duration::from_millis(50)).unwrap();
        assert_eq!(*events.lock(), vec![("notify".to_string(), vec![1, 2, 3])]);
        let context = device.last_received("notify").unwrap();
        assert_eq!(context.get_bytes(KEY_REPLY), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_handled_event_skips_default_execution() {
        let (mock, _channel, device) = setup(StrategyKind::Sync);
        device.on_received(|event| event.set_handled());
        let frame = FrameLayout::default().encode(0, 0, 0x05, 0, &[9]).unwrap();
        mock.inject(&frame);
        device.receive(Duration::from_millis(50)).unwrap();
        assert!(device.last_received("notify").is_none());

        mock.set_responder(|request| Some(request.to_vec()));
        let result = device.execute(&read_request().with_timeout(Duration::from_millis(50)));
        assert!(matches!(result, Err(DriverError::Timeout)));
    }

    #[test]
    fn test_fanout_target_receives_shared_frames() {
        let (mock, _channel, primary) = setup(StrategyKind::Sync);
        let (_other, _other_channel, secondary) = setup(StrategyKind::Sync);
        primary.add_fanout(&secondary);
        assert_eq!(primary.fanout_targets().len(), 1);
        assert_eq!(secondary.rebound.read().len(), 4);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        secondary.on_received(move |event| {
            assert_eq!(event.device(), "meter-1");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let frame = FrameLayout::default().encode(0, 0, 0x05, 0, &[4]).unwrap();
        mock.inject(&frame);
        primary.receive(Duration::from_millis(50)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(secondary.last_received("notify").is_some());
    }

    #[test]
    fn test_fanout_on_shared_channel_delivers_once() {
        let (mock, channel, primary) = setup(StrategyKind::Sync);
        let secondary = Device::new("meter-2", instruction_set(), &channel);
        secondary.add_fanout(&primary);

        let primary_seen = Arc::new(AtomicUsize::new(0));
        let counter = primary_seen.clone();
        primary.on_received(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let secondary_seen = Arc::new(AtomicUsize::new(0));
        let counter = secondary_seen.clone();
        secondary.on_received(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let frame = FrameLayout::default().encode(0, 0, 0x05, 0, &[7]).unwrap();
        mock.inject(&frame);
        primary.receive(Duration::from_millis(50)).unwrap();
        assert_eq!(primary_seen.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_without_pool_reclaims_overlays() {
        let mut description = ChannelDescription::tcp_client("mock", 1);
        description.receive_timeout_ms = 300;
        let mock = Arc::new(MockInteractive::new(description));
        let channel = Channel::new(mock.clone());
        let layout = FrameLayout::default();
        let set = InstructionSet::new(
            "meter",
            layout,
            vec![Arc::new(FrameInstruction::new("notify", layout, 0x05).check_frame_id(false))
                as Arc<dyn Instruction>],
        )
        .with_reclaim_interval(Duration::from_millis(200));
        let device = Device::new("peer", Arc::new(set), &channel);
        assert!(channel.open());

        for command in [0x10, 0x11, 0x12] {
            device
                .instructions()
                .add_dynamic(vec![Arc::new(FrameInstruction::new("upload", layout, command))
                    as Arc<dyn Instruction>]);
        }
        device.clear_dynamic_instructions();
        assert!(device.instructions().retired_count() > 0);

        std::thread::sleep(Duration::from_millis(300));
        mock.inject(&layout.encode(0, 0, 0x05, 0, &[1]).unwrap());
        device.receive(Duration::from_millis(50)).unwrap();
        assert_eq!(device.instructions().retired_count(), 0);
    }

    #[test]
    fn test_status_transitions_notify_once() {
        let (_mock, _channel, device) = setup(StrategyKind::Sync);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        device.on_status_changed(move |change| sink.lock().push((change.old, change.new)));

        assert!(device.update_status(DeviceStatus::Online));
        assert!(!device.update_status(DeviceStatus::Online));
        assert!(device.disable());
        assert!(!device.update_status(DeviceStatus::Offline));
        assert!(device.enable());
        assert_eq!(
            *changes.lock(),
            vec![
                (DeviceStatus::Unknown, DeviceStatus::Online),
                (DeviceStatus::Online, DeviceStatus::Disabled),
                (DeviceStatus::Disabled, DeviceStatus::Unknown),
            ]
        );
    }
}
