//! 驱动管理器
//!
//! 持有全部链路、设备与指令池，负责整个设备群的生命周期：
//!
//! - `open`: 按静态描述创建链路/设备/指令池，打开链路，启动指令池
//! - `close`: 先停指令池，再关链路，最后清空集合
//! - `reset`: 停指令池，强制重连所有可重连链路，再启动指令池（网络切换后使用）
//! - `pause`/`resume`: 只切换指令池，不触碰链路
//!
//! 多个设备可共享同一条链路（按 [`ChannelDescription::key`] 去重）。

use crate::channel::Channel;
use crate::config::{DeviceDescription, FRAME_FACTORY, FleetDescription};
use crate::context::InstructionContext;
use crate::device::Device;
use crate::error::{ConfigError, DriverError};
use crate::events::{ReceivedHooks, StatusHooks};
use crate::factory::{FrameSetFactory, InstructionSetFactory};
use crate::instruction::InstructionDescription;
use crate::peer::PeerDeviceFactory;
use crate::pool::{InstructionPool, Priority, Ticket};
use crate::status::StatusChange;
use fieldlink_transport::{
    ChannelDescription, Endpoint, Interactive, PeerHandlerFactory, TransportError,
    build_interactive,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// 传输构造函数（测试中可替换为 mock）
pub type TransportBuilder = Arc<
    dyn Fn(
            &ChannelDescription,
            Option<Arc<dyn PeerHandlerFactory>>,
        ) -> Result<Arc<dyn Interactive>, TransportError>
        + Send
        + Sync,
>;

/// 运行期集合
#[derive(Default)]
struct Fleet {
    channels: HashMap<String, Arc<Channel>>,
    /// 按描述顺序
    devices: Vec<Arc<Device>>,
    pools: HashMap<String, Arc<InstructionPool>>,
    peers: HashMap<String, Arc<PeerDeviceFactory>>,
}

impl Fleet {
    fn pools(&self) -> Vec<Arc<InstructionPool>> {
        self.devices
            .iter()
            .filter_map(|device| self.pools.get(device.name()).cloned())
            .collect()
    }
}

/// DriverManager Builder（链式构造）
///
/// # Example
///
/// ```
/// use fieldlink_driver::{DriverManagerBuilder, FleetDescription};
///
/// let manager = DriverManagerBuilder::new(FleetDescription::default()).build();
/// assert!(manager.open().is_ok());
/// assert!(manager.devices().is_empty());
/// ```
pub struct DriverManagerBuilder {
    fleet: FleetDescription,
    transport: Option<TransportBuilder>,
    factories: HashMap<String, Arc<dyn InstructionSetFactory>>,
}

impl DriverManagerBuilder {
    pub fn new(fleet: FleetDescription) -> Self {
        Self {
            fleet,
            transport: None,
            factories: HashMap::new(),
        }
    }

    /// 替换传输构造函数（默认 [`build_interactive`]）
    pub fn transport<F>(mut self, builder: F) -> Self
    where
        F: Fn(
                &ChannelDescription,
                Option<Arc<dyn PeerHandlerFactory>>,
            ) -> Result<Arc<dyn Interactive>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        let builder: TransportBuilder = Arc::new(builder);
        self.transport = Some(builder);
        self
    }

    /// 注册指令集工厂
    pub fn factory(mut self, name: impl Into<String>, factory: impl InstructionSetFactory + 'static) -> Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn build(self) -> Arc<DriverManager> {
        let mut factories = self.factories;
        factories
            .entry(FRAME_FACTORY.to_string())
            .or_insert_with(|| Arc::new(FrameSetFactory) as Arc<dyn InstructionSetFactory>);
        Arc::new(DriverManager {
            fleet: self.fleet,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(build_interactive) as TransportBuilder),
            factories: RwLock::new(factories),
            lifecycle: Mutex::new(()),
            opened: AtomicBool::new(false),
            state: RwLock::new(Fleet::default()),
            status_hooks: Arc::new(StatusHooks::new()),
        })
    }
}

/// 驱动管理器
pub struct DriverManager {
    fleet: FleetDescription,
    transport: TransportBuilder,
    factories: RwLock<HashMap<String, Arc<dyn InstructionSetFactory>>>,
    /// 串行化 open/close/reset
    lifecycle: Mutex<()>,
    opened: AtomicBool,
    state: RwLock<Fleet>,
    status_hooks: Arc<StatusHooks>,
}

impl DriverManager {
    /// 使用默认传输与内置工厂
    pub fn new(fleet: FleetDescription) -> Arc<Self> {
        DriverManagerBuilder::new(fleet).build()
    }

    pub fn fleet(&self) -> &FleetDescription {
        &self.fleet
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// 注册指令集工厂（下一次 `open` 生效）
    pub fn register_factory(&self, name: impl Into<String>, factory: Arc<dyn InstructionSetFactory>) {
        self.factories.write().insert(name.into(), factory);
    }

    /// 订阅所有设备的状态变化
    pub fn on_status_changed<F>(&self, callback: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.status_hooks.subscribe(callback);
    }

    /// 打开设备群
    ///
    /// 配置错误与服务端绑定失败返回 `Err`，已创建的部分全部回收；
    /// 客户端链路打开失败只记录日志，由健康检测负责重连。
    pub fn open(&self) -> Result<(), DriverError> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_open() {
            return Ok(());
        }
        self.fleet.validate()?;

        let fleet = match self.build_fleet() {
            Ok(fleet) => fleet,
            Err(e) => {
                error!("Failed to build fleet: {}", e);
                return Err(e);
            },
        };

        for (key, channel) in &fleet.channels {
            if channel.open() {
                continue;
            }
            if channel.description().kind.is_server() {
                error!("Failed to bind server channel {}", key);
                for channel in fleet.channels.values() {
                    channel.close();
                }
                return Err(DriverError::BindFailed(key.clone()));
            }
            warn!("Channel {} not connected yet", key);
        }

        for pool in fleet.pools() {
            pool.start();
        }
        info!(
            "Driver manager opened: {} devices on {} channels",
            fleet.devices.len(),
            fleet.channels.len()
        );
        *self.state.write() = fleet;
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn build_fleet(&self) -> Result<Fleet, DriverError> {
        let mut fleet = Fleet::default();
        for description in &self.fleet.devices {
            self.build_device(&mut fleet, description)?;
        }

        for description in &self.fleet.devices {
            let Some(source) = find_device(&fleet.devices, &description.name) else {
                continue;
            };
            for target in &description.forward_to {
                match find_device(&fleet.devices, target) {
                    Some(target) => source.add_fanout(&target),
                    None => {
                        return Err(ConfigError::UnknownForwardTarget {
                            device: description.name.clone(),
                            target: target.clone(),
                        }
                        .into());
                    },
                }
            }
        }
        Ok(fleet)
    }

    fn build_device(&self, fleet: &mut Fleet, description: &DeviceDescription) -> Result<(), DriverError> {
        let factory = self
            .factories
            .read()
            .get(&description.instruction_set.factory)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownFactory(description.instruction_set.factory.clone()))?;
        let instructions = Arc::new(factory.build(&description.name, &description.instruction_set)?);
        let received = Arc::new(ReceivedHooks::new());

        let key = description.channel.key();
        let channel = match fleet.channels.get(&key) {
            Some(channel) => channel.clone(),
            None => {
                let peers = description.channel.kind.is_server().then(|| {
                    Arc::new(PeerDeviceFactory::new(
                        description.name.as_str(),
                        instructions.clone(),
                        received.clone(),
                    ))
                });
                let interactive = (self.transport)(
                    &description.channel,
                    peers.clone().map(|p| p as Arc<dyn PeerHandlerFactory>),
                )
                .map_err(|source| ConfigError::Channel {
                    device: description.name.clone(),
                    source,
                })?;
                if let Some(peers) = peers {
                    fleet.peers.insert(description.name.clone(), peers);
                }
                let channel = Channel::new(interactive);
                fleet.channels.insert(key, channel.clone());
                channel
            },
        };

        let device = Device::with_received_hooks(description.name.as_str(), instructions, &channel, received);
        let hooks = self.status_hooks.clone();
        device.on_status_changed(move |change| hooks.fire(change));
        if !description.enabled {
            device.disable();
        }

        let pool = InstructionPool::new(device.clone(), description.pool.clone());
        fleet.pools.insert(description.name.clone(), pool);
        fleet.devices.push(device);
        Ok(())
    }

    /// 后台线程中打开
    pub fn open_async(self: &Arc<Self>) -> Result<JoinHandle<Result<(), DriverError>>, DriverError> {
        let manager = self.clone();
        std::thread::Builder::new()
            .name("fieldlink-open".to_string())
            .spawn(move || manager.open())
            .map_err(|e| DriverError::Worker(e.to_string()))
    }

    /// 关闭设备群：先停指令池，再关链路
    pub fn close(&self) {
        let _lifecycle = self.lifecycle.lock();
        if !self.opened.swap(false, Ordering::AcqRel) {
            return;
        }
        let fleet = std::mem::take(&mut *self.state.write());
        for pool in fleet.pools() {
            pool.stop();
        }
        for channel in fleet.channels.values() {
            channel.close();
        }
        info!("Driver manager closed");
    }

    /// 强制重连所有可重连链路
    pub fn reset(&self) {
        let _lifecycle = self.lifecycle.lock();
        if !self.is_open() {
            return;
        }
        let (pools, channels) = {
            let state = self.state.read();
            (state.pools(), state.channels.values().cloned().collect::<Vec<_>>())
        };
        for pool in &pools {
            pool.stop();
        }
        for channel in channels.iter().filter(|c| c.reopenable()) {
            if !channel.reopen() {
                warn!("Channel {} failed to reopen", channel.key());
            }
        }
        for pool in &pools {
            pool.start();
        }
        info!("Driver manager reset");
    }

    /// 后台线程中重置
    pub fn reset_async(self: &Arc<Self>) -> Result<JoinHandle<()>, DriverError> {
        let manager = self.clone();
        std::thread::Builder::new()
            .name("fieldlink-reset".to_string())
            .spawn(move || manager.reset())
            .map_err(|e| DriverError::Worker(e.to_string()))
    }

    pub fn pause(&self) {
        for pool in self.state.read().pools() {
            pool.pause();
        }
    }

    pub fn resume(&self) {
        for pool in self.state.read().pools() {
            pool.resume();
        }
    }

    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        find_device(&self.state.read().devices, name)
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.state.read().devices.clone()
    }

    pub fn pool(&self, device: &str) -> Option<Arc<InstructionPool>> {
        self.state.read().pools.get(device).cloned()
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.state.read().channels.get(key).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.state.read().channels.values().cloned().collect()
    }

    /// 服务端设备的对端设备
    pub fn peer_device(&self, device: &str, endpoint: &Endpoint) -> Option<Arc<Device>> {
        self.state.read().peers.get(device)?.peer(endpoint)
    }

    /// 服务端设备的对端设备工厂
    pub fn peer_factory(&self, device: &str) -> Option<Arc<PeerDeviceFactory>> {
        self.state.read().peers.get(device).cloned()
    }

    /// 同步执行指令（经由设备的指令池）
    ///
    /// 超时或被拒绝时返回 `Ok(None)`。
    pub fn execute(
        &self,
        device: &str,
        description: InstructionDescription,
    ) -> Result<Option<InstructionContext>, DriverError> {
        let pool = self
            .pool(device)
            .ok_or_else(|| DriverError::UnknownDevice(device.to_string()))?;
        Ok(pool.execute_instruction_sync(description, Priority::Normal))
    }

    /// 异步提交指令
    pub fn submit(
        &self,
        device: &str,
        description: InstructionDescription,
        priority: Priority,
    ) -> Result<Option<Ticket>, DriverError> {
        let pool = self
            .pool(device)
            .ok_or_else(|| DriverError::UnknownDevice(device.to_string()))?;
        Ok(pool.add_instruction(description, priority))
    }
}

impl Drop for DriverManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_device(devices: &[Arc<Device>], name: &str) -> Option<Arc<Device>> {
    devices.iter().find(|device| device.name() == name).cloned()
}
