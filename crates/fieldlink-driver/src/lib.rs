//! # Fieldlink Driver
//!
//! 设备/指令模型与调度引擎
//!
//! ## 模块
//!
//! - `context`: 指令上下文（键值 + 异常槽）
//! - `instruction` / `frame_instruction`: 指令接口与帧协议指令
//! - `instruction_set`: 静态指令 + 按代回收的动态指令
//! - `channel`: 链路包装（接收泵、重连、设备绑定）
//! - `device`: 帧匹配、应答关联、接收转发、received/状态事件
//! - `pool`: 指令池（入队、定时排空、同步执行）
//! - `sampler`: 连接健康状态机
//! - `peer`: 服务端对端设备
//! - `manager`: 整个设备群的生命周期
//! - `config`: TOML 设备群描述
//!
//! ## 线程模型
//!
//! - 每个指令池一个定时器线程（`fieldlink-pool-<device>`）
//! - 异步接收策略的点对点链路一个接收泵线程（`fieldlink-pump-<channel>`）
//! - 服务端链路的入站数据由传输层的事件循环线程直接交付
//!
//! 传输层错误不会以 panic 或错误的形式逃出后台线程，
//! 只记录日志并汇入设备状态（Unknown / Online / Offline）。

pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod factory;
pub mod frame_instruction;
pub mod instruction;
pub mod instruction_set;
pub mod manager;
pub mod metrics;
pub mod peer;
pub mod pool;
pub mod sampler;
pub mod status;

pub use channel::Channel;
pub use config::{
    DeviceDescription, FleetDescription, InstructionEntry, InstructionSetDescription,
    LayoutDescription, PoolDescription, SamplerDescription, FRAME_FACTORY,
};
pub use context::{
    InstructionContext, InstructionException, Value, KEY_FRAME_ID, KEY_PAYLOAD, KEY_REPLY,
    KEY_STATE,
};
pub use device::Device;
pub use error::{ConfigError, DriverError};
pub use events::{ChannelHooks, Hooks, ReceivedEvent, ReceivedHooks, StatusHooks};
pub use factory::{FrameSetFactory, InstructionSetFactory};
pub use frame_instruction::{FrameInstruction, PayloadCodec, RawPayload};
pub use instruction::{Instruction, InstructionDescription, InstructionSession};
pub use instruction_set::{ExecutionGuard, InstructionSet, RECLAIM_INTERVAL};
pub use manager::{DriverManager, DriverManagerBuilder, TransportBuilder};
pub use metrics::{PoolMetrics, PoolMetricsSnapshot};
pub use peer::PeerDeviceFactory;
pub use pool::{InstructionPool, PoolHooks, Priority, Ticket};
pub use sampler::HealthMonitor;
pub use status::{DeviceStatus, StatusChange};

// 下层 crate 再导出，应用只需依赖本 crate
pub use fieldlink_protocol as protocol;
pub use fieldlink_transport as transport;
