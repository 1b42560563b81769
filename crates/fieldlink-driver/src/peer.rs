//! 服务端对端设备
//!
//! 服务端链路每 accept 一个对端，就以模板设备为蓝本创建一个对端设备：
//! 指令集从模板复制（独立的动态指令、帧序号与超时），
//! received 订阅与模板共享，应用只需订阅一次。

use crate::channel::Channel;
use crate::device::Device;
use crate::events::ReceivedHooks;
use crate::instruction_set::InstructionSet;
use crate::status::DeviceStatus;
use fieldlink_transport::{Endpoint, Interactive, PeerHandler, PeerHandlerFactory};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type PeerTable = Arc<RwLock<HashMap<Endpoint, Arc<Device>>>>;

/// 对端设备工厂
pub struct PeerDeviceFactory {
    template: String,
    instructions: Arc<InstructionSet>,
    received: Arc<ReceivedHooks>,
    peers: PeerTable,
}

impl PeerDeviceFactory {
    /// # 参数
    /// - `template`: 模板设备名
    /// - `instructions`: 模板指令集
    /// - `received`: 模板设备的 received 订阅
    pub fn new(
        template: impl Into<String>,
        instructions: Arc<InstructionSet>,
        received: Arc<ReceivedHooks>,
    ) -> Self {
        Self {
            template: template.into(),
            instructions,
            received,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// 按对端地址取设备
    pub fn peer(&self, endpoint: &Endpoint) -> Option<Arc<Device>> {
        self.peers.read().get(endpoint).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Device>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl PeerHandlerFactory for PeerDeviceFactory {
    fn create(&self, peer: &Endpoint, link: Arc<dyn Interactive>) -> Arc<dyn PeerHandler> {
        let channel = Channel::new(link);
        let device = Device::with_received_hooks(
            format!("{}@{}", self.template, peer),
            Arc::new(self.instructions.fork()),
            &channel,
            self.received.clone(),
        );
        device.update_status(DeviceStatus::Online);
        debug!("Peer device {} created", device.name());
        self.peers.write().insert(peer.clone(), device.clone());

        Arc::new(PeerLink {
            endpoint: peer.clone(),
            channel,
            device,
            peers: self.peers.clone(),
        })
    }
}

/// 对端链路处理器：入站字节交给对端设备
struct PeerLink {
    endpoint: Endpoint,
    channel: Arc<Channel>,
    device: Arc<Device>,
    peers: PeerTable,
}

impl PeerHandler for PeerLink {
    fn on_data(&self, data: &[u8]) {
        self.channel.dispatch(data);
    }

    fn on_closed(&self) {
        self.device.update_status(DeviceStatus::Offline);
        let mut peers = self.peers.write();
        // 同一地址可能已被新连接复用
        if peers
            .get(&self.endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, &self.device))
        {
            peers.remove(&self.endpoint);
        }
        debug!("Peer device {} removed", self.device.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameInstruction;
    use fieldlink_protocol::FrameLayout;
    use fieldlink_transport::ChannelDescription;
    use fieldlink_transport::mock::MockInteractive;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn factory() -> PeerDeviceFactory {
        let layout = FrameLayout::default();
        let set = Arc::new(InstructionSet::new(
            "meter",
            layout,
            vec![Arc::new(
                FrameInstruction::new("report", layout, 0x01).check_frame_id(false),
            )],
        ));
        PeerDeviceFactory::new("gateway", set, Arc::new(ReceivedHooks::new()))
    }

    fn link() -> Arc<MockInteractive> {
        let mock = Arc::new(MockInteractive::new(ChannelDescription::tcp_client("peer", 1)));
        mock.set_push(true);
        mock.open();
        mock
    }

    #[test]
    fn test_peer_lifecycle() {
        let factory = factory();
        let endpoint = Endpoint::new("10.0.0.2", 40001);
        let handler = factory.create(&endpoint, link());

        let device = factory.peer(&endpoint).unwrap();
        assert_eq!(device.name(), "gateway@10.0.0.2:40001");
        assert_eq!(device.status(), DeviceStatus::Online);
        assert_eq!(factory.len(), 1);

        handler.on_closed();
        assert_eq!(device.status(), DeviceStatus::Offline);
        assert!(factory.is_empty());
    }

    #[test]
    fn test_shared_received_hooks() {
        let factory = factory();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        factory.received.subscribe(move |event| {
            assert_eq!(event.payload().as_ref(), b"hi");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = factory.create(&Endpoint::new("10.0.0.2", 1), link());
        let b = factory.create(&Endpoint::new("10.0.0.3", 1), link());
        let frame = FrameLayout::default().encode(0, 0, 0x01, 0, b"hi").unwrap();
        a.on_data(&frame);
        b.on_data(&frame[..3]);
        b.on_data(&frame[3..]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_peer_sets_are_independent() {
        let factory = factory();
        factory.create(&Endpoint::new("10.0.0.2", 1), link());
        factory.create(&Endpoint::new("10.0.0.3", 1), link());
        let peers = factory.peers();
        assert!(!Arc::ptr_eq(peers[0].instructions(), peers[1].instructions()));
        peers[0].session().next_frame_id();
        assert_eq!(peers[1].session().last_frame_id(), None);
    }
}
