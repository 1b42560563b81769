//! DriverManager 生命周期测试（mock 传输）

use fieldlink_driver::transport::mock::MockInteractive;
use fieldlink_driver::transport::{ChannelDescription, Interactive, TransportError};
use fieldlink_driver::{
    ConfigError, DeviceStatus, DriverError, DriverManager, DriverManagerBuilder, FleetDescription,
    InstructionContext, InstructionEntry, InstructionDescription, InstructionSet, InstructionSetDescription,
    KEY_PAYLOAD, KEY_REPLY, Priority, StatusChange,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const FLEET: &str = r#"
[[devices]]
name = "meter-1"

[devices.channel]
kind = "tcp_client"
address = "10.0.0.12"
port = 9000
receive_timeout_ms = 200

[devices.instruction_set]
instructions = [
    { name = "sample", command = 0x01 },
    { name = "read", command = 0x02 },
]

[devices.pool]
tick_interval_ms = 5

[[devices]]
name = "meter-2"
forward_to = ["meter-1"]

[devices.channel]
kind = "tcp_client"
address = "10.0.0.12"
port = 9000
receive_timeout_ms = 200

[devices.instruction_set]
instructions = [{ name = "read", command = 0x02 }]

[[devices]]
name = "valve"
enabled = false

[devices.channel]
kind = "udp"
address = "10.0.0.40"
port = 7000
reopen = false

[devices.instruction_set]
instructions = [{ name = "open", command = 0x10, expects_reply = false }]
"#;

type Mocks = Arc<Mutex<HashMap<String, Arc<MockInteractive>>>>;

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// 每个链路一个回显 mock；服务端 mock 绑定失败
fn mock_builder(fleet: FleetDescription) -> (DriverManagerBuilder, Mocks) {
    let mocks: Mocks = Arc::new(Mutex::new(HashMap::new()));
    let registry = mocks.clone();
    let builder = DriverManagerBuilder::new(fleet).transport(move |description: &ChannelDescription, _peers| {
        let mock = Arc::new(MockInteractive::new(description.clone()));
        mock.set_responder(|request| Some(request.to_vec()));
        mock.set_open_result(!description.kind.is_server());
        registry.lock().insert(description.key(), mock.clone());
        Ok(mock as Arc<dyn Interactive>)
    });
    (builder, mocks)
}

fn open_fleet() -> (Arc<DriverManager>, Mocks) {
    let fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    let (builder, mocks) = mock_builder(fleet);
    let manager = builder.build();
    manager.open().unwrap();
    (manager, mocks)
}

fn read(tag: u8) -> InstructionDescription {
    InstructionDescription::new("read")
        .with_context(InstructionContext::new().with(KEY_PAYLOAD, vec![tag]))
}

#[test]
fn test_open_shares_channels_by_key() {
    let (manager, mocks) = open_fleet();
    assert!(manager.is_open());
    assert_eq!(manager.devices().len(), 3);
    assert_eq!(manager.channels().len(), 2);
    assert_eq!(mocks.lock().len(), 2);

    let meter1 = manager.device("meter-1").unwrap();
    let meter2 = manager.device("meter-2").unwrap();
    assert!(Arc::ptr_eq(meter1.channel(), meter2.channel()));
    assert_eq!(meter1.channel().devices().len(), 2);
    assert_eq!(meter2.fanout_targets().len(), 1);

    for device in ["meter-1", "meter-2", "valve"] {
        assert!(manager.pool(device).unwrap().is_running());
    }
}

#[test]
fn test_execute_through_pool() {
    let (manager, _mocks) = open_fleet();
    let context = manager.execute("meter-1", read(7)).unwrap().unwrap();
    assert_eq!(context.get_bytes(KEY_REPLY), Some(&[7][..]));

    let ticket = manager.submit("meter-2", read(8), Priority::High).unwrap();
    assert!(ticket.is_some());
    let pool = manager.pool("meter-2").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        pool.metrics().snapshot().executed == 1
    }));

    assert!(matches!(
        manager.execute("missing", read(0)),
        Err(DriverError::UnknownDevice(_))
    ));
}

#[test]
fn test_disabled_device() {
    let (manager, mocks) = open_fleet();
    let valve = manager.device("valve").unwrap();
    assert_eq!(valve.status(), DeviceStatus::Disabled);
    assert!(
        manager
            .execute("valve", InstructionDescription::new("open"))
            .unwrap()
            .is_none()
    );
    let udp = mocks.lock().get("udp://10.0.0.40:7000").cloned().unwrap();
    assert!(udp.sent().is_empty());

    assert!(valve.enable());
    assert!(
        manager
            .execute("valve", InstructionDescription::new("open"))
            .unwrap()
            .is_some()
    );
    assert_eq!(udp.sent().len(), 1);
}

#[test]
fn test_close_order_and_idempotence() {
    let (manager, mocks) = open_fleet();
    let pool = manager.pool("meter-1").unwrap();
    manager.close();
    assert!(!manager.is_open());
    assert!(!pool.is_running());
    assert!(manager.devices().is_empty());
    assert!(mocks.lock().values().all(|mock| !mock.connected()));

    manager.close();
    manager.open().unwrap();
    assert_eq!(manager.devices().len(), 3);
}

#[test]
fn test_reset_reopens_only_reopenable_channels() {
    let (manager, mocks) = open_fleet();
    let tcp = mocks.lock().get("tcp_client://10.0.0.12:9000").cloned().unwrap();
    let udp = mocks.lock().get("udp://10.0.0.40:7000").cloned().unwrap();
    assert_eq!(tcp.open_count(), 1);
    assert_eq!(udp.open_count(), 1);

    manager.reset();
    assert_eq!(tcp.open_count(), 2);
    assert_eq!(udp.open_count(), 1);
    assert!(manager.pool("meter-1").unwrap().is_running());

    manager.reset_async().unwrap().join().unwrap();
    assert_eq!(tcp.open_count(), 3);
}

#[test]
fn test_pause_and_resume() {
    let (manager, _mocks) = open_fleet();
    manager.pause();
    let pool = manager.pool("meter-1").unwrap();
    assert!(pool.is_paused());
    manager.submit("meter-1", read(1), Priority::Normal).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(pool.pending_len(), 1);

    manager.resume();
    assert!(wait_until(Duration::from_secs(3), || pool.pending_len() == 0));
}

#[test]
fn test_server_bind_failure_fails_open() {
    let mut fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    fleet.devices[0].channel = ChannelDescription::tcp_server("0.0.0.0", 9500);
    let (builder, _mocks) = mock_builder(fleet);
    let manager = builder.build();
    assert!(matches!(manager.open(), Err(DriverError::BindFailed(_))));
    assert!(!manager.is_open());
    assert!(manager.devices().is_empty());
}

#[test]
fn test_unknown_factory_and_custom_factory() {
    let mut fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    fleet.devices[2].instruction_set = InstructionSetDescription {
        factory: "valve-v2".to_string(),
        ..Default::default()
    };

    let (builder, _mocks) = mock_builder(fleet.clone());
    let manager = builder.build();
    assert!(matches!(
        manager.open(),
        Err(DriverError::Config(ConfigError::UnknownFactory(_)))
    ));

    let (builder, _mocks) = mock_builder(fleet);
    let manager = builder
        .factory("valve-v2", |device: &str, description: &InstructionSetDescription| {
            let layout = description.layout.to_layout()?;
            Ok::<_, DriverError>(InstructionSet::new(device, layout, Vec::new()))
        })
        .build();
    manager.open().unwrap();
    assert!(manager.device("valve").unwrap().instructions().names().is_empty());
}

#[test]
fn test_transport_error_is_config_error() {
    let fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    let manager = DriverManagerBuilder::new(fleet)
        .transport(|_: &ChannelDescription, _| Err(TransportError::Config("no route".to_string())))
        .build();
    assert!(matches!(
        manager.open(),
        Err(DriverError::Config(ConfigError::Channel { .. }))
    ));
}

#[test]
fn test_status_changes_reach_manager() {
    let mut fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    fleet.devices[0].pool.sampler = Some(fieldlink_driver::SamplerDescription {
        sample_interval_ms: 10,
        ..Default::default()
    });
    let (builder, _mocks) = mock_builder(fleet);
    let manager = builder.build();
    let changes = Arc::new(Mutex::new(Vec::<StatusChange>::new()));
    let sink = changes.clone();
    manager.on_status_changed(move |change| sink.lock().push(change.clone()));
    manager.open().unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        changes
            .lock()
            .iter()
            .any(|c| c.device == "meter-1" && c.new == DeviceStatus::Online)
    }));
    // valve 在打开时被禁用
    assert!(
        changes
            .lock()
            .iter()
            .any(|c| c.device == "valve" && c.new == DeviceStatus::Disabled)
    );
}

#[test]
fn test_open_async() {
    let fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    let (builder, _mocks) = mock_builder(fleet);
    let manager = builder.build();
    manager.open_async().unwrap().join().unwrap().unwrap();
    assert!(manager.is_open());
}

#[test]
fn test_forward_on_shared_channel_fires_received_once() {
    let mut fleet = FleetDescription::from_toml_str(FLEET).unwrap();
    for device in &mut fleet.devices[..2] {
        device.instruction_set.instructions.push(InstructionEntry {
            check_frame_id: false,
            ..InstructionEntry::new("notify", 0x05)
        });
    }
    let (builder, mocks) = mock_builder(fleet);
    let manager = builder.build();
    manager.open().unwrap();

    let meter1 = manager.device("meter-1").unwrap();
    let meter2 = manager.device("meter-2").unwrap();
    let counts: Vec<Arc<AtomicUsize>> = [&meter1, &meter2]
        .iter()
        .map(|device| {
            let count = Arc::new(AtomicUsize::new(0));
            let counter = count.clone();
            device.on_received(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            count
        })
        .collect();

    let tcp = mocks.lock().get("tcp_client://10.0.0.12:9000").cloned().unwrap();
    let frame = fieldlink_driver::protocol::FrameLayout::default()
        .encode(0, 0, 0x05, 0, &[1])
        .unwrap();
    tcp.inject(&frame);
    meter1.receive(Duration::from_millis(50)).unwrap();

    assert_eq!(counts[0].load(Ordering::SeqCst), 1);
    assert_eq!(counts[1].load(Ordering::SeqCst), 1);
    assert!(meter1.last_received("notify").is_some());
}
