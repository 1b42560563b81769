//! 串口链路（serialport）

use crate::config::{DataBits, FlowControl, Parity, StopBits};
use crate::{ChannelDescription, Endpoint, Interactive, TransportError};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, trace, warn};

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// 串口链路
///
/// 读写各持有一个 `try_clone` 出来的句柄，接收线程阻塞读取时不影响发送。
pub struct SerialInteractive {
    description: ChannelDescription,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    broken: AtomicBool,
}

impl SerialInteractive {
    pub fn new(description: ChannelDescription) -> Self {
        Self {
            description,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    fn connect(&self) -> serialport::Result<(Box<dyn SerialPort>, Box<dyn SerialPort>)> {
        let settings = self.description.serial.clone().unwrap_or_default();
        let reader = serialport::new(&self.description.address, settings.baud_rate)
            .data_bits(settings.data_bits.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .flow_control(settings.flow_control.into())
            .timeout(self.description.receive_timeout())
            .open()?;
        let mut writer = reader.try_clone()?;
        writer.set_timeout(self.description.send_timeout())?;
        Ok((reader, writer))
    }

    fn mark_broken(&self, e: &std::io::Error) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            warn!("Serial port {} failed: {}", self.description.address, e);
        }
    }
}

impl Interactive for SerialInteractive {
    fn description(&self) -> &ChannelDescription {
        &self.description
    }

    fn open(&self) -> bool {
        self.close();
        match self.connect() {
            Ok((reader, writer)) => {
                *self.reader.lock() = Some(reader);
                *self.writer.lock() = Some(writer);
                self.broken.store(false, Ordering::Release);
                info!("Serial port {} opened", self.description.address);
                true
            },
            Err(e) => {
                warn!("Failed to open serial port {}: {}", self.description.address, e);
                false
            },
        }
    }

    fn close(&self) {
        let had_port = self.writer.lock().take().is_some();
        self.reader.lock().take();
        if had_port {
            info!("Serial port {} closed", self.description.address);
        }
    }

    fn connected(&self) -> bool {
        !self.broken.load(Ordering::Acquire) && self.writer.lock().is_some()
    }

    fn available(&self) -> usize {
        self.writer
            .lock()
            .as_ref()
            .and_then(|port| port.bytes_to_read().ok())
            .unwrap_or(0) as usize
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match port.write_all(data).and_then(|_| port.flush()) {
            Ok(()) => {
                trace!("Serial sent {} bytes", data.len());
                Ok(data.len())
            },
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => {
                self.mark_broken(&e);
                Err(TransportError::Io(e))
            },
        }
    }

    fn receive(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock();
        let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Some(timeout) = timeout {
            port.set_timeout(timeout.max(Duration::from_millis(1)))?;
        } else {
            port.set_timeout(self.description.receive_timeout())?;
        }
        match port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.mark_broken(&e);
                Err(TransportError::Io(e))
            },
        }
    }

    fn peer_endpoint(&self) -> Endpoint {
        Endpoint::new(self.description.address.clone(), 0)
    }
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Io(e.into())
    }
}
