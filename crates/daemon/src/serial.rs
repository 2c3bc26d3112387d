// Tunnel Bridge - Serial Port Client
// Port enumeration, open/close, outbound writes and an inbound reader task (tokio-serial)

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_bridge_common::{
    EventPayload, FlowControl, Parity, PortDescriptor, PortError, PortOptions, ResourceKind,
    SendPayload,
};

use crate::events::EventSink;
use crate::stream::BoxedIo;

const READ_BUFFER: usize = 4096;

/// Access to the host's serial ports
pub trait SerialBackend: Send + Sync {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError>;

    fn open(&self, path: &str, options: &PortOptions) -> Result<BoxedIo, PortError>;
}

/// Real serial ports via tokio-serial
#[derive(Debug, Default)]
pub struct TokioSerialBackend;

impl TokioSerialBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SerialBackend for TokioSerialBackend {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError> {
        let ports = tokio_serial::available_ports().map_err(|e| PortError::ListFailed(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|port| {
                let mut descriptor = PortDescriptor {
                    path: port.port_name,
                    port_type: "unknown".to_string(),
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                    vid: None,
                    pid: None,
                };
                match port.port_type {
                    SerialPortType::UsbPort(usb) => {
                        descriptor.port_type = "usb".to_string();
                        descriptor.vid = Some(usb.vid);
                        descriptor.pid = Some(usb.pid);
                        descriptor.manufacturer = usb.manufacturer;
                        descriptor.product = usb.product;
                        descriptor.serial_number = usb.serial_number;
                    }
                    SerialPortType::PciPort => descriptor.port_type = "pci".to_string(),
                    SerialPortType::BluetoothPort => descriptor.port_type = "bluetooth".to_string(),
                    SerialPortType::Unknown => {}
                }
                descriptor
            })
            .collect())
    }

    fn open(&self, path: &str, options: &PortOptions) -> Result<BoxedIo, PortError> {
        let open_failed = |reason: String| PortError::OpenFailed {
            path: path.to_string(),
            reason,
        };

        let data_bits = match options.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => return Err(open_failed(format!("unsupported data bits: {}", other))),
        };
        let stop_bits = match options.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => return Err(open_failed(format!("unsupported stop bits: {}", other))),
        };
        let parity = match options.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match options.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        let stream = tokio_serial::new(path, options.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| open_failed(e.to_string()))?;

        Ok(Box::pin(stream))
    }
}

/// Bytes written to the port for `payload`
pub fn frame_payload(payload: &SendPayload) -> Vec<u8> {
    match payload {
        SendPayload::Text(text) => {
            let mut bytes = text.as_bytes().to_vec();
            if !text.ends_with('\n') {
                bytes.push(b'\n');
            }
            bytes
        }
        SendPayload::Bytes(bytes) => bytes.clone(),
    }
}

/// The currently open serial port
pub struct ActivePort {
    path: String,
    options: PortOptions,
    writer: WriteHalf<BoxedIo>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl ActivePort {
    /// Take ownership of an opened port and start forwarding inbound bytes to `events`
    pub fn start(path: String, options: PortOptions, io: BoxedIo, events: EventSink) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_loop(reader, path.clone(), events, closed.clone()));

        info!("Serial port {} open at {} baud", path, options.baud_rate);
        Self {
            path,
            options,
            writer,
            closed,
            reader,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &PortOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Cancelled once the port closes, locally or because the reader hit EOF or an error
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn write(&mut self, payload: &SendPayload) -> Result<usize, PortError> {
        if !self.is_open() {
            return Err(PortError::NotOpen);
        }

        let bytes = frame_payload(payload);
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| PortError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| PortError::WriteFailed(e.to_string()))?;

        debug!("Wrote {} bytes to {}", bytes.len(), self.path);
        Ok(bytes.len())
    }

    /// Stop the reader and release the port; failures are logged, never returned
    pub async fn close(mut self) {
        self.closed.cancel();
        if let Err(e) = self.writer.shutdown().await {
            warn!("Failed to shut down serial port {} cleanly: {}", self.path, e);
        }
        self.reader.abort();
        info!("Serial port {} closed", self.path);
    }
}

impl Drop for ActivePort {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedIo>,
    path: String,
    events: EventSink,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    info!("Serial port {} reached end of stream", path);
                    events.closed(ResourceKind::Serial);
                    closed.cancel();
                    return;
                }
                Ok(n) => events.data(ResourceKind::Serial, EventPayload::Bytes(buf[..n].to_vec())),
                Err(e) => {
                    warn!("Read from serial port {} failed: {}", path, e);
                    events.error(ResourceKind::Serial, format!("Read from {} failed: {}", path, e));
                    events.closed(ResourceKind::Serial);
                    closed.cancel();
                    return;
                }
            }
        }
    }
}
