use std::path::Path;
use std::time::Duration;

use serialport::{available_ports, SerialPort, SerialPortInfo, SerialPortType};

use crate::config::SerialSettings;
use crate::device_port::DevicePort;

/// Read timeout applied to the opened device handle. The broker polls for
/// readability via short blocking reads rather than true non-blocking I/O;
/// a read that times out without data is simply retried by the reader loop,
/// which is the `serialport`-idiomatic stand-in for `O_NONBLOCK`.
const DEVICE_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub fn list_available_ports(include_all: bool) -> Vec<SerialPortInfo> {
    available_ports()
        .unwrap_or_default()
        .into_iter()
        .filter(|port| include_all || matches!(port.port_type, SerialPortType::UsbPort(_)))
        .collect::<Vec<_>>()
}

/// Opens (or reopens) the device node with the given framing settings. Used
/// both at daemon startup and by every port reset, so the framing applied on
/// reopen can never drift from the framing applied at startup.
pub fn open_device(path: &Path, settings: &SerialSettings) -> serialport::Result<Box<dyn DevicePort>> {
    let port: Box<dyn SerialPort> = serialport::new(path.to_string_lossy(), settings.baudrate)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .timeout(DEVICE_READ_TIMEOUT)
        .open()?;
    Ok(Box::new(port))
}
