use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

/// The serial port reduced to the only surface the broker actually drives:
/// a blocking, byte-oriented duplex that can be cloned into an independent
/// read handle. Production code boxes a `serialport::SerialPort`; tests box
/// one half of a `UnixStream` pair to stand in for the physical device
/// without any hardware or PTY.
pub trait DevicePort: Read + Write + Send {
    fn try_clone_device(&self) -> io::Result<Box<dyn DevicePort>>;
}

impl DevicePort for Box<dyn serialport::SerialPort> {
    fn try_clone_device(&self) -> io::Result<Box<dyn DevicePort>> {
        let cloned = serialport::SerialPort::try_clone(self.as_ref())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        Ok(Box::new(cloned))
    }
}

impl DevicePort for UnixStream {
    fn try_clone_device(&self) -> io::Result<Box<dyn DevicePort>> {
        Ok(Box::new(self.try_clone()?))
    }
}
