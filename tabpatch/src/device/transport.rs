// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{SerialPort, SerialPortType};
use tracing::debug;

/// Qualcomm emergency download mode (9008) USB ID.
pub const QDL_VID: u16 = 0x05c6;
pub const QDL_PID: u16 = 0x9008;

/// Byte pipe to a device in flash mode. Framing above this is handled by the
/// session.
pub trait Transport {
    fn open(&mut self) -> io::Result<()>;

    /// Read whatever is available, waiting at most `timeout`. Returns
    /// [`io::ErrorKind::TimedOut`] if nothing arrives in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write all of `data` within `timeout`.
    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;

    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        (**self).write(data, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        (**self).write(data, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Fill `buf` completely. Each underlying read gets the full `timeout`.
pub fn read_exact(
    transport: &mut (impl Transport + ?Sized),
    mut buf: &mut [u8],
    timeout: Duration,
) -> io::Result<()> {
    while !buf.is_empty() {
        let n = transport.read(buf, timeout)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Device closed the connection",
            ));
        }

        buf = &mut buf[n..];
    }

    Ok(())
}

/// The 9008 port exposed as a serial device by the Qualcomm USB driver.
pub struct SerialTransport {
    port_name: Option<String>,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Use `port_name` if given. Otherwise, the first port with the 9008 USB
    /// ID is used.
    pub fn new(port_name: Option<String>) -> Self {
        Self {
            port_name,
            port: None,
        }
    }

    /// Find ports that look like a device in emergency download mode.
    pub fn find_ports() -> io::Result<Vec<String>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;

        Ok(ports
            .into_iter()
            .filter(|p| match &p.port_type {
                SerialPortType::UsbPort(info) => info.vid == QDL_VID && info.pid == QDL_PID,
                _ => false,
            })
            .map(|p| p.port_name)
            .collect())
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "Port is not open"))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        let name = match &self.port_name {
            Some(n) => n.clone(),
            None => Self::find_ports()?.into_iter().next().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No {QDL_VID:04x}:{QDL_PID:04x} device found"),
                )
            })?,
        };

        debug!("Opening serial port: {name}");

        // The baud rate is ignored by the USB driver.
        let port = serialport::new(&name, 115_200)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(io::Error::from)?;

        self.port = Some(port);

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;
        port.read(buf)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;
        port.write_all(data)?;
        port.flush()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port");
        }
    }
}
