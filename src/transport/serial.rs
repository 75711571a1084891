use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{Transport, TransportError};

pub const BAUD_RATE: u32 = 2400;
pub const PARITY: Parity = Parity::Even;
pub const STOP_BITS: StopBits = StopBits::Two;

const OPEN_TIMEOUT: Duration = Duration::from_millis(200);

/// A serial peripheral configured for the S21 line (2400 8E2).
///
/// Reads return whatever the port has buffered, with no notion of frames.
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialPortTransport {
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(PARITY)
            .stop_bits(STOP_BITS)
            .flow_control(FlowControl::None)
            .timeout(OPEN_TIMEOUT)
            .open()?;

        // Drop anything the unit sent before we were listening
        port.clear(serialport::ClearBuffer::All)?;

        Ok(Self::from_port(port))
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            timeout: OPEN_TIMEOUT,
        }
    }
}

impl Transport for SerialPortTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(bytes.len())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }

        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
