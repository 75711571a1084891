/*

Serial transports
-----------------

The S21 connector is a 2400 baud, 8E2, half-duplex line. Two ways to drive it:

serial:<path>        a serial peripheral (USB adapter, SoC UART) through `serialport`
gpio:<tx>:<rx>       two plain GPIO lines, timed in software (needs the `rpi` feature)

Both only move bytes, framing lives in `s21::frame`.

*/

use std::{str::FromStr, time::Duration};

use thiserror::Error;

pub mod bitbang;
pub use bitbang::BitBangTransport;

pub mod serial;
pub use serial::SerialPortTransport;

#[cfg(test)]
pub mod mock;

pub trait Transport {
    /// Sends raw bytes, returning how many went out.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Reads one byte, or `None` if nothing arrived within `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        (**self).write_bytes(bytes)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        (**self).read_byte(timeout)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("gpio error: {0}")]
    Pin(String),

    #[error("start bit did not hold, line glitch")]
    Glitch,

    #[error("wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("unsupported transport: {0}")]
    Unsupported(&'static str),

    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportConfig {
    /// Use a serial peripheral
    Serial { path: String },

    /// Bit-bang the line on two GPIO pins
    Gpio { tx_pin: u8, rx_pin: u8 },
}

impl FromStr for TransportConfig {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.split_once(':').unwrap_or((s, ""));

        Ok(match kind {
            "serial" if !rest.is_empty() => TransportConfig::Serial {
                path: rest.to_string(),
            },
            "gpio" => {
                let (tx, rx) = rest
                    .split_once(':')
                    .ok_or_else(|| TransportError::InvalidConfig(format!("missing pins in {:?}", s)))?;
                let pin = |p: &str| {
                    p.parse::<u8>()
                        .map_err(|_| TransportError::InvalidConfig(format!("invalid pin: {:?}", p)))
                };
                TransportConfig::Gpio {
                    tx_pin: pin(tx)?,
                    rx_pin: pin(rx)?,
                }
            }
            _ => {
                return Err(TransportError::InvalidConfig(format!(
                    "expected serial:<path> or gpio:<tx>:<rx>, got {:?}",
                    s
                )))
            }
        })
    }
}

impl std::fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfig::Serial { path } => write!(f, "serial:{}", path),
            TransportConfig::Gpio { tx_pin, rx_pin } => write!(f, "gpio:{}:{}", tx_pin, rx_pin),
        }
    }
}

/// Opens the transport described by `config`.
pub fn open_transport(
    config: &TransportConfig,
) -> Result<Box<dyn Transport + Send>, TransportError> {
    log::info!("opening transport {}", config);

    match config {
        TransportConfig::Serial { path } => Ok(Box::new(SerialPortTransport::open(path)?)),
        TransportConfig::Gpio { tx_pin, rx_pin } => open_gpio(*tx_pin, *rx_pin),
    }
}

#[cfg(feature = "rpi")]
fn open_gpio(tx_pin: u8, rx_pin: u8) -> Result<Box<dyn Transport + Send>, TransportError> {
    use rppal::{gpio::Gpio, hal::Delay};

    let gpio = Gpio::new().map_err(|e| TransportError::Pin(e.to_string()))?;
    let tx = gpio
        .get(tx_pin)
        .map_err(|e| TransportError::Pin(format!("pin {}: {}", tx_pin, e)))?
        .into_output_low();
    let rx = gpio
        .get(rx_pin)
        .map_err(|e| TransportError::Pin(format!("pin {}: {}", rx_pin, e)))?
        .into_input_pullup();

    Ok(Box::new(BitBangTransport::new(tx, rx, Delay::new())?))
}

#[cfg(not(feature = "rpi"))]
fn open_gpio(_tx_pin: u8, _rx_pin: u8) -> Result<Box<dyn Transport + Send>, TransportError> {
    Err(TransportError::Unsupported(
        "gpio transport needs the `rpi` feature",
    ))
}
