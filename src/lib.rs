//! Driver for the S21 service port found on Daikin indoor units.
//!
//! [`s21`] holds the wire format, [`transport`] moves bytes over either a
//! serial peripheral or bit-banged GPIO, and [`controller`] keeps a local
//! copy of the unit's state in sync by polling it.

pub mod config;
pub mod controller;
pub mod s21;
pub mod transport;

pub use config::DriverConfig;
pub use controller::{AcHandle, AcStateMachine, LinkStatus, PollTask};
pub use s21::{AcState, FanSpeed, Mode};
pub use transport::{open_transport, Transport, TransportConfig, TransportError};
