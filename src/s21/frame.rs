use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

// STX + 2 command bytes + checksum + ETX
pub const MIN_FRAME_LEN: usize = 5;

/// Largest frame either transport will send or accumulate.
pub const MAX_FRAME_LEN: usize = 64;

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramingFault {
    #[error("frame is {0} bytes, shorter than the 5 byte minimum")]
    TooShort(usize),
    #[error("frame starts with {0:#04x} instead of STX")]
    MissingStx(u8),
    #[error("frame ends with {0:#04x} instead of ETX")]
    MissingEtx(u8),
}

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Framing(#[from] FramingFault),

    #[error("checksum mismatch: expected {expected:#04x}, received {received:#04x}")]
    Checksum { expected: u8, received: u8 },

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLong(usize),
}

/// Two ASCII bytes identifying what a frame carries.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub [u8; 2]);

impl Command {
    /// Protocol probe, sent while the unit has not answered yet
    pub const PROBE: Command = Command(*b"F8");
    pub const PROBE_REPLY: Command = Command(*b"G8");

    pub const STATUS_QUERY: Command = Command(*b"F1");
    pub const STATUS_REPLY: Command = Command(*b"G1");
    /// Some units answer the status query with H1, same payload
    pub const STATUS_REPLY_ALT: Command = Command(*b"H1");

    pub const SENSOR_QUERY: Command = Command(*b"RH");
    pub const SENSOR_REPLY: Command = Command(*b"SH");

    pub const CONTROL: Command = Command(*b"D1");

    pub const fn new(code: &[u8; 2]) -> Self {
        Command(*code)
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}

impl std::str::FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            &[a, b] if a.is_ascii() && b.is_ascii() => Ok(Command([a, b])),
            _ => Err(anyhow::anyhow!("command must be two ASCII characters: {:?}", s)),
        }
    }
}

/// One decoded wire message. The codec does not interpret the command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }
}

/// Digest over the command and payload bytes of a frame. A leading STX is
/// skipped, so the bytes before the checksum field can be passed as is.
///
/// The sum is taken modulo 256. A sum that would read as ETX goes on the wire
/// as ENQ so the receiver never mistakes it for the end of the frame. Sums of
/// ETX and ENQ therefore share a checksum byte, and a corruption that moves
/// the sum between those two values goes undetected.
pub fn checksum(bytes: &[u8]) -> u8 {
    let body = match bytes.split_first() {
        Some((&STX, rest)) => rest,
        _ => bytes,
    };

    let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum == ETX {
        ENQ
    } else {
        sum
    }
}

pub fn encode(command: Command, payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = MIN_FRAME_LEN + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(len));
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(STX);
    buf.put_slice(command.as_bytes());
    buf.put_slice(payload);
    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.put_u8(ETX);

    Ok(buf.freeze())
}

pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let len = bytes.len();
    if len < MIN_FRAME_LEN {
        return Err(FramingFault::TooShort(len).into());
    }
    if bytes[0] != STX {
        return Err(FramingFault::MissingStx(bytes[0]).into());
    }
    if bytes[len - 1] != ETX {
        return Err(FramingFault::MissingEtx(bytes[len - 1]).into());
    }

    let received = bytes[len - 2];
    let expected = checksum(&bytes[..len - 2]);
    if received != expected {
        return Err(FrameError::Checksum { expected, received });
    }

    Ok(Frame::new(
        Command([bytes[1], bytes[2]]),
        Bytes::copy_from_slice(&bytes[3..len - 2]),
    ))
}
