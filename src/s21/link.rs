use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace};
use thiserror::Error;

use super::frame::{self, Command, Frame, FrameError, ACK, ETX, MAX_FRAME_LEN, NAK, STX};
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no response from the unit")]
    Timeout,

    #[error("the unit rejected the frame (NAK)")]
    Rejected,

    #[error("invalid reply frame: {0}")]
    InvalidFrame(FrameError),

    #[error("unexpected byte {0:#04x} instead of a handshake")]
    UnexpectedByte(u8),

    #[error("could not encode frame: {0}")]
    Encode(FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LinkError {
    /// Whether the unit can be assumed to have never seen the frame
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout | LinkError::Rejected | LinkError::Transport(_)
        )
    }
}

/// Bounds on every wait of a poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait for the first byte after sending a frame
    pub ack_timeout: Duration,
    /// Wait for a reply frame to start after an ACK
    pub reply_timeout: Duration,
    /// Silence that ends a reply frame early
    pub inter_byte_timeout: Duration,
    /// Pause between the steps of a poll cycle
    pub settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(800),
            reply_timeout: Duration::from_millis(500),
            inter_byte_timeout: Duration::from_millis(100),
            settle: Duration::from_millis(500),
        }
    }
}

/// Runs one command exchange: send the frame, read the handshake, read and
/// acknowledge the reply frame if the unit sends one.
///
/// Returns `Ok(None)` when the unit only acknowledged the frame. Nothing is
/// retried here; the poll cadence takes care of that.
pub fn exchange<T: Transport + ?Sized>(
    transport: &mut T,
    timing: &Timing,
    command: Command,
    payload: &[u8],
) -> Result<Option<Frame>, LinkError> {
    let encoded = frame::encode(command, payload).map_err(LinkError::Encode)?;
    trace!("tx {}: {}", command, hex::encode(&encoded));

    let written = transport.write_bytes(&encoded)?;
    if written != encoded.len() {
        return Err(TransportError::ShortWrite {
            written,
            expected: encoded.len(),
        }
        .into());
    }

    match read_byte(transport, timing.ack_timeout)? {
        None => Err(LinkError::Timeout),
        Some(NAK) => Err(LinkError::Rejected),
        Some(STX) => read_reply(transport, timing),
        Some(ACK) => match read_byte(transport, timing.reply_timeout)? {
            Some(STX) => read_reply(transport, timing),
            Some(other) => {
                debug!("{} acknowledged, ignoring trailing {:#04x}", command, other);
                Ok(None)
            }
            None => Ok(None),
        },
        Some(other) => Err(LinkError::UnexpectedByte(other)),
    }
}

// A glitched start bit counts as silence, the line is idle again afterwards.
fn read_byte<T: Transport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Option<u8>, TransportError> {
    match transport.read_byte(timeout) {
        Err(TransportError::Glitch) => Ok(None),
        other => other,
    }
}

/// Accumulates a reply whose STX has already been read.
fn read_reply<T: Transport + ?Sized>(
    transport: &mut T,
    timing: &Timing,
) -> Result<Option<Frame>, LinkError> {
    let mut buf = BytesMut::with_capacity(MAX_FRAME_LEN);
    buf.extend_from_slice(&[STX]);

    while buf.len() < MAX_FRAME_LEN {
        match read_byte(transport, timing.inter_byte_timeout)? {
            Some(byte) => {
                buf.extend_from_slice(&[byte]);
                if byte == ETX {
                    break;
                }
            }
            None => break,
        }
    }
    trace!("rx: {}", hex::encode(&buf));

    let reply = frame::decode(&buf).map_err(LinkError::InvalidFrame)?;
    transport.write_bytes(&[ACK])?;
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, Step};

    fn timing() -> Timing {
        Timing {
            settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn reply(command: Command, payload: &[u8]) -> Vec<u8> {
        frame::encode(command, payload).unwrap().to_vec()
    }

    #[test]
    fn test_ack_without_reply() {
        let mut transport = MockTransport::new([Step::Respond(vec![ACK])]);
        let result = exchange(&mut transport, &timing(), Command::CONTROL, b"13LA").unwrap();

        assert_eq!(result, None);
        assert_eq!(transport.frames(), vec![reply(Command::CONTROL, b"13LA")]);
        assert!(transport.acks().is_empty());
    }

    #[test]
    fn test_ack_then_reply() {
        let mut response = vec![ACK];
        response.extend(reply(Command::STATUS_REPLY, b"13LA"));
        let mut transport = MockTransport::new([Step::Respond(response)]);

        let result = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap();
        assert_eq!(
            result,
            Some(Frame::new(Command::STATUS_REPLY, &b"13LA"[..]))
        );
        assert_eq!(transport.acks(), vec![ACK]);
    }

    #[test]
    fn test_direct_reply() {
        let mut transport =
            MockTransport::new([Step::Respond(reply(Command::SENSOR_REPLY, b"532+"))]);

        let result = exchange(&mut transport, &timing(), Command::SENSOR_QUERY, &[]).unwrap();
        assert_eq!(
            result,
            Some(Frame::new(Command::SENSOR_REPLY, &b"532+"[..]))
        );
        assert_eq!(transport.acks(), vec![ACK]);
    }

    #[test]
    fn test_timeout() {
        let mut transport = MockTransport::new([Step::Silent]);
        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(err, LinkError::Timeout));
        assert!(err.is_delivery_failure());
    }

    #[test]
    fn test_nak() {
        let mut transport = MockTransport::new([Step::Respond(vec![NAK])]);
        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(err, LinkError::Rejected));
        assert!(transport.acks().is_empty());
    }

    #[test]
    fn test_bad_checksum_is_not_acknowledged() {
        let mut response = reply(Command::STATUS_REPLY, b"13LA");
        let checksum = response.len() - 2;
        response[checksum] ^= 0x01;
        let mut transport = MockTransport::new([Step::Respond(response)]);

        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::InvalidFrame(FrameError::Checksum { .. })
        ));
        assert!(!err.is_delivery_failure());
        assert!(transport.acks().is_empty());
    }

    #[test]
    fn test_truncated_reply() {
        // The unit goes quiet halfway through the frame
        let response = reply(Command::STATUS_REPLY, b"13LA")[..5].to_vec();
        let mut transport = MockTransport::new([Step::Respond(response)]);

        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::InvalidFrame(FrameError::Framing(_))
        ));
    }

    #[test]
    fn test_runaway_reply_is_bounded() {
        let mut response = vec![STX];
        response.extend(std::iter::repeat(b'0').take(2 * MAX_FRAME_LEN));
        let response_len = response.len();
        let mut transport = MockTransport::new([Step::Respond(response)]);

        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(err, LinkError::InvalidFrame(_)));
        // STX plus the bytes read after it fill the buffer, the rest is left unread
        assert_eq!(transport.pending(), response_len - MAX_FRAME_LEN);
    }

    #[test]
    fn test_unexpected_first_byte() {
        let mut transport = MockTransport::new([Step::Respond(vec![0x42])]);
        let err = exchange(&mut transport, &timing(), Command::STATUS_QUERY, &[]).unwrap_err();
        assert!(matches!(err, LinkError::UnexpectedByte(0x42)));
    }
}
