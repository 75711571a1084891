use std::{collections::VecDeque, io, time::Duration};

use super::{Transport, TransportError};
use crate::s21::frame::ACK;

/// What the simulated unit does after a frame is written
#[derive(Clone, Debug)]
pub enum Step {
    /// Queue these bytes for reading
    Respond(Vec<u8>),
    /// Say nothing, reads time out
    Silent,
    /// The write itself fails
    Fail,
}

/// An in-memory transport replaying a script, one step per frame written.
/// Once the script runs out the responder answers, or the unit stays silent.
#[derive(Default)]
pub struct MockTransport {
    script: VecDeque<Step>,
    responder: Option<Box<dyn FnMut(&[u8]) -> Step + Send>>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Answers every frame by looking at it
    pub fn with_responder(responder: impl FnMut(&[u8]) -> Step + Send + 'static) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Default::default()
        }
    }

    /// Takes over once the remaining script has been played
    pub fn set_responder(&mut self, responder: impl FnMut(&[u8]) -> Step + Send + 'static) {
        self.responder = Some(Box::new(responder));
    }

    pub fn push(&mut self, step: Step) {
        self.script.push_back(step);
    }

    /// Frames written, handshake bytes excluded
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.written
            .iter()
            .filter(|w| w.as_slice() != [ACK])
            .cloned()
            .collect()
    }

    /// ACK bytes written back to the unit
    pub fn acks(&self) -> Vec<u8> {
        self.written
            .iter()
            .filter(|w| w.as_slice() == [ACK])
            .map(|w| w[0])
            .collect()
    }

    /// Bytes queued but never read
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Transport for MockTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if bytes == [ACK] {
            self.written.push(bytes.to_vec());
            return Ok(1);
        }

        let step = match self.script.pop_front() {
            Some(step) => step,
            None => match self.responder.as_mut() {
                Some(responder) => responder(bytes),
                None => Step::Silent,
            },
        };

        match step {
            Step::Respond(response) => self.rx.extend(response),
            Step::Silent => {}
            Step::Fail => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged").into());
            }
        }

        self.written.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(self.rx.pop_front())
    }
}
