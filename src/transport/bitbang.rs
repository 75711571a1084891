use std::time::Duration;

use bitfield::bitfield;
use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};
use log::trace;

use super::{Transport, TransportError};

/// One bit cell at 2400 baud
pub const BIT_PERIOD_US: u32 = 417;

// Granularity of the wait for a start bit
const POLL_STEP_US: u32 = 10;

// Start, data and parity cells, the ones that have to go out back to back
const TIMED_CELLS: usize = 10;
const STOP_CELLS: u32 = 2;

bitfield! {
    /// One character as it crosses the wire, first cell in bit 0. Cell values
    /// are UART logic levels; the line itself is inverted, so a 1 leaves it at
    /// its idle low level.
    pub struct Character(u16);
    impl Debug;
    pub start, set_start: 0;
    pub u8, data, set_data: 8, 1;
    pub parity, set_parity: 9;
    pub u8, stop, set_stop: 11, 10;
}

impl Clone for Character {
    fn clone(&self) -> Self {
        Character(self.0)
    }
}

impl Copy for Character {}

impl Character {
    pub fn new(byte: u8) -> Self {
        let mut c = Character(0);
        c.set_start(false);
        c.set_data(byte);
        c.set_parity(Character::parity_of(byte));
        c.set_stop(0b11);
        c
    }

    /// Parity cell value: set when the data has an odd number of ones, which
    /// makes the character even parity as a whole.
    pub fn parity_of(byte: u8) -> bool {
        byte.count_ones() % 2 == 1
    }

    /// Line level of cell `index`, true = high
    pub fn line_level(&self, index: usize) -> bool {
        self.0 & (1 << index) == 0
    }

    pub fn parity_ok(&self) -> bool {
        self.parity() == Character::parity_of(self.data())
    }
}

/// Software UART on two GPIO lines, for boards where the S21 pins are not
/// routed to a serial peripheral.
///
/// Timing comes from busy-wait delays, so the bit period is only as good as
/// `D`. Transmission of start, data and parity cells runs inside a
/// `critical_section`. On bare metal that masks interrupts. With the `std`
/// implementation used on Linux it is only a process-wide lock: the scheduler
/// can still preempt the thread mid-character and stretch a cell.
pub struct BitBangTransport<Tx, Rx, D> {
    tx: Tx,
    rx: Rx,
    delay: D,
}

fn pin_error<E: core::fmt::Debug>(e: E) -> TransportError {
    TransportError::Pin(format!("{:?}", e))
}

impl<Tx, Rx, D> BitBangTransport<Tx, Rx, D>
where
    Tx: OutputPin,
    Rx: InputPin,
    D: DelayNs,
{
    pub fn new(mut tx: Tx, rx: Rx, delay: D) -> Result<Self, TransportError> {
        // Idle
        tx.set_low().map_err(pin_error)?;
        Ok(Self { tx, rx, delay })
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        let character = Character::new(byte);
        let tx = &mut self.tx;
        let delay = &mut self.delay;

        critical_section::with(|_| -> Result<(), TransportError> {
            for cell in 0..TIMED_CELLS {
                if character.line_level(cell) {
                    tx.set_high().map_err(pin_error)?;
                } else {
                    tx.set_low().map_err(pin_error)?;
                }
                delay.delay_us(BIT_PERIOD_US);
            }
            tx.set_low().map_err(pin_error)
        })?;

        self.delay.delay_us(BIT_PERIOD_US * STOP_CELLS);
        Ok(())
    }

    fn line_active(&mut self) -> Result<bool, TransportError> {
        self.rx.is_high().map_err(pin_error)
    }

    pub fn receive_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let timeout_us = timeout.as_micros();
        let mut waited_us: u128 = 0;

        while !self.line_active()? {
            if waited_us >= timeout_us {
                return Ok(None);
            }
            self.delay.delay_us(POLL_STEP_US);
            waited_us += POLL_STEP_US as u128;
        }

        // Move to the middle of the start cell and check it is still there
        self.delay.delay_us(BIT_PERIOD_US / 2);
        if !self.line_active()? {
            return Err(TransportError::Glitch);
        }
        self.delay.delay_us(BIT_PERIOD_US);

        let mut character = Character::new(0);
        let mut byte = 0u8;
        for bit in 0..8 {
            if !self.line_active()? {
                byte |= 1 << bit;
            }
            self.delay.delay_us(BIT_PERIOD_US);
        }
        character.set_data(byte);
        character.set_parity(!self.line_active()?);

        if !character.parity_ok() {
            trace!("parity mismatch on {:#04x}", byte);
        }

        self.delay.delay_us(BIT_PERIOD_US * STOP_CELLS);
        Ok(Some(byte))
    }
}

impl<Tx, Rx, D> Transport for BitBangTransport<Tx, Rx, D>
where
    Tx: OutputPin,
    Rx: InputPin,
    D: DelayNs,
{
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(bytes.len())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        self.receive_byte(timeout)
    }
}
