//! Real relay backend: one 74HC595 shift register per board, driven over
//! three GPIO lines (clock/latch/data).

use std::sync::Mutex;

use rppal::gpio::{Gpio, OutputPin};

use super::{Error, PortAddress, RelayBackend, RelayState, PORTS_PER_BOARD};

pub mod pin {
    pub const SHIFT_REGISTER_CLOCK: u8 = 4;
    pub const SHIFT_REGISTER_OE: u8 = 17;
    pub const SHIFT_REGISTER_LATCH: u8 = 22;
    pub const SHIFT_REGISTER_DATA: u8 = 27;
}

struct ShiftRegisterBoard {
    clock: OutputPin,
    latch: OutputPin,
    data: OutputPin,
    /// Last-written bit per port; re-sent in full on every `set` since the
    /// shift register has no per-bit addressing.
    bits: [bool; PORTS_PER_BOARD],
}

impl ShiftRegisterBoard {
    fn shift_out(&mut self) {
        self.latch.set_low();
        for bit in self.bits.iter().rev() {
            self.data.write((*bit).into());
            self.clock.set_high();
            self.clock.set_low();
        }
        self.latch.set_high();
    }
}

/// Drives up to [`super::PORTS_PER_BOARD`]-port shift-register boards over
/// a shared clock/latch/data bus. Only one board is wired up today; the
/// `boards` vector leaves room for additional expansion boards without
/// changing the addressing scheme.
pub struct GpioRelayBackend {
    boards: Mutex<Vec<ShiftRegisterBoard>>,
}

impl GpioRelayBackend {
    pub fn new() -> Result<Self, Error> {
        let gpio = Gpio::new().map_err(|err| Error::Backend(err.to_string()))?;

        let mut oe = gpio.get(pin::SHIFT_REGISTER_OE).map_err(|err| Error::Backend(err.to_string()))?.into_output_low();
        oe.set_low();
        std::mem::forget(oe); // output-enable stays asserted for the process lifetime

        let clock = gpio.get(pin::SHIFT_REGISTER_CLOCK).map_err(|err| Error::Backend(err.to_string()))?.into_output_low();
        let latch = gpio.get(pin::SHIFT_REGISTER_LATCH).map_err(|err| Error::Backend(err.to_string()))?.into_output_high();
        let data = gpio.get(pin::SHIFT_REGISTER_DATA).map_err(|err| Error::Backend(err.to_string()))?.into_output_low();

        Ok(Self { boards: Mutex::new(vec![ShiftRegisterBoard { clock, latch, data, bits: [false; PORTS_PER_BOARD] }]) })
    }
}

impl RelayBackend for GpioRelayBackend {
    fn set(&self, address: PortAddress, state: RelayState) -> Result<(), Error> {
        let mut boards = self.boards.lock().unwrap();
        let board = boards.get_mut(address.board).ok_or_else(|| Error::Backend(format!("no board at index {}", address.board)))?;
        if address.port >= PORTS_PER_BOARD {
            return Err(Error::Backend(format!("port {} out of range", address.port)));
        }
        board.bits[address.port] = state.is_on();
        board.shift_out();
        Ok(())
    }

    fn get(&self, address: PortAddress) -> Result<RelayState, Error> {
        let boards = self.boards.lock().unwrap();
        let board = boards.get(address.board).ok_or_else(|| Error::Backend(format!("no board at index {}", address.board)))?;
        Ok(RelayState::from_bool(*board.bits.get(address.port).ok_or_else(|| Error::Backend(format!("port {} out of range", address.port)))?))
    }

    /// Sets every bit for the run in one pass, then shifts out once — a
    /// single 16-clock transaction instead of one per port.
    fn set_many(&self, board: usize, start_port: usize, states: &[RelayState]) -> Result<(), Error> {
        let mut boards = self.boards.lock().unwrap();
        let board = boards.get_mut(board).ok_or_else(|| Error::Backend(format!("no board at index {board}")))?;
        for (offset, state) in states.iter().enumerate() {
            let port = start_port + offset;
            if port >= PORTS_PER_BOARD {
                return Err(Error::Backend(format!("port {port} out of range")));
            }
            board.bits[port] = state.is_on();
        }
        board.shift_out();
        Ok(())
    }
}
