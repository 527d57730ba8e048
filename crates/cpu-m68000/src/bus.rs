//! Bus protocol of the 68000: word-wide data path, function codes, and
//! per-access wait states.
//!
//! Every access returns a [`BusAccess`]. The `wait` field carries the number
//! of CPU clocks the external logic held off DTACK; the executor adds these
//! to the instruction's cycle count.

/// Function code driven on the FC0-FC2 pins during an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// User data space (FC = 1).
    UserData = 1,
    /// User program space (FC = 2).
    UserProgram = 2,
    /// Supervisor data space (FC = 5).
    SupervisorData = 5,
    /// Supervisor program space (FC = 6).
    SupervisorProgram = 6,
    /// Interrupt acknowledge (FC = 7).
    InterruptAck = 7,
}

impl FunctionCode {
    /// Select the data-space code for the given privilege level.
    #[must_use]
    pub fn data(supervisor: bool) -> Self {
        if supervisor {
            Self::SupervisorData
        } else {
            Self::UserData
        }
    }

    /// Select the program-space code for the given privilege level.
    #[must_use]
    pub fn program(supervisor: bool) -> Self {
        if supervisor {
            Self::SupervisorProgram
        } else {
            Self::UserProgram
        }
    }
}

/// Outcome of one bus cycle.
#[derive(Debug, Clone, Copy)]
pub struct BusAccess {
    /// Data returned by a read; zero for writes.
    pub data: u16,
    /// CPU clocks spent waiting for DTACK beyond the minimum four.
    pub wait: u8,
}

impl BusAccess {
    /// A zero-wait access.
    #[must_use]
    pub const fn ready(data: u16) -> Self {
        Self { data, wait: 0 }
    }

    /// An access delayed by `wait` CPU clocks.
    #[must_use]
    pub const fn delayed(data: u16, wait: u8) -> Self {
        Self { data, wait }
    }
}

/// Bus seen by the 68000. All word accesses are even-aligned; byte accesses
/// select the addressed half of the data bus.
pub trait M68kBus {
    fn read_word(&mut self, addr: u32, fc: FunctionCode) -> BusAccess;
    fn write_word(&mut self, addr: u32, value: u16, fc: FunctionCode) -> BusAccess;
    fn read_byte(&mut self, addr: u32, fc: FunctionCode) -> BusAccess;
    fn write_byte(&mut self, addr: u32, value: u8, fc: FunctionCode) -> BusAccess;

    /// RESET instruction pulses the reset line towards the peripherals.
    fn reset_peripherals(&mut self) {}

    /// Interrupt acknowledge cycle for the given level. The Amiga has no
    /// vector-number logic on the bus, so the default is the autovector.
    fn interrupt_ack(&mut self, level: u8) -> u8 {
        24 + level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_selection() {
        assert_eq!(FunctionCode::data(false), FunctionCode::UserData);
        assert_eq!(FunctionCode::data(true), FunctionCode::SupervisorData);
        assert_eq!(FunctionCode::program(true), FunctionCode::SupervisorProgram);
    }

    #[test]
    fn access_constructors() {
        let a = BusAccess::ready(0x1234);
        assert_eq!(a.data, 0x1234);
        assert_eq!(a.wait, 0);
        let b = BusAccess::delayed(0, 2);
        assert_eq!(b.wait, 2);
    }
}
