//! Paula UART (SERDAT/SERPER) with a pluggable back-end device.
//!
//! Only the register surface and the transmit-buffer-empty interrupt are
//! modeled; the loopback device routes transmitted words straight back
//! into the receive buffer, which is enough for the self-tests the system
//! software runs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialDevice {
    None,
    Loopback,
}

pub struct SerialPort {
    pub serper: u16,
    pub device: SerialDevice,
    rx: Option<u16>,
    overrun: bool,
}

impl SerialPort {
    #[must_use]
    pub fn new() -> Self {
        Self {
            serper: 0,
            device: SerialDevice::None,
            rx: None,
            overrun: false,
        }
    }

    pub fn reset(&mut self) {
        self.serper = 0;
        self.rx = None;
        self.overrun = false;
    }

    /// SERDAT write: transmit one word. Returns true when the TBE
    /// interrupt should be scheduled.
    pub fn write_serdat(&mut self, value: u16) -> bool {
        if self.device == SerialDevice::Loopback {
            if self.rx.is_some() {
                self.overrun = true;
            } else {
                self.rx = Some(value & 0x03FF);
            }
        }
        true
    }

    /// Does the receive buffer hold a word (RBF interrupt)?
    #[must_use]
    pub fn rx_full(&self) -> bool {
        self.rx.is_some()
    }

    /// SERDATR read.
    ///
    /// Bit 13 TBE (always set here), bit 14 RBF, bit 15 OVRUN.
    pub fn read_serdatr(&mut self) -> u16 {
        let mut value = 0x2000;
        if let Some(word) = self.rx.take() {
            value |= 0x4000 | word;
            if self.overrun {
                value |= 0x8000;
                self.overrun = false;
            }
        } else {
            // Idle line: stop bit and mark state.
            value |= 0x01FF;
        }
        value
    }
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}


impl SerialPort {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.put_u16(self.serper);
        w.put_bool(self.device == SerialDevice::Loopback);
        w.put_u16(self.rx.unwrap_or(0));
        w.put_bool(self.rx.is_some());
        w.put_bool(self.overrun);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.serper = r.get_u16()?;
        self.device = if r.get_bool()? {
            SerialDevice::Loopback
        } else {
            SerialDevice::None
        };
        let rx = r.get_u16()?;
        self.rx = r.get_bool()?.then_some(rx);
        self.overrun = r.get_bool()?;
        Ok(())
    }
}
