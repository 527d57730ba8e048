//! Paula: the interrupt controller, with the audio unit and the disk
//! controller as sub-components.
//!
//! Fourteen interrupt sources map onto six 68000 interrupt levels:
//!
//! | IPL | INTREQ bits | Sources              |
//! |-----|-------------|----------------------|
//! | 6   | 13          | EXTER (CIA-B)        |
//! | 5   | 12, 11      | DSKSYN, RBF          |
//! | 4   | 10-7        | AUD3-AUD0            |
//! | 3   | 6-4         | BLIT, VERTB, COPER   |
//! | 2   | 3           | PORTS (CIA-A)        |
//! | 1   | 2-0         | SOFT, DSKBLK, TBE    |
//!
//! Bit 14 of INTENA is the master enable. The derived level is published
//! to the CPU, which samples it before every instruction.

pub mod audio;
pub mod disk;

use crate::custom_regs;

pub struct Paula {
    pub intena: u16,
    pub intreq: u16,
    pub adkcon: u16,
    pub audio: audio::AudioUnit,
    pub disk: disk::DiskController,
}

impl Paula {
    #[must_use]
    pub fn new() -> Self {
        Self {
            intena: 0,
            intreq: 0,
            adkcon: 0,
            audio: audio::AudioUnit::new(),
            disk: disk::DiskController::new(),
        }
    }

    pub fn reset(&mut self) {
        self.intena = 0;
        self.intreq = 0;
        self.adkcon = 0;
        self.audio.reset();
        self.disk.reset();
    }

    pub fn write_intena(&mut self, value: u16) {
        custom_regs::set_clr_write(&mut self.intena, value);
    }

    pub fn write_intreq(&mut self, value: u16) {
        custom_regs::set_clr_write(&mut self.intreq, value);
    }

    pub fn write_adkcon(&mut self, value: u16) {
        custom_regs::set_clr_write(&mut self.adkcon, value);
    }

    /// Set one INTREQ bit directly (event-handler path).
    pub fn set_irq_bit(&mut self, bit: u16) {
        self.intreq |= 1 << bit;
    }

    /// Clear one INTREQ bit directly.
    pub fn clear_irq_bit(&mut self, bit: u16) {
        self.intreq &= !(1 << bit);
    }

    /// WORDSYNC enable (ADKCON bit 10).
    #[must_use]
    pub fn wordsync(&self) -> bool {
        self.adkcon & custom_regs::ADKF_WORDSYNC != 0
    }

    /// The interrupt level currently requested from the CPU.
    #[must_use]
    pub fn compute_ipl(&self) -> u8 {
        if self.intena & (1 << custom_regs::INT_INTEN) == 0 {
            return 0;
        }
        let active = self.intena & self.intreq & 0x3FFF;
        if active == 0 {
            return 0;
        }
        if active & 0x2000 != 0 {
            return 6;
        }
        if active & 0x1800 != 0 {
            return 5;
        }
        if active & 0x0780 != 0 {
            return 4;
        }
        if active & 0x0070 != 0 {
            return 3;
        }
        if active & 0x0008 != 0 {
            return 2;
        }
        1
    }
}

impl Default for Paula {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipl_respects_master_enable() {
        let mut paula = Paula::new();
        paula.intreq = 0x3FFF;
        paula.intena = 0x3FFF;
        assert_eq!(paula.compute_ipl(), 0);
        paula.intena |= 1 << 14;
        assert_eq!(paula.compute_ipl(), 6);
    }

    #[test]
    fn priority_mapping() {
        let mut paula = Paula::new();
        paula.intena = (1 << 14) | 0x3FFF;
        for (bit, level) in [(0u16, 1u8), (1, 1), (3, 2), (4, 3), (6, 3), (7, 4), (11, 5), (12, 5), (13, 6)] {
            paula.intreq = 1 << bit;
            assert_eq!(paula.compute_ipl(), level, "bit {bit}");
        }
    }

    #[test]
    fn set_clr_write_protocol() {
        let mut paula = Paula::new();
        paula.write_intena(0xC010);
        assert_eq!(paula.intena, 0x4010);
        paula.write_intena(0x0010);
        assert_eq!(paula.intena, 0x4000);
    }
}
