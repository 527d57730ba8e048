//! Memory map.
//!
//! A 24-bit address space carved into 64 KB banks. Each bank is tagged
//! with the component that answers there; the bus dispatches CIA, RTC, and
//! custom-register banks to the owning chips and this module serves the
//! RAM and ROM banks directly.
//!
//! The OVL line (CIA-A PRA bit 0) overlays the ROM over bank 0 so the CPU
//! finds its reset vectors; Kickstart clears it early in boot.

#![allow(clippy::cast_possible_truncation)]

use crate::config::AmigaConfig;

pub const FAST_BASE: u32 = 0x20_0000;
pub const SLOW_BASE: u32 = 0xC0_0000;
pub const ROM_BASE: u32 = 0xF8_0000;

/// Who answers a 64 KB bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemSrc {
    /// Unmapped; reads float, writes vanish.
    #[default]
    None,
    ChipRam,
    SlowRam,
    FastRam,
    Cia,
    Rtc,
    Custom,
    Rom,
    ExtRom,
}

pub struct Memory {
    pub chip: Vec<u8>,
    chip_mask: u32,
    pub slow: Vec<u8>,
    pub fast: Vec<u8>,
    pub rom: Vec<u8>,
    pub ext: Vec<u8>,
    /// First page of the extended ROM window (0xE0 or 0xF0).
    pub ext_start: u8,
    /// ROM overlaid over bank 0 (reset state).
    pub overlay: bool,
    /// RTC bank mapped (configuration dependent).
    pub rtc_mapped: bool,
    banks: [MemSrc; 256],
}

impl Memory {
    #[must_use]
    pub fn new(config: &AmigaConfig) -> Self {
        let mut mem = Self {
            chip: vec![0; config.chip_ram_kb * 1024],
            chip_mask: (config.chip_ram_kb as u32 * 1024 - 1) & 0x1F_FFFF,
            slow: vec![0; config.slow_ram_kb * 1024],
            fast: vec![0; config.fast_ram_kb * 1024],
            rom: Vec::new(),
            ext: Vec::new(),
            ext_start: config.ext_rom_start,
            overlay: true,
            rtc_mapped: config.rtc_enabled,
            banks: [MemSrc::None; 256],
        };
        mem.update_bank_map();
        mem
    }

    pub fn alloc_chip(&mut self, kb: usize) {
        self.chip = vec![0; kb * 1024];
        self.chip_mask = (kb as u32 * 1024 - 1) & 0x1F_FFFF;
        self.update_bank_map();
    }

    pub fn alloc_slow(&mut self, kb: usize) {
        self.slow = vec![0; kb * 1024];
        self.update_bank_map();
    }

    pub fn alloc_fast(&mut self, kb: usize) {
        self.fast = vec![0; kb * 1024];
        self.update_bank_map();
    }

    pub fn load_rom(&mut self, data: Vec<u8>) {
        self.rom = data;
        self.update_bank_map();
    }

    pub fn load_ext_rom(&mut self, data: Vec<u8>) {
        self.ext = data;
        self.update_bank_map();
    }

    pub fn set_ext_start(&mut self, page: u8) {
        self.ext_start = page;
        self.update_bank_map();
    }

    pub fn set_overlay(&mut self, on: bool) {
        self.overlay = on;
        self.update_bank_map();
    }

    #[must_use]
    pub fn has_rom(&self) -> bool {
        !self.rom.is_empty()
    }

    #[must_use]
    pub fn has_chip_ram(&self) -> bool {
        !self.chip.is_empty()
    }

    #[must_use]
    pub fn chip_ram_bytes(&self) -> usize {
        self.chip.len()
    }

    #[must_use]
    pub fn slow_ram_bytes(&self) -> usize {
        self.slow.len()
    }

    /// Rebuild the bank table from the current allocation state.
    pub fn update_bank_map(&mut self) {
        self.banks = [MemSrc::None; 256];

        // Chip RAM fills banks $00-$1F, mirrored up to the 2 MB window.
        for bank in 0x00..0x20 {
            self.banks[bank] = if self.chip.is_empty() {
                MemSrc::None
            } else {
                MemSrc::ChipRam
            };
        }
        // Fast RAM expands upward from $200000.
        let fast_banks = self.fast.len() / 0x1_0000;
        for bank in 0x20..(0x20 + fast_banks).min(0xA0) {
            self.banks[bank] = MemSrc::FastRam;
        }
        // CIAs answer the whole $BFxxxx page.
        self.banks[0xBF] = MemSrc::Cia;
        // Slow RAM at $C00000.
        let slow_banks = self.slow.len() / 0x1_0000;
        for bank in 0xC0..(0xC0 + slow_banks).min(0xD8) {
            self.banks[bank] = MemSrc::SlowRam;
        }
        if self.rtc_mapped {
            self.banks[0xDC] = MemSrc::Rtc;
        }
        self.banks[0xDF] = MemSrc::Custom;
        // Extended ROM window.
        if !self.ext.is_empty() {
            let start = self.ext_start as usize;
            for bank in start..(start + 8).min(0xF8) {
                self.banks[bank] = MemSrc::ExtRom;
            }
        }
        // Kickstart at $F80000-$FFFFFF (256 KB images appear twice).
        if !self.rom.is_empty() {
            for bank in 0xF8..=0xFF {
                self.banks[bank] = MemSrc::Rom;
            }
        }
        if self.overlay && !self.rom.is_empty() {
            for bank in 0x00..0x20 {
                self.banks[bank] = MemSrc::Rom;
            }
        }
    }

    /// The component answering at `addr`.
    #[must_use]
    pub fn src(&self, addr: u32) -> MemSrc {
        self.banks[(addr >> 16) as usize & 0xFF]
    }

    /// Serve a byte read from a RAM/ROM bank.
    #[must_use]
    pub fn read8(&self, addr: u32) -> u8 {
        match self.src(addr) {
            MemSrc::ChipRam => self.chip[(addr & self.chip_mask) as usize],
            MemSrc::SlowRam => {
                let off = (addr - SLOW_BASE) as usize % self.slow.len();
                self.slow[off]
            }
            MemSrc::FastRam => {
                let off = (addr - FAST_BASE) as usize;
                if off < self.fast.len() {
                    self.fast[off]
                } else {
                    0xFF
                }
            }
            MemSrc::Rom => {
                let off = addr as usize % self.rom.len();
                self.rom[off]
            }
            MemSrc::ExtRom => {
                let base = u32::from(self.ext_start) << 16;
                let off = (addr - base) as usize % self.ext.len();
                self.ext[off]
            }
            _ => 0xFF,
        }
    }

    /// Serve a byte write to a RAM bank. ROM writes are dropped.
    pub fn write8(&mut self, addr: u32, value: u8) {
        match self.src(addr) {
            MemSrc::ChipRam => self.chip[(addr & self.chip_mask) as usize] = value,
            MemSrc::SlowRam => {
                let off = (addr - SLOW_BASE) as usize % self.slow.len();
                self.slow[off] = value;
            }
            MemSrc::FastRam => {
                let off = (addr - FAST_BASE) as usize;
                if off < self.fast.len() {
                    self.fast[off] = value;
                }
            }
            _ => {}
        }
    }

    /// DMA word read. Agnus only ever sees chip RAM, regardless of overlay.
    #[must_use]
    pub fn read_chip16(&self, addr: u32) -> u16 {
        let a = (addr & self.chip_mask & !1) as usize;
        u16::from(self.chip[a]) << 8 | u16::from(self.chip[a + 1])
    }

    /// DMA word write into chip RAM.
    pub fn write_chip16(&mut self, addr: u32, value: u16) {
        let a = (addr & self.chip_mask & !1) as usize;
        self.chip[a] = (value >> 8) as u8;
        self.chip[a + 1] = value as u8;
    }

    /// Side-effect-free inspection read.
    #[must_use]
    pub fn spypeek8(&self, addr: u32) -> u8 {
        match self.src(addr) {
            MemSrc::Cia | MemSrc::Custom | MemSrc::Rtc => 0xFF,
            _ => self.read8(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmigaConfig;

    fn mem_512k() -> Memory {
        let mut config = AmigaConfig::a500();
        config.chip_ram_kb = 512;
        Memory::new(&config)
    }

    #[test]
    fn overlay_maps_rom_at_zero() {
        let mut mem = mem_512k();
        mem.load_rom(vec![0xAB; 256 * 1024]);
        assert_eq!(mem.src(0x000000), MemSrc::Rom);
        assert_eq!(mem.read8(0x000000), 0xAB);
        mem.set_overlay(false);
        assert_eq!(mem.src(0x000000), MemSrc::ChipRam);
        assert_eq!(mem.read8(0x000000), 0x00);
    }

    #[test]
    fn chip_ram_mirrors_through_window() {
        let mut mem = mem_512k();
        mem.set_overlay(false);
        mem.write8(0x00_0004, 0x42);
        // 512 KB wraps at $80000.
        assert_eq!(mem.read8(0x08_0004), 0x42);
    }

    #[test]
    fn rom_mirrors_256k_image() {
        let mut mem = mem_512k();
        let mut rom = vec![0u8; 256 * 1024];
        rom[0] = 0x11;
        mem.load_rom(rom);
        assert_eq!(mem.read8(0xF8_0000), 0x11);
        assert_eq!(mem.read8(0xFC_0000), 0x11);
    }

    #[test]
    fn dma_word_access() {
        let mut mem = mem_512k();
        mem.write_chip16(0x1000, 0xBEEF);
        assert_eq!(mem.read_chip16(0x1000), 0xBEEF);
        assert_eq!(mem.read8(0x1000), 0xBE);
    }

    #[test]
    fn custom_bank_tagged() {
        let mem = mem_512k();
        assert_eq!(mem.src(0xDFF000), MemSrc::Custom);
        assert_eq!(mem.src(0xBFE001), MemSrc::Cia);
    }
}

impl Memory {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.put_block(&self.chip);
        w.put_block(&self.slow);
        w.put_block(&self.fast);
        w.put_u8(self.ext_start);
        w.put_bool(self.overlay);
        w.put_bool(self.rtc_mapped);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.chip = r.get_block()?;
        if self.chip.is_empty() || !self.chip.len().is_power_of_two() {
            return Err(crate::snapshot::SnapshotError::Corrupt);
        }
        self.chip_mask = (self.chip.len() as u32 - 1) & 0x1F_FFFF;
        self.slow = r.get_block()?;
        self.fast = r.get_block()?;
        self.ext_start = r.get_u8()?;
        self.overlay = r.get_bool()?;
        self.rtc_mapped = r.get_bool()?;
        self.update_bank_map();
        Ok(())
    }
}
