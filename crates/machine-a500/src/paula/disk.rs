//! Paula disk controller.
//!
//! The controller moves bytes between the selected drive and a 6-byte
//! FIFO (rotation events, 56 DMA cycles apart) and words between the FIFO
//! and chip RAM (up to three disk DMA slots per raster line). DSKLEN uses
//! a double-write protocol: DMA arms only after two consecutive writes
//! with bit 15 set, and the second write picks the direction (bit 14) or,
//! with WORDSYNC enabled, parks the controller until the DSKSYNC pattern
//! passes under the head.
//!
//! Turbo drives bypass all of this: the whole block transfers at arming
//! time and DSKBLK follows after a fixed short delay.

#![allow(clippy::cast_possible_truncation)]

use crate::cycles::Cycle;
use crate::drive::{Drive, PRB_SEL0};
use crate::memory::Memory;

/// Controller DMA state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskState {
    /// DMA disabled.
    #[default]
    Off,
    /// Armed for read, waiting for the sync word.
    Wait,
    /// Reading: rotation fills the FIFO, DMA drains it.
    Read,
    /// Writing: DMA fills the FIFO, rotation drains it.
    Write,
    /// Write DMA finished, FIFO still draining to the drive.
    Flush,
}

/// What an arming write asks the machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    None,
    /// The selected drive is a turbo drive: transfer the block now.
    Turbo,
}

/// Interrupts requested by a DMA slot or rotation service.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskOutcome {
    pub raise_dskblk: bool,
    pub raise_dsksyn: bool,
}

pub struct DiskController {
    pub connected: [bool; 4],
    /// FIFO buffering emulated (standard mode) or skipped (simple mode).
    pub use_fifo: bool,
    /// Words transferred per granted DMA slot (drive speed acceleration).
    pub speed: u32,
    pub selected: Option<usize>,
    pub state: DiskState,
    /// Latest byte from the drive, surfaced in DSKBYTR.
    pub incoming: u8,
    pub incoming_cycle: Cycle,
    fifo: u64,
    fifo_count: u8,
    pub dsklen: u16,
    pub dsksync: u16,
    /// Shadow of CIA-B PRB.
    pub prb: u8,
    /// Sticky FIFO misuse indicator; reported once as a warning message.
    pub fifo_error: bool,
    /// FNV-1a checksum over transferred words, for diagnostics.
    checksum: u32,
}

const FNV_INIT: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

impl DiskController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: [true, false, false, false],
            use_fifo: true,
            speed: 1,
            selected: None,
            state: DiskState::Off,
            incoming: 0,
            incoming_cycle: 0,
            fifo: 0,
            fifo_count: 0,
            dsklen: 0,
            dsksync: 0x4489,
            prb: 0xFF,
            fifo_error: false,
            checksum: FNV_INIT,
        }
    }

    pub fn reset(&mut self) {
        let connected = self.connected;
        let use_fifo = self.use_fifo;
        let speed = self.speed;
        *self = Self::new();
        self.connected = connected;
        self.use_fifo = use_fifo;
        self.speed = speed;
    }

    //
    // FIFO. Six bytes deep, oldest byte at the high end.
    //

    #[must_use]
    pub fn fifo_count(&self) -> u8 {
        self.fifo_count
    }

    #[must_use]
    pub fn fifo_bits(&self) -> u64 {
        self.fifo
    }

    #[must_use]
    pub fn fifo_is_empty(&self) -> bool {
        self.fifo_count == 0
    }

    #[must_use]
    pub fn fifo_has_word(&self) -> bool {
        self.fifo_count >= 2
    }

    #[must_use]
    pub fn fifo_can_store_word(&self) -> bool {
        self.fifo_count <= 4
    }

    pub fn clear_fifo(&mut self) {
        self.fifo = 0;
        self.fifo_count = 0;
    }

    fn write_fifo(&mut self, byte: u8) {
        debug_assert!(self.fifo_count <= 6);
        if self.fifo_count == 6 {
            // Overflow drops the oldest word. In standard operation the
            // DMA slots keep this from ever happening.
            self.fifo_error = true;
            self.fifo_count -= 2;
        }
        self.fifo = (self.fifo << 8) | u64::from(byte);
        self.fifo_count += 1;
    }

    fn read_fifo(&mut self) -> u8 {
        debug_assert!(self.fifo_count > 0);
        if self.fifo_count == 0 {
            self.fifo_error = true;
            return 0;
        }
        self.fifo_count -= 1;
        (self.fifo >> (8 * u32::from(self.fifo_count))) as u8
    }

    fn read_fifo16(&mut self) -> u16 {
        let hi = self.read_fifo();
        let lo = self.read_fifo();
        u16::from(hi) << 8 | u16::from(lo)
    }

    /// The sync detector watches the newest 16 bits of the shift stream.
    #[must_use]
    pub fn sync_detected(&self) -> bool {
        self.fifo_has_word() && (self.fifo & 0xFFFF) as u16 == self.dsksync
    }

    //
    // Registers.
    //

    /// DSKLEN write. `wordsync` is ADKCON bit 10 at write time. Both writes
    /// of the arming pair go through here; all transitions clear the FIFO.
    pub fn poke_dsklen(&mut self, value: u16, wordsync: bool, turbo_drive: bool) -> ArmOutcome {
        let old = self.dsklen;
        self.dsklen = value;
        self.checksum = FNV_INIT;

        if value & 0x8000 == 0 {
            self.state = DiskState::Off;
            self.clear_fifo();
            return ArmOutcome::None;
        }
        if old & value & 0x8000 != 0 {
            self.state = if old & value & 0x4000 != 0 {
                DiskState::Write
            } else if wordsync {
                DiskState::Wait
            } else {
                DiskState::Read
            };
            self.clear_fifo();
            if turbo_drive {
                return ArmOutcome::Turbo;
            }
        }
        ArmOutcome::None
    }

    /// DSKSYNC write: latch the new pattern.
    pub fn poke_dsksync(&mut self, value: u16) {
        self.dsksync = value;
    }

    /// DSKBYTR read.
    ///
    /// Bit 15 DSKBYT: `incoming` was filled within the last rotation.
    /// Bit 14 DMAON: disk DMA enabled in both Agnus and the controller.
    /// Bit 13 DISKWRITE: mirror of DSKLEN bit 14.
    /// Bit 12 WORDEQUAL: sync pattern currently in the detector.
    #[must_use]
    pub fn peek_dskbytr(&self, clock: Cycle, agnus_dsk_dma: bool) -> u16 {
        let mut value = u16::from(self.incoming);
        if clock - self.incoming_cycle <= 7 {
            value |= 0x8000;
        }
        if agnus_dsk_dma && self.state != DiskState::Off {
            value |= 0x4000;
        }
        if self.dsklen & 0x4000 != 0 {
            value |= 0x2000;
        }
        if self.sync_detected() {
            value |= 0x1000;
        }
        value
    }

    /// Remaining block length in words.
    #[must_use]
    pub fn words_left(&self) -> u16 {
        self.dsklen & 0x3FFF
    }

    //
    // CIA-B port B.
    //

    /// Re-derive drive selection after a CIA-B PRB change. Returns true if
    /// at least one drive motor is spinning (rotation events needed).
    pub fn prb_did_change(&mut self, _old: u8, new: u8, drives: &mut [Drive; 4]) -> bool {
        self.prb = new;
        self.selected = None;
        for (n, drive) in drives.iter_mut().enumerate() {
            if !self.connected[n] {
                continue;
            }
            drive.prb_did_change(new, PRB_SEL0 << n);
            if drive.selected {
                self.selected = Some(n);
            }
        }
        drives.iter().any(|d| d.motor)
    }

    /// AND-wired drive status byte for CIA-A port A.
    #[must_use]
    pub fn drive_status(&self, drives: &[Drive; 4]) -> u8 {
        let mut status = 0xFF;
        for (n, drive) in drives.iter().enumerate() {
            if self.connected[n] {
                status &= drive.status_mask();
            }
        }
        status
    }

    //
    // Rotation service (DSK_ROTATE, every 56 DMA cycles).
    //

    /// Move one byte between the drive head and the FIFO, according to the
    /// current DMA state.
    pub fn service_rotation(&mut self, drive: &mut Drive, clock: Cycle) -> DiskOutcome {
        let mut outcome = DiskOutcome::default();
        match self.state {
            DiskState::Off => {
                // Keep the head turning so DSKBYTR sees fresh bytes.
                drive.rotate();
            }
            DiskState::Wait | DiskState::Read => {
                self.incoming = drive.read_head();
                self.incoming_cycle = clock;
                drive.rotate();
                self.write_fifo(self.incoming);
                if self.sync_detected() {
                    outcome.raise_dsksyn = true;
                    if self.state == DiskState::Wait {
                        self.state = DiskState::Read;
                        self.clear_fifo();
                    }
                }
            }
            DiskState::Write | DiskState::Flush => {
                if self.fifo_is_empty() {
                    if self.state == DiskState::Flush {
                        self.state = DiskState::Off;
                    }
                } else {
                    let byte = self.read_fifo();
                    drive.write_head(byte);
                    drive.rotate();
                }
            }
        }
        outcome
    }

    //
    // DMA slots (up to three per line).
    //

    /// Serve one granted disk DMA slot.
    pub fn perform_dma_slot(
        &mut self,
        drive: &mut Drive,
        mem: &mut Memory,
        dskpt: &mut u32,
        clock: Cycle,
    ) -> DiskOutcome {
        let mut outcome = DiskOutcome::default();
        if self.words_left() == 0 {
            return outcome;
        }
        match self.state {
            DiskState::Read => self.dma_read(drive, mem, dskpt, clock, &mut outcome),
            DiskState::Write => self.dma_write(drive, mem, dskpt, clock, &mut outcome),
            _ => {}
        }
        outcome
    }

    fn dma_read(
        &mut self,
        drive: &mut Drive,
        mem: &mut Memory,
        dskpt: &mut u32,
        clock: Cycle,
        outcome: &mut DiskOutcome,
    ) {
        if !self.fifo_has_word() {
            return;
        }
        let mut remaining = self.speed.max(1);
        loop {
            let word = self.read_fifo16();
            mem.write_chip16(*dskpt, word);
            *dskpt = dskpt.wrapping_add(2);
            self.fold_checksum(word);

            self.dsklen = (self.dsklen & 0xC000) | (self.words_left().wrapping_sub(1) & 0x3FFF);
            if self.words_left() == 0 {
                outcome.raise_dskblk = true;
                self.state = DiskState::Off;
                return;
            }

            remaining -= 1;
            if remaining == 0 {
                return;
            }
            // Accelerated transfers interleave the rotation work the event
            // handler would have done between slots.
            for _ in 0..2 {
                let o = self.service_rotation(drive, clock);
                outcome.raise_dsksyn |= o.raise_dsksyn;
            }
            if !self.fifo_has_word() {
                return;
            }
        }
    }

    fn dma_write(
        &mut self,
        drive: &mut Drive,
        mem: &mut Memory,
        dskpt: &mut u32,
        clock: Cycle,
        outcome: &mut DiskOutcome,
    ) {
        if !self.fifo_can_store_word() {
            return;
        }
        let mut remaining = self.speed.max(1);
        loop {
            let word = mem.read_chip16(*dskpt);
            *dskpt = dskpt.wrapping_add(2);
            self.fold_checksum(word);
            self.write_fifo((word >> 8) as u8);
            self.write_fifo(word as u8);

            self.dsklen = (self.dsklen & 0xC000) | (self.words_left().wrapping_sub(1) & 0x3FFF);
            if self.words_left() == 0 {
                outcome.raise_dskblk = true;
                // The block interrupt would arrive before the last bytes hit
                // the surface if we waited for FLUSH, so drain synchronously.
                while !self.fifo_is_empty() {
                    let byte = self.read_fifo();
                    drive.write_head(byte);
                    drive.rotate();
                }
                self.state = DiskState::Off;
                return;
            }

            remaining -= 1;
            if remaining == 0 {
                return;
            }
            for _ in 0..2 {
                let o = self.service_rotation(drive, clock);
                outcome.raise_dsksyn |= o.raise_dsksyn;
            }
            if !self.fifo_can_store_word() {
                return;
            }
        }
    }

    //
    // Turbo path.
    //

    /// Transfer the whole armed block at once.
    pub fn perform_turbo_dma(
        &mut self,
        drive: &mut Drive,
        mem: &mut Memory,
        dskpt: &mut u32,
    ) -> DiskOutcome {
        let mut outcome = DiskOutcome::default();
        if self.words_left() == 0 {
            return outcome;
        }
        match self.state {
            DiskState::Read | DiskState::Wait => {
                if self.state == DiskState::Wait {
                    self.align_to_sync(drive);
                }
                for _ in 0..self.words_left() {
                    let word = drive.read_head16();
                    mem.write_chip16(*dskpt, word);
                    *dskpt = dskpt.wrapping_add(2);
                    self.fold_checksum(word);
                }
            }
            DiskState::Write => {
                for _ in 0..self.words_left() {
                    let word = mem.read_chip16(*dskpt);
                    *dskpt = dskpt.wrapping_add(2);
                    drive.write_head16(word);
                    self.fold_checksum(word);
                }
            }
            _ => return outcome,
        }
        self.dsklen &= 0xC000;
        self.state = DiskState::Off;
        outcome.raise_dskblk = true;
        outcome
    }

    /// Spin the head until the sync word has just passed (turbo WORDSYNC).
    fn align_to_sync(&mut self, drive: &mut Drive) {
        let limit = drive.track_len().max(1) + 2;
        let mut shift = 0u16;
        for _ in 0..limit {
            shift = (shift << 8) | u16::from(drive.read_head());
            drive.rotate();
            if shift == self.dsksync {
                return;
            }
        }
    }

    fn fold_checksum(&mut self, word: u16) {
        self.checksum = (self.checksum ^ u32::from(word)).wrapping_mul(FNV_PRIME);
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

impl Default for DiskController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_shift_semantics() {
        let mut dc = DiskController::new();
        dc.write_fifo(0x11);
        dc.write_fifo(0x22);
        dc.write_fifo(0x33);
        assert_eq!(dc.fifo_count(), 3);
        // Newest byte sits in the low bits.
        assert_eq!(dc.fifo_bits() & 0xFF, 0x33);
        // Oldest byte comes out first.
        assert_eq!(dc.read_fifo(), 0x11);
        assert_eq!(dc.read_fifo16(), 0x2233);
        assert!(dc.fifo_is_empty());
    }

    #[test]
    fn fifo_invariants() {
        let mut dc = DiskController::new();
        for i in 0..6 {
            dc.write_fifo(i);
            assert!(dc.fifo_count() <= 6);
        }
        assert!(!dc.fifo_can_store_word());
        assert!(dc.fifo_has_word());
        // A seventh byte drops the oldest word.
        dc.write_fifo(0x66);
        assert_eq!(dc.fifo_count(), 5);
        assert!(dc.fifo_error);
    }

    #[test]
    fn double_write_arming_protocol() {
        let mut dc = DiskController::new();

        // (0x0000, 0x8000): first write disables, second is only the first
        // half of a new pair.
        dc.poke_dsklen(0x0000, false, false);
        assert_eq!(dc.state, DiskState::Off);
        dc.poke_dsklen(0x8000, false, false);
        assert_eq!(dc.state, DiskState::Off);

        // (0x8000, 0x8000) without WORDSYNC: read.
        dc.poke_dsklen(0x8000, false, false);
        assert_eq!(dc.state, DiskState::Read);

        // Same with WORDSYNC: wait for the sync mark.
        dc.poke_dsklen(0x0000, true, false);
        dc.poke_dsklen(0x8000, true, false);
        dc.poke_dsklen(0x8000, true, false);
        assert_eq!(dc.state, DiskState::Wait);

        // Write bit on both writes: write mode.
        dc.poke_dsklen(0x0000, false, false);
        dc.poke_dsklen(0xC000, false, false);
        dc.poke_dsklen(0xC010, false, false);
        assert_eq!(dc.state, DiskState::Write);
        assert_eq!(dc.words_left(), 0x10);
    }

    #[test]
    fn sync_detector_watches_stream_tail() {
        let mut dc = DiskController::new();
        dc.dsksync = 0x4489;
        dc.write_fifo(0xAA);
        dc.write_fifo(0x44);
        assert!(!dc.sync_detected());
        dc.write_fifo(0x89);
        assert!(dc.sync_detected());
    }

    #[test]
    fn wait_turns_into_read_on_sync() {
        let mut dc = DiskController::new();
        let mut drive = Drive::new(0);
        drive.insert_disk(format_adf::Adf::blank());
        dc.dsksync = 0x4489;
        dc.poke_dsklen(0x8000, true, false);
        dc.poke_dsklen(0x8000, true, false);
        assert_eq!(dc.state, DiskState::Wait);

        // A blank track starts with gap bytes, then the first sector's sync
        // words; rotation must find them.
        let mut fired = false;
        for cycle in 0..200 {
            let outcome = dc.service_rotation(&mut drive, cycle * 448);
            if outcome.raise_dsksyn {
                fired = true;
                break;
            }
        }
        assert!(fired, "sync mark never detected");
        assert_eq!(dc.state, DiskState::Read);
        assert!(dc.fifo_is_empty());
    }
}

impl DiskController {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        for &c in &self.connected {
            w.put_bool(c);
        }
        w.put_bool(self.use_fifo);
        w.put_u32(self.speed);
        w.put_u8(self.selected.map_or(0xFF, |n| n as u8));
        w.put_u8(match self.state {
            DiskState::Off => 0,
            DiskState::Wait => 1,
            DiskState::Read => 2,
            DiskState::Write => 3,
            DiskState::Flush => 4,
        });
        w.put_u8(self.incoming);
        w.put_i64(self.incoming_cycle);
        w.put_u64(self.fifo);
        w.put_u8(self.fifo_count);
        w.put_u16(self.dsklen);
        w.put_u16(self.dsksync);
        w.put_u8(self.prb);
        w.put_bool(self.fifo_error);
        w.put_u32(self.checksum);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        for c in &mut self.connected {
            *c = r.get_bool()?;
        }
        self.use_fifo = r.get_bool()?;
        self.speed = r.get_u32()?;
        self.selected = match r.get_u8()? {
            0xFF => None,
            n => Some(usize::from(n) & 3),
        };
        self.state = match r.get_u8()? {
            0 => DiskState::Off,
            1 => DiskState::Wait,
            2 => DiskState::Read,
            3 => DiskState::Write,
            4 => DiskState::Flush,
            _ => return Err(crate::snapshot::SnapshotError::Corrupt),
        };
        self.incoming = r.get_u8()?;
        self.incoming_cycle = r.get_i64()?;
        self.fifo = r.get_u64()?;
        self.fifo_count = r.get_u8()?;
        self.dsklen = r.get_u16()?;
        self.dsksync = r.get_u16()?;
        self.prb = r.get_u8()?;
        self.fifo_error = r.get_bool()?;
        self.checksum = r.get_u32()?;
        Ok(())
    }
}
