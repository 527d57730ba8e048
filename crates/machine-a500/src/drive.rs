//! Floppy drive mechanism.
//!
//! Control lines arrive through CIA-B port B (select, motor, step,
//! direction, side); status lines leave through CIA-A port A (change,
//! write protect, track 0, ready). The head sits over one byte of the
//! current track's MFM stream and advances by one byte per rotation event.
//!
//! The track buffer is synthesized from the ADF when the head reaches a
//! new track and decoded back into the image after writes.

#![allow(clippy::cast_possible_truncation)]

use format_adf::Adf;

/// PRB control bits (all active low).
pub const PRB_STEP: u8 = 0x01;
pub const PRB_DIR: u8 = 0x02;
pub const PRB_SIDE: u8 = 0x04;
pub const PRB_SEL0: u8 = 0x08;
pub const PRB_MTR: u8 = 0x80;

/// PRA status bits (all active low).
pub const PRA_CHNG: u8 = 0x04;
pub const PRA_WPROT: u8 = 0x08;
pub const PRA_TK0: u8 = 0x10;
pub const PRA_RDY: u8 = 0x20;

pub const CYLINDERS: u8 = 80;

pub struct Drive {
    pub nr: usize,
    /// Turbo drives transfer whole blocks at DSKLEN arming time.
    pub turbo: bool,
    disk: Option<Adf>,
    pub motor: bool,
    pub selected: bool,
    cylinder: u8,
    side: u8,
    /// Byte offset of the head within the track stream.
    offset: usize,
    /// MFM stream of the track under the head.
    track: Vec<u8>,
    /// Which track the buffer holds (may lag cylinder/side until reload).
    track_of: usize,
    track_dirty: bool,
    prev_step_low: bool,
    write_protected: bool,
    /// /CHNG latch: asserted after eject, cleared by a step with a disk in.
    disk_changed: bool,
}

impl Drive {
    #[must_use]
    pub fn new(nr: usize) -> Self {
        Self {
            nr,
            turbo: false,
            disk: None,
            motor: false,
            selected: false,
            cylinder: 0,
            side: 0,
            offset: 0,
            track: Vec::new(),
            track_of: 0,
            track_dirty: false,
            prev_step_low: false,
            write_protected: false,
            disk_changed: true,
        }
    }

    pub fn reset(&mut self) {
        self.motor = false;
        self.selected = false;
        self.cylinder = 0;
        self.side = 0;
        self.offset = 0;
        self.prev_step_low = false;
        self.load_track();
    }

    #[must_use]
    pub fn has_disk(&self) -> bool {
        self.disk.is_some()
    }

    #[must_use]
    pub fn cylinder(&self) -> u8 {
        self.cylinder
    }

    #[must_use]
    pub fn side(&self) -> u8 {
        self.side
    }

    #[must_use]
    pub fn head_offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn track_len(&self) -> usize {
        self.track.len()
    }

    pub fn set_write_protected(&mut self, value: bool) {
        self.write_protected = value;
    }

    /// Insert a disk. The /CHNG latch stays asserted until the next head
    /// step, which is how the system software detects the new medium.
    pub fn insert_disk(&mut self, disk: Adf) {
        self.disk = Some(disk);
        self.offset = 0;
        self.load_track();
    }

    /// Remove the disk, folding pending writes back into the image first.
    pub fn eject_disk(&mut self) -> Option<Adf> {
        self.flush_track();
        self.track.clear();
        self.disk_changed = true;
        self.disk.take()
    }

    fn track_index(&self) -> usize {
        usize::from(self.cylinder) * 2 + usize::from(self.side)
    }

    fn load_track(&mut self) {
        self.flush_track();
        self.track_of = self.track_index();
        self.track = match &self.disk {
            Some(adf) => adf.encode_track(self.track_of),
            None => Vec::new(),
        };
        if self.offset >= self.track.len() {
            self.offset = 0;
        }
    }

    /// Fold pending head writes back into the image. Uses the index the
    /// buffer was loaded for, not the current head position.
    fn flush_track(&mut self) {
        if !self.track_dirty {
            return;
        }
        self.track_dirty = false;
        let stream = std::mem::take(&mut self.track);
        if let Some(adf) = &mut self.disk {
            adf.decode_track(self.track_of, &stream);
        }
        self.track = stream;
    }

    /// The byte under the head.
    #[must_use]
    pub fn read_head(&self) -> u8 {
        if self.track.is_empty() {
            0xFF
        } else {
            self.track[self.offset]
        }
    }

    /// Two bytes under the head (turbo transfers).
    pub fn read_head16(&mut self) -> u16 {
        let hi = self.read_head();
        self.rotate();
        let lo = self.read_head();
        self.rotate();
        u16::from(hi) << 8 | u16::from(lo)
    }

    pub fn write_head(&mut self, value: u8) {
        if self.track.is_empty() || self.write_protected {
            return;
        }
        self.track[self.offset] = value;
        self.track_dirty = true;
    }

    pub fn write_head16(&mut self, value: u16) {
        self.write_head((value >> 8) as u8);
        self.rotate();
        self.write_head(value as u8);
        self.rotate();
    }

    /// Advance the head one byte; wraps at the end of the track.
    pub fn rotate(&mut self) {
        if self.track.is_empty() {
            return;
        }
        self.offset += 1;
        if self.offset >= self.track.len() {
            self.offset = 0;
        }
    }

    /// Rewind the head to the start of the track (DMA arming behavior).
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Apply a CIA-B PRB value. `sel_bit` is this drive's select line.
    pub fn prb_did_change(&mut self, prb: u8, sel_bit: u8) {
        self.selected = prb & sel_bit == 0;
        if self.selected {
            // Motor latches from /MTR while selected.
            self.motor = prb & PRB_MTR == 0;
        }

        let new_side = if prb & PRB_SIDE == 0 { 1 } else { 0 };
        if new_side != self.side {
            self.side = new_side;
            self.load_track();
        }

        // Head steps on the falling edge of /STEP while selected.
        let step_low = prb & PRB_STEP == 0;
        if self.selected && step_low && !self.prev_step_low {
            if prb & PRB_DIR == 0 {
                if self.cylinder < CYLINDERS - 1 {
                    self.cylinder += 1;
                }
            } else if self.cylinder > 0 {
                self.cylinder -= 1;
            }
            if self.disk.is_some() {
                self.disk_changed = false;
            }
            self.load_track();
        }
        self.prev_step_low = step_low;
    }

    /// Status byte contribution for CIA-A port A (active low, AND-wired
    /// across drives).
    #[must_use]
    pub fn status_mask(&self) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        let mut status = 0xFF;
        if self.disk_changed {
            status &= !PRA_CHNG;
        }
        if self.write_protected {
            status &= !PRA_WPROT;
        }
        if self.cylinder == 0 {
            status &= !PRA_TK0;
        }
        if self.motor {
            status &= !PRA_RDY;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_prb(step: bool, inward: bool, motor: bool) -> u8 {
        let mut prb = 0xFFu8;
        prb &= !PRB_SEL0;
        if step {
            prb &= !PRB_STEP;
        }
        if inward {
            prb &= !PRB_DIR;
        }
        if motor {
            prb &= !PRB_MTR;
        }
        prb
    }

    #[test]
    fn step_moves_head_within_bounds() {
        let mut drive = Drive::new(0);
        drive.prb_did_change(select_prb(false, true, true), PRB_SEL0);
        drive.prb_did_change(select_prb(true, true, true), PRB_SEL0);
        assert_eq!(drive.cylinder(), 1);
        // Held low: no second step without an edge.
        drive.prb_did_change(select_prb(true, true, true), PRB_SEL0);
        assert_eq!(drive.cylinder(), 1);
        // Step outward twice: clamps at zero.
        for _ in 0..2 {
            drive.prb_did_change(select_prb(false, false, true), PRB_SEL0);
            drive.prb_did_change(select_prb(true, false, true), PRB_SEL0);
        }
        assert_eq!(drive.cylinder(), 0);
    }

    #[test]
    fn motor_latches_only_while_selected() {
        let mut drive = Drive::new(0);
        drive.prb_did_change(select_prb(false, false, true), PRB_SEL0);
        assert!(drive.motor);
        // Deselect with motor bit high: motor state stays.
        drive.prb_did_change(0xFF, PRB_SEL0);
        assert!(drive.motor);
        assert!(!drive.selected);
    }

    #[test]
    fn head_rotates_over_encoded_track() {
        let mut drive = Drive::new(0);
        drive.insert_disk(Adf::blank());
        let len = drive.track_len();
        assert_eq!(len, format_adf::mfm::TRACK_BYTES);
        for _ in 0..len {
            drive.rotate();
        }
        assert_eq!(drive.head_offset(), 0);
    }

    #[test]
    fn change_flag_cleared_by_step_with_disk() {
        let mut drive = Drive::new(0);
        drive.prb_did_change(select_prb(false, true, true), PRB_SEL0);
        assert_eq!(drive.status_mask() & PRA_CHNG, 0);
        drive.insert_disk(Adf::blank());
        drive.eject_disk();
        drive.insert_disk(Adf::blank());
        assert_eq!(drive.status_mask() & PRA_CHNG, 0);
        drive.prb_did_change(select_prb(true, true, true), PRB_SEL0);
        assert_ne!(drive.status_mask() & PRA_CHNG, 0);
    }

    #[test]
    fn written_track_lands_in_image_on_eject() {
        let mut drive = Drive::new(0);
        let mut adf = Adf::blank();
        // Mark sector 0 of track 0 in the source image.
        let marked = [0xE7u8; format_adf::SECTOR_BYTES];
        adf.put_sector(0, 0, &marked).unwrap();
        drive.insert_disk(adf);

        // Overwrite the whole track stream with a re-encoding of itself
        // (byte-by-byte through the head).
        let stream = drive.disk.as_ref().unwrap().encode_track(0);
        for byte in stream {
            drive.write_head(byte);
            drive.rotate();
        }
        let disk = drive.eject_disk().unwrap();
        assert_eq!(disk.sector(0, 0).unwrap(), &marked);
        assert!(disk.is_modified());
    }
}

impl Drive {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.put_bool(self.turbo);
        w.put_bool(self.motor);
        w.put_bool(self.selected);
        w.put_u8(self.cylinder);
        w.put_u8(self.side);
        w.put_u32(self.offset as u32);
        w.put_u32(self.track_of as u32);
        w.put_bool(self.track_dirty);
        w.put_bool(self.prev_step_low);
        w.put_bool(self.write_protected);
        w.put_bool(self.disk_changed);
        match &self.disk {
            Some(adf) => {
                w.put_bool(true);
                w.put_block(adf.data());
            }
            None => w.put_bool(false),
        }
        // The dirty track stream travels too; the decoded image alone
        // would lose bytes written since the last flush.
        w.put_block(&self.track);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.turbo = r.get_bool()?;
        self.motor = r.get_bool()?;
        self.selected = r.get_bool()?;
        self.cylinder = r.get_u8()?;
        self.side = r.get_u8()?;
        self.offset = r.get_u32()? as usize;
        self.track_of = r.get_u32()? as usize;
        self.track_dirty = r.get_bool()?;
        self.prev_step_low = r.get_bool()?;
        self.write_protected = r.get_bool()?;
        self.disk_changed = r.get_bool()?;
        self.disk = if r.get_bool()? {
            Some(
                Adf::from_bytes(r.get_block()?)
                    .map_err(|_| crate::snapshot::SnapshotError::Corrupt)?,
            )
        } else {
            None
        };
        self.track = r.get_block()?;
        if self.offset >= self.track.len() && !self.track.is_empty() {
            self.offset = 0;
        }
        Ok(())
    }
}
