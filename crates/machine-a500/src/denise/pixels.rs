//! Colour synthesis and the framebuffers.
//!
//! The colorizer turns one line of colour indices into packed RGBA pixels,
//! replaying the colour-register change log at pixel resolution so mid-line
//! palette writes land exactly where the beam was. HAM resolution happens
//! here too, because the hold register works on the RGB value of the
//! previous pixel.
//!
//! Four framebuffers exist: long/short field x working/stable. The
//! emulation thread owns the working pair; the host reads the stable pair
//! under the shared lock. The pairs swap at vertical blank.

#![allow(clippy::cast_possible_truncation)]

use std::sync::{Arc, Mutex};

use crate::change_log::ChangeRecorder;
use crate::cycles::Cycle;

/// Horizontal framebuffer resolution: four hires pixels per DMA cycle.
pub const HPIXELS: usize = 908;
/// Vertical resolution: one row per line of a long frame.
pub const VPIXELS: usize = 313;
/// Line buffers carry some slack for scroll delays.
pub const BUF_SLACK: usize = 64;

/// One video field.
pub struct FrameBuffer {
    pub data: Vec<u32>,
    pub long_frame: bool,
    /// Frame counter value at the last swap.
    pub frame_nr: i64,
}

impl FrameBuffer {
    fn new(long_frame: bool) -> Self {
        Self {
            data: vec![0xFF00_0000; HPIXELS * VPIXELS],
            long_frame,
            frame_nr: 0,
        }
    }
}

/// The host-visible stable buffers, guarded by the shared access lock.
pub struct StableBuffers {
    pub long: FrameBuffer,
    pub short: FrameBuffer,
    /// Number of swaps performed since power-on.
    pub swap_count: u64,
}

pub struct PixelEngine {
    /// Colour registers as of the start of the current line.
    palette: [u16; 32],
    /// RGBA lookup: 32 base colours + 32 EHB half-brights.
    rgba: [u32; 64],
    /// Colour writes of the current line, replayed during colorize.
    pub color_changes: ChangeRecorder<64>,
    working_long: FrameBuffer,
    working_short: FrameBuffer,
    stable: Arc<Mutex<StableBuffers>>,
    /// HAM hold register, carried across pixels within a line.
    ham_hold: u16,
}

impl PixelEngine {
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Self {
            palette: [0; 32],
            rgba: [0; 64],
            color_changes: ChangeRecorder::new(),
            working_long: FrameBuffer::new(true),
            working_short: FrameBuffer::new(false),
            stable: Arc::new(Mutex::new(StableBuffers {
                long: FrameBuffer::new(true),
                short: FrameBuffer::new(false),
                swap_count: 0,
            })),
            ham_hold: 0,
        };
        engine.rebuild_rgba();
        engine
    }

    pub fn reset(&mut self) {
        self.palette = [0; 32];
        self.color_changes.clear();
        self.ham_hold = 0;
        self.rebuild_rgba();
    }

    /// Handle of the stable buffers for the host side.
    #[must_use]
    pub fn stable_handle(&self) -> Arc<Mutex<StableBuffers>> {
        Arc::clone(&self.stable)
    }

    /// Record a colour write for sub-line replay.
    pub fn record_color(&mut self, clock: Cycle, index: u16, value: u16) {
        self.color_changes.record(clock, index, value & 0x0FFF);
    }

    /// The colour register value as of the last flushed line.
    #[must_use]
    pub fn color(&self, index: usize) -> u16 {
        self.palette[index & 31]
    }

    fn rebuild_rgba(&mut self) {
        for i in 0..32 {
            self.rebuild_rgba_entry(i);
        }
    }

    fn rebuild_rgba_entry(&mut self, i: usize) {
        let rgb = self.palette[i];
        self.rgba[i] = rgb12_to_rgba(rgb);
        // EHB shadow: each channel halved.
        self.rgba[i + 32] = rgb12_to_rgba((rgb >> 1) & 0x0777);
    }

    /// Colorize one line of indices into the working buffer for row `v`.
    ///
    /// `line_start` converts change-log triggers into pixel positions:
    /// one DMA cycle is four hires pixels.
    pub fn colorize_line(
        &mut self,
        v: u16,
        lof: bool,
        line_start: Cycle,
        indices: &[u8],
        ham: bool,
        ehb: bool,
    ) {
        let row = usize::from(v).min(VPIXELS - 1) * HPIXELS;

        // Collect the pixel positions of the recorded colour writes.
        let mut pending = 0usize;
        let changes = self.color_changes.entries().to_vec();
        self.ham_hold = self.palette[0];

        for x in 0..HPIXELS {
            while pending < changes.len() {
                let change = changes[pending];
                let pixel = ((change.trigger - line_start) / 2).max(0) as usize;
                if pixel > x {
                    break;
                }
                let index = usize::from(change.addr);
                self.palette[index & 31] = change.value;
                self.rebuild_rgba_entry(index & 31);
                pending += 1;
            }

            let index = indices.get(x).copied().unwrap_or(0);
            let rgba = if ham {
                let rgb = self.ham_resolve(index);
                rgb12_to_rgba(rgb)
            } else if ehb {
                self.rgba[usize::from(index) & 63]
            } else {
                self.rgba[usize::from(index) & 31]
            };
            let buffer = if lof {
                &mut self.working_long
            } else {
                &mut self.working_short
            };
            buffer.data[row + x] = rgba;
        }

        // Apply any changes recorded after the last visible pixel.
        while pending < changes.len() {
            let change = changes[pending];
            let index = usize::from(change.addr);
            self.palette[index & 31] = change.value;
            self.rebuild_rgba_entry(index & 31);
            pending += 1;
        }
        self.color_changes.clear();
    }

    /// HAM6: bits 5-4 select the operation, bits 3-0 the payload.
    fn ham_resolve(&mut self, index: u8) -> u16 {
        let payload = u16::from(index & 0x0F);
        match (index >> 4) & 3 {
            0 => self.ham_hold = self.palette[usize::from(index) & 15],
            1 => self.ham_hold = (self.ham_hold & 0xFF0) | payload,
            2 => self.ham_hold = (self.ham_hold & 0x0FF) | (payload << 8),
            _ => self.ham_hold = (self.ham_hold & 0xF0F) | (payload << 4),
        }
        self.ham_hold
    }

    /// Swap the field's working and stable buffers (vertical blank).
    /// The lock is held only for the pointer exchange.
    pub fn swap_buffers(&mut self, lof: bool, frame_nr: i64) {
        let mut stable = match self.stable.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lof {
            self.working_long.frame_nr = frame_nr;
            std::mem::swap(&mut self.working_long, &mut stable.long);
        } else {
            self.working_short.frame_nr = frame_nr;
            std::mem::swap(&mut self.working_short, &mut stable.short);
        }
        stable.swap_count += 1;
    }

    /// Direct view of the working buffer for the given field (tests).
    #[must_use]
    pub fn working(&self, lof: bool) -> &FrameBuffer {
        if lof {
            &self.working_long
        } else {
            &self.working_short
        }
    }
}

impl Default for PixelEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a 12-bit OCS colour to packed RGBA (alpha high).
#[must_use]
pub fn rgb12_to_rgba(rgb: u16) -> u32 {
    let r = u32::from((rgb >> 8) & 0xF);
    let g = u32::from((rgb >> 4) & 0xF);
    let b = u32::from(rgb & 0xF);
    0xFF00_0000 | (r * 17) << 16 | (g * 17) << 8 | b * 17
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_expansion() {
        assert_eq!(rgb12_to_rgba(0x0FFF), 0xFFFF_FFFF);
        assert_eq!(rgb12_to_rgba(0x0F00), 0xFFFF_0000);
        assert_eq!(rgb12_to_rgba(0x0080), 0xFF00_8800);
    }

    #[test]
    fn color_change_applies_mid_line() {
        let mut engine = PixelEngine::new();
        let indices = vec![0u8; HPIXELS];
        // Change COLOR00 at DMA cycle 100 of the line.
        engine.record_color(100 * 8, 0, 0x0F00);
        engine.colorize_line(10, true, 0, &indices, false, false);
        let row = &engine.working(true).data[10 * HPIXELS..11 * HPIXELS];
        assert_eq!(row[0], 0xFF00_0000);
        assert_eq!(row[399], 0xFF00_0000);
        assert_eq!(row[400], 0xFFFF_0000);
        assert_eq!(row[HPIXELS - 1], 0xFFFF_0000);
        // The palette carries the final value into the next line.
        assert_eq!(engine.color(0), 0x0F00);
    }

    #[test]
    fn ham_load_and_modify() {
        let mut engine = PixelEngine::new();
        engine.record_color(0, 5, 0x0123);
        let mut indices = vec![0u8; HPIXELS];
        indices[0] = 0x05; // load colour 5
        indices[1] = 0x2F; // modify red to $F
        indices[2] = 0x3A; // modify green to $A
        indices[3] = 0x17; // modify blue to $7
        engine.colorize_line(0, true, 0, &indices, true, false);
        let row = &engine.working(true).data[..4];
        assert_eq!(row[0], rgb12_to_rgba(0x0123));
        assert_eq!(row[1], rgb12_to_rgba(0x0F23));
        assert_eq!(row[2], rgb12_to_rgba(0x0FA3));
        assert_eq!(row[3], rgb12_to_rgba(0x0FA7));
    }

    #[test]
    fn ehb_halves_brightness() {
        let mut engine = PixelEngine::new();
        engine.record_color(0, 1, 0x0EEE);
        let mut indices = vec![0u8; HPIXELS];
        indices[0] = 1;
        indices[1] = 33; // EHB shadow of colour 1
        engine.colorize_line(0, true, 0, &indices, false, true);
        let row = &engine.working(true).data[..2];
        assert_eq!(row[0], rgb12_to_rgba(0x0EEE));
        assert_eq!(row[1], rgb12_to_rgba(0x0777));
    }

    #[test]
    fn swap_alternates_fields() {
        let mut engine = PixelEngine::new();
        let stable = engine.stable_handle();
        engine.swap_buffers(true, 1);
        engine.swap_buffers(false, 2);
        let guard = stable.lock().unwrap();
        assert_eq!(guard.swap_count, 2);
        assert_eq!(guard.long.frame_nr, 1);
        assert_eq!(guard.short.frame_nr, 2);
    }
}

impl PixelEngine {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        for &c in &self.palette {
            w.put_u16(c);
        }
        w.put_u32(self.color_changes.len() as u32);
        for change in self.color_changes.entries() {
            w.put_i64(change.trigger);
            w.put_u16(change.addr);
            w.put_u16(change.value);
        }
        w.put_u16(self.ham_hold);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        for c in &mut self.palette {
            *c = r.get_u16()?;
        }
        self.color_changes.clear();
        let count = r.get_u32()?;
        for _ in 0..count {
            let trigger = r.get_i64()?;
            let addr = r.get_u16()?;
            let value = r.get_u16()?;
            self.color_changes.record(trigger, addr, value);
        }
        self.ham_hold = r.get_u16()?;
        self.rebuild_rgba();
        Ok(())
    }
}
