//! Agnus: master clock, beam counters, DMA pointers, and the scheduler.
//!
//! Agnus owns simulated time. `clock` advances to each served event's
//! trigger and to the CPU's target between events; every other chip clock
//! trails it. The event tables live here because Agnus is the component
//! that synchronizes everything else, and the positional scheduling calls
//! go through Agnus because only it knows where the beam is.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub mod dma;

use crate::beam::{
    beam_to_offset, cycles_in_frame, lines_in_frame, Beam, CYCLES_PER_LINE, HPOS_MAX,
};
use crate::custom_regs;
use crate::cycles::{Cycle, NEVER};
use crate::events::{EventId, PrimSlot, Scheduler, SecSlot};

/// Sprite DMA sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SprDmaState {
    /// Fetch SPRxPOS/SPRxCTL on the next granted slot pair.
    #[default]
    FetchCtl,
    /// Control words loaded; waiting for the start line.
    Wait,
    /// Between vstart and vstop: fetch SPRxDATA/SPRxDATB each line.
    Active,
    /// Finished for this frame.
    Off,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpriteUnit {
    pub state: SprDmaState,
    pub vstart: u16,
    pub vstop: u16,
}

pub struct Agnus {
    /// Master clock. Monotonic; advanced by the drain loop.
    pub clock: Cycle,
    pub scheduler: Scheduler,

    /// Completed frame counter.
    pub frame: i64,
    /// Current raster line.
    pub pos_v: u16,
    /// Master cycle at `(pos_v, 0)`.
    pub line_start: Cycle,
    /// Master cycle at `(0, 0)` of the current frame.
    pub frame_start: Cycle,
    /// Long frame flag; alternates in interlace.
    pub lof: bool,

    pub dmacon: u16,
    pub diwstrt: u16,
    pub diwstop: u16,
    pub ddfstrt: u16,
    pub ddfstop: u16,

    pub dskpt: u32,
    pub bpl_pt: [u32; 6],
    pub bpl1mod: u16,
    pub bpl2mod: u16,
    pub spr_pt: [u32; 8],
    pub sprite: [SpriteUnit; 8],

    /// Active bitplane count and resolution, latched from BPLCON0.
    pub num_bpl: u8,
    pub hires: bool,

    /// Per-line DMA dispatch table: the event owning each slot, plus the
    /// chained index of the next owned slot.
    pub dma_event: [EventId; 227],
    pub next_dma: [u16; 227],
}

impl Agnus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: 0,
            scheduler: Scheduler::new(),
            frame: 0,
            pos_v: 0,
            line_start: 0,
            frame_start: 0,
            lof: true,
            dmacon: 0,
            diwstrt: 0x2C81,
            diwstop: 0x2CC1,
            ddfstrt: 0x0038,
            ddfstop: 0x00D0,
            dskpt: 0,
            bpl_pt: [0; 6],
            bpl1mod: 0,
            bpl2mod: 0,
            spr_pt: [0; 8],
            sprite: [SpriteUnit::default(); 8],
            num_bpl: 0,
            hires: false,
            dma_event: [EventId::None; 227],
            next_dma: [dma::NO_SLOT; 227],
        }
    }

    //
    // Beam mapping.
    //

    /// Horizontal position of the master clock within the current line.
    /// Clamped at both ends: HSYNC housekeeping advances `line_start` a
    /// few master cycles before the line boundary is reached.
    #[must_use]
    pub fn hpos(&self) -> u16 {
        (((self.clock - self.line_start).max(0) / 8) as u16).min(HPOS_MAX)
    }

    #[must_use]
    pub fn beam(&self) -> Beam {
        Beam::new(self.pos_v, self.hpos())
    }

    /// Absolute master cycle of a beam position in the current frame.
    #[must_use]
    pub fn beam_to_cycle(&self, beam: Beam) -> Cycle {
        self.frame_start + beam_to_offset(beam)
    }

    /// Beam position of an absolute master cycle of the current frame.
    #[must_use]
    pub fn cycle_to_beam(&self, cycle: Cycle) -> Beam {
        crate::beam::offset_to_beam(cycle - self.frame_start)
    }

    /// Advance to the next line. Returns true when a new frame starts.
    /// `lace` controls whether LOF alternates.
    pub fn advance_line(&mut self, lace: bool) -> bool {
        self.pos_v += 1;
        self.line_start += CYCLES_PER_LINE;
        if self.pos_v >= lines_in_frame(self.lof) {
            self.pos_v = 0;
            self.frame += 1;
            self.frame_start = self.line_start;
            if lace {
                self.lof = !self.lof;
            }
            true
        } else {
            false
        }
    }

    //
    // Scheduling wrappers. Past cycles are a programming error; release
    // builds clamp to now.
    //

    fn sane(&self, cycle: Cycle) -> Cycle {
        debug_assert!(
            cycle >= self.clock || cycle == NEVER,
            "event scheduled in the past ({cycle} < {})",
            self.clock
        );
        cycle.max(self.clock)
    }

    pub fn schedule_abs(&mut self, slot: PrimSlot, cycle: Cycle, id: EventId) {
        let cycle = self.sane(cycle);
        self.scheduler.schedule_abs(slot, cycle, id);
    }

    pub fn schedule_rel(&mut self, slot: PrimSlot, delta: Cycle, id: EventId) {
        let cycle = self.clock + delta;
        self.scheduler.schedule_abs(slot, cycle, id);
    }

    /// Schedule at a beam position, rolling into the next frame when the
    /// position already passed.
    pub fn schedule_pos(&mut self, slot: PrimSlot, beam: Beam, id: EventId) {
        let mut cycle = self.beam_to_cycle(beam);
        if cycle < self.clock {
            cycle += cycles_in_frame(self.lof);
        }
        self.scheduler.schedule_abs(slot, cycle, id);
    }

    pub fn reschedule_abs(&mut self, slot: PrimSlot, cycle: Cycle) {
        let cycle = self.sane(cycle);
        self.scheduler.reschedule_abs(slot, cycle);
    }

    pub fn reschedule_rel(&mut self, slot: PrimSlot, delta: Cycle) {
        let cycle = self.clock + delta;
        self.scheduler.reschedule_abs(slot, cycle);
    }

    pub fn sec_schedule_abs(&mut self, slot: SecSlot, cycle: Cycle, id: EventId, data: i64) {
        let cycle = self.sane(cycle);
        self.scheduler.sec_schedule_abs(slot, cycle, id, data);
    }

    pub fn sec_schedule_rel(&mut self, slot: SecSlot, delta: Cycle, id: EventId, data: i64) {
        let cycle = self.clock + delta;
        self.scheduler.sec_schedule_abs(slot, cycle, id, data);
    }

    //
    // DMA control.
    //

    pub fn write_dmacon(&mut self, value: u16) {
        custom_regs::set_clr_write(&mut self.dmacon, value);
    }

    #[must_use]
    pub fn dma_enabled(&self) -> bool {
        self.dmacon & custom_regs::DMAF_DMAEN != 0
    }

    /// Master enable plus the given channel bit.
    #[must_use]
    pub fn channel_enabled(&self, flag: u16) -> bool {
        self.dma_enabled() && self.dmacon & flag != 0
    }

    /// Latch bitplane count and resolution from a BPLCON0 write.
    pub fn set_bplcon0(&mut self, value: u16) {
        self.num_bpl = ((value >> 12) & 7).min(6) as u8;
        self.hires = value & 0x8000 != 0;
    }

    /// Vertical display window check for bitplane DMA.
    #[must_use]
    pub fn in_bpl_dma_line(&self, v: u16) -> bool {
        let vstart = self.diwstrt >> 8;
        let mut vstop = self.diwstop >> 8;
        // DIWSTOP V8 is the complement of V7.
        if vstop & 0x80 == 0 {
            vstop |= 0x100;
        }
        v >= vstart && v < vstop
    }

    //
    // Register reads.
    //

    #[must_use]
    pub fn read_vposr(&self) -> u16 {
        let lof = if self.lof { 0x8000 } else { 0 };
        // OCS Agnus identifies itself with zero id bits.
        lof | ((self.pos_v >> 8) & 1)
    }

    #[must_use]
    pub fn read_vhposr(&self) -> u16 {
        ((self.pos_v & 0xFF) << 8) | (self.hpos() & 0xFF)
    }

    //
    // Pointer register helpers.
    //

    pub fn set_ptr_hi(ptr: &mut u32, value: u16) {
        *ptr = (*ptr & 0x0000_FFFF) | (u32::from(value & 0x001F) << 16);
    }

    pub fn set_ptr_lo(ptr: &mut u32, value: u16) {
        *ptr = (*ptr & 0xFFFF_0000) | u32::from(value & 0xFFFE);
    }

    /// Add the bitplane modulos at the end of a fetch line.
    pub fn apply_bpl_modulos(&mut self) {
        let mod1 = i64::from(self.bpl1mod as i16);
        let mod2 = i64::from(self.bpl2mod as i16);
        for plane in 0..usize::from(self.num_bpl) {
            let m = if plane % 2 == 0 { mod1 } else { mod2 };
            self.bpl_pt[plane] = (i64::from(self.bpl_pt[plane]) + m) as u32;
        }
    }
}

impl Default for Agnus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::VPOS_CNT_LONG;

    #[test]
    fn beam_cycle_round_trip() {
        let mut agnus = Agnus::new();
        agnus.frame_start = 10_000 * 8;
        agnus.clock = agnus.frame_start;
        for beam in [Beam::new(0, 0), Beam::new(100, 50), Beam::new(312, 226)] {
            assert_eq!(agnus.cycle_to_beam(agnus.beam_to_cycle(beam)), beam);
        }
    }

    #[test]
    fn hpos_follows_clock() {
        let mut agnus = Agnus::new();
        agnus.line_start = 0;
        agnus.clock = 8 * 20 + 5;
        assert_eq!(agnus.hpos(), 20);
    }

    #[test]
    fn advance_line_wraps_frame() {
        let mut agnus = Agnus::new();
        for _ in 0..u32::from(VPOS_CNT_LONG) - 1 {
            assert!(!agnus.advance_line(false));
        }
        assert!(agnus.advance_line(false));
        assert_eq!(agnus.pos_v, 0);
        assert_eq!(agnus.frame, 1);
        // Non-interlaced PAL stays on long frames.
        assert!(agnus.lof);
    }

    #[test]
    fn interlace_alternates_fields() {
        let mut agnus = Agnus::new();
        let mut frames = 0;
        while frames < 2 {
            if agnus.advance_line(true) {
                frames += 1;
            }
        }
        assert!(agnus.lof);
        // 313 + 312 lines for the two fields.
        assert_eq!(agnus.frame_start, (313 + 312) * CYCLES_PER_LINE);
    }

    #[test]
    fn schedule_pos_rolls_into_next_frame() {
        let mut agnus = Agnus::new();
        agnus.clock = agnus.beam_to_cycle(Beam::new(100, 0));
        agnus.schedule_pos(PrimSlot::Cop, Beam::new(50, 0), EventId::CopWait);
        let trigger = agnus.scheduler.primary[PrimSlot::Cop as usize].trigger;
        assert_eq!(
            trigger,
            beam_to_offset(Beam::new(50, 0)) + cycles_in_frame(true)
        );
    }

    #[test]
    fn display_window_vertical_gate() {
        let agnus = Agnus::new();
        // Defaults: $2C..$12C (V8 inferred from the complement rule).
        assert!(!agnus.in_bpl_dma_line(0x2B));
        assert!(agnus.in_bpl_dma_line(0x2C));
        assert!(agnus.in_bpl_dma_line(0xFF));
        assert!(agnus.in_bpl_dma_line(0x12B));
        assert!(!agnus.in_bpl_dma_line(0x12C));
    }
}

impl Agnus {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.put_i64(self.clock);
        w.put_i64(self.frame);
        w.put_u16(self.pos_v);
        w.put_i64(self.line_start);
        w.put_i64(self.frame_start);
        w.put_bool(self.lof);
        w.put_u16(self.dmacon);
        w.put_u16(self.diwstrt);
        w.put_u16(self.diwstop);
        w.put_u16(self.ddfstrt);
        w.put_u16(self.ddfstop);
        w.put_u32(self.dskpt);
        for &pt in &self.bpl_pt {
            w.put_u32(pt);
        }
        w.put_u16(self.bpl1mod);
        w.put_u16(self.bpl2mod);
        for &pt in &self.spr_pt {
            w.put_u32(pt);
        }
        for unit in &self.sprite {
            w.put_u8(match unit.state {
                SprDmaState::FetchCtl => 0,
                SprDmaState::Wait => 1,
                SprDmaState::Active => 2,
                SprDmaState::Off => 3,
            });
            w.put_u16(unit.vstart);
            w.put_u16(unit.vstop);
        }
        w.put_u8(self.num_bpl);
        w.put_bool(self.hires);
        self.scheduler.save_state(w);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.clock = r.get_i64()?;
        self.frame = r.get_i64()?;
        self.pos_v = r.get_u16()?;
        self.line_start = r.get_i64()?;
        self.frame_start = r.get_i64()?;
        self.lof = r.get_bool()?;
        self.dmacon = r.get_u16()?;
        self.diwstrt = r.get_u16()?;
        self.diwstop = r.get_u16()?;
        self.ddfstrt = r.get_u16()?;
        self.ddfstop = r.get_u16()?;
        self.dskpt = r.get_u32()?;
        for pt in &mut self.bpl_pt {
            *pt = r.get_u32()?;
        }
        self.bpl1mod = r.get_u16()?;
        self.bpl2mod = r.get_u16()?;
        for pt in &mut self.spr_pt {
            *pt = r.get_u32()?;
        }
        for unit in &mut self.sprite {
            unit.state = match r.get_u8()? {
                0 => SprDmaState::FetchCtl,
                1 => SprDmaState::Wait,
                2 => SprDmaState::Active,
                3 => SprDmaState::Off,
                _ => return Err(crate::snapshot::SnapshotError::Corrupt),
            };
            unit.vstart = r.get_u16()?;
            unit.vstop = r.get_u16()?;
        }
        self.num_bpl = r.get_u8()?;
        self.hires = r.get_bool()?;
        self.scheduler.load_state(r)
    }
}
