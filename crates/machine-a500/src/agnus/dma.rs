//! The per-line DMA slot table.
//!
//! Every raster line has 227 slots. The fixed region claims refresh, disk,
//! audio, and sprite slots; the variable region carries bitplane fetches
//! inside the display data fetch window. The table is rebuilt at the start
//! of each line (and whenever DMACON or the fetch window registers change
//! mid-line) and drives the DMA dispatcher slot: after serving the event
//! at slot `h`, the dispatcher chains to `next_dma[h]`.
//!
//! Slot priority is fixed in the table layout itself: refresh > disk >
//! audio > sprite > bitplane. Copper and Blitter run from their own event
//! slots on even cycles the table leaves free, and the CPU takes whatever
//! is left, stalling one colour clock when its slot is claimed.

use super::Agnus;
use crate::beam::HPOS_CNT;
use crate::custom_regs;
use crate::events::EventId;

/// Chain terminator for `next_dma`.
pub const NO_SLOT: u16 = 0xFFFF;

/// Memory-refresh slots; never available to anyone else.
pub const REFRESH_SLOTS: [u16; 4] = [0x01, 0x02, 0x03, 0x1B];

/// Disk DMA slots (three per line).
pub const DISK_SLOTS: [u16; 3] = [0x04, 0x05, 0x06];

/// Audio DMA slots, one per channel.
pub const AUDIO_SLOTS: [u16; 4] = [0x07, 0x08, 0x09, 0x0A];

/// First sprite slot; each sprite owns two consecutive slots.
pub const SPRITE_SLOT_BASE: u16 = 0x0B;

/// First raster line with sprite DMA.
pub const SPRITE_DMA_FIRST_LINE: u16 = 25;

/// Lores fetch order within an 8-slot group (0 = idle, else plane number).
const LORES_FETCH: [u8; 8] = [0, 4, 6, 2, 0, 3, 5, 1];
/// Hires fetch order within a 4-slot group, repeated twice per group.
const HIRES_FETCH: [u8; 4] = [4, 2, 3, 1];

fn bitplane_event(plane: u8) -> EventId {
    match plane {
        1 => EventId::DmaBpl1,
        2 => EventId::DmaBpl2,
        3 => EventId::DmaBpl3,
        4 => EventId::DmaBpl4,
        5 => EventId::DmaBpl5,
        _ => EventId::DmaBpl6,
    }
}

fn audio_event(channel: u16) -> EventId {
    match channel {
        0 => EventId::DmaAud0,
        1 => EventId::DmaAud1,
        2 => EventId::DmaAud2,
        _ => EventId::DmaAud3,
    }
}

fn sprite_event(n: u16) -> EventId {
    match n {
        0 => EventId::DmaSpr0,
        1 => EventId::DmaSpr1,
        2 => EventId::DmaSpr2,
        3 => EventId::DmaSpr3,
        4 => EventId::DmaSpr4,
        5 => EventId::DmaSpr5,
        6 => EventId::DmaSpr6,
        _ => EventId::DmaSpr7,
    }
}

/// Rebuild the slot table for line `v`. `disk_active` reports whether the
/// disk controller is in a transferring state.
pub fn build_table(agnus: &mut Agnus, v: u16, disk_active: bool) {
    agnus.dma_event = [EventId::None; 227];

    if agnus.dma_enabled() {
        if agnus.channel_enabled(custom_regs::DMAF_DSKEN) && disk_active {
            for &h in &DISK_SLOTS {
                agnus.dma_event[usize::from(h)] = EventId::DmaDisk;
            }
        }

        for (n, &h) in AUDIO_SLOTS.iter().enumerate() {
            if agnus.channel_enabled(1 << n) {
                agnus.dma_event[usize::from(h)] = audio_event(n as u16);
            }
        }

        if agnus.channel_enabled(custom_regs::DMAF_SPREN) && v >= SPRITE_DMA_FIRST_LINE {
            for n in 0..8u16 {
                agnus.dma_event[usize::from(SPRITE_SLOT_BASE + 2 * n)] = sprite_event(n);
            }
        }

        if agnus.channel_enabled(custom_regs::DMAF_BPLEN)
            && agnus.num_bpl > 0
            && agnus.in_bpl_dma_line(v)
        {
            place_bitplane_events(agnus);
        }
    }

    rebuild_chain(agnus);
}

fn place_bitplane_events(agnus: &mut Agnus) {
    let strt = agnus.ddfstrt & 0x00FC;
    let stop = agnus.ddfstop & 0x00FC;
    if strt < 0x18 || strt > stop {
        return;
    }

    let mut group = strt;
    while group <= stop && group + 7 < HPOS_CNT {
        for offset in 0..8u16 {
            let plane = if agnus.hires {
                HIRES_FETCH[usize::from(offset % 4)]
            } else {
                LORES_FETCH[usize::from(offset)]
            };
            if plane == 0 || plane > agnus.num_bpl {
                continue;
            }
            let h = usize::from(group + offset);
            if agnus.dma_event[h] == EventId::None {
                agnus.dma_event[h] = bitplane_event(plane);
            }
        }
        group += 8;
    }
}

fn rebuild_chain(agnus: &mut Agnus) {
    let mut next = NO_SLOT;
    for h in (0..usize::from(HPOS_CNT)).rev() {
        agnus.next_dma[h] = next;
        if agnus.dma_event[h] != EventId::None {
            next = h as u16;
        }
    }
    // next_dma[h] answers "what comes after h"; the first owned slot is
    // found by probing from slot 0.
}

/// The first owned slot at or after `h`, if any.
#[must_use]
pub fn first_owned_slot(agnus: &Agnus, h: u16) -> Option<u16> {
    let mut slot = h;
    while slot < HPOS_CNT {
        if agnus.dma_event[usize::from(slot)] != EventId::None {
            return Some(slot);
        }
        slot += 1;
    }
    None
}

/// CPU wait clocks for a chip bus access at slot `h`. A claimed slot costs
/// the CPU one colour clock (two CPU clocks).
#[must_use]
pub fn cpu_wait_at(agnus: &Agnus, h: u16) -> u8 {
    if REFRESH_SLOTS.contains(&h) {
        return 2;
    }
    if agnus.dma_event[usize::from(h)] != EventId::None {
        return 2;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_regs::{DMAF_BPLEN, DMAF_DMAEN, DMAF_DSKEN, DMAF_SPREN};

    fn agnus_with(dmacon: u16) -> Agnus {
        let mut agnus = Agnus::new();
        agnus.dmacon = dmacon;
        agnus
    }

    #[test]
    fn disk_slots_require_enable_and_activity() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_DSKEN);
        build_table(&mut agnus, 50, true);
        for &h in &DISK_SLOTS {
            assert_eq!(agnus.dma_event[usize::from(h)], EventId::DmaDisk);
        }
        build_table(&mut agnus, 50, false);
        for &h in &DISK_SLOTS {
            assert_eq!(agnus.dma_event[usize::from(h)], EventId::None);
        }
    }

    #[test]
    fn master_enable_gates_everything() {
        let mut agnus = agnus_with(DMAF_DSKEN | DMAF_SPREN | DMAF_BPLEN);
        agnus.num_bpl = 4;
        build_table(&mut agnus, 100, true);
        assert!(agnus.dma_event.iter().all(|&e| e == EventId::None));
    }

    #[test]
    fn lores_fetch_order_in_window() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_BPLEN);
        agnus.num_bpl = 6;
        agnus.ddfstrt = 0x38;
        agnus.ddfstop = 0x38; // single fetch group
        build_table(&mut agnus, 0x50, false);
        let base = 0x38usize;
        assert_eq!(agnus.dma_event[base], EventId::None);
        assert_eq!(agnus.dma_event[base + 1], EventId::DmaBpl4);
        assert_eq!(agnus.dma_event[base + 2], EventId::DmaBpl6);
        assert_eq!(agnus.dma_event[base + 3], EventId::DmaBpl2);
        assert_eq!(agnus.dma_event[base + 4], EventId::None);
        assert_eq!(agnus.dma_event[base + 5], EventId::DmaBpl3);
        assert_eq!(agnus.dma_event[base + 6], EventId::DmaBpl5);
        assert_eq!(agnus.dma_event[base + 7], EventId::DmaBpl1);
    }

    #[test]
    fn four_planes_skip_upper_fetches() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_BPLEN);
        agnus.num_bpl = 4;
        agnus.ddfstrt = 0x38;
        agnus.ddfstop = 0x38;
        build_table(&mut agnus, 0x50, false);
        assert_eq!(agnus.dma_event[0x3A], EventId::None); // plane 6
        assert_eq!(agnus.dma_event[0x3E], EventId::None); // plane 5
        assert_eq!(agnus.dma_event[0x39], EventId::DmaBpl4);
    }

    #[test]
    fn bitplane_dma_respects_vertical_window() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_BPLEN);
        agnus.num_bpl = 2;
        build_table(&mut agnus, 10, false); // above DIWSTRT
        assert!(agnus
            .dma_event
            .iter()
            .all(|&e| e == EventId::None));
    }

    #[test]
    fn chain_links_owned_slots() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_DSKEN);
        build_table(&mut agnus, 60, true);
        assert_eq!(first_owned_slot(&agnus, 0), Some(0x04));
        assert_eq!(agnus.next_dma[0x04], 0x05);
        assert_eq!(agnus.next_dma[0x05], 0x06);
        assert_eq!(agnus.next_dma[0x06], NO_SLOT);
    }

    #[test]
    fn cpu_stalls_on_claimed_slots() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_DSKEN);
        build_table(&mut agnus, 60, true);
        assert_eq!(cpu_wait_at(&agnus, 0x01), 2); // refresh
        assert_eq!(cpu_wait_at(&agnus, 0x04), 2); // disk
        assert_eq!(cpu_wait_at(&agnus, 0x80), 0); // free
    }

    #[test]
    fn sprite_slots_cover_eight_sprites() {
        let mut agnus = agnus_with(DMAF_DMAEN | DMAF_SPREN);
        build_table(&mut agnus, 40, false);
        assert_eq!(agnus.dma_event[0x0B], EventId::DmaSpr0);
        assert_eq!(agnus.dma_event[0x19], EventId::DmaSpr7);
        // No sprite DMA above the first sprite line.
        build_table(&mut agnus, 10, false);
        assert_eq!(agnus.dma_event[0x0B], EventId::None);
    }
}
