//! The two event tables.
//!
//! Each slot is a state machine running in parallel with the others: it is
//! either empty or holds exactly one pending event. The primary table keeps
//! the hot slots (CIAs, disk rotation, the DMA dispatcher, Copper, Blitter,
//! raster housekeeping); the secondary table keeps the cold ones (the 14
//! interrupt sources, disk changes, inspection). The secondary table is
//! reachable through the SEC slot of the primary table, whose trigger
//! always mirrors the earliest secondary trigger, so the drain loop only
//! ever crawls eight slots.
//!
//! When several slots are due at the same cycle, the lower slot index is
//! served first. That ordering is load-bearing: it is how simultaneous
//! CIA, DMA, and Copper activity is arbitrated.

use crate::cycles::{Cycle, NEVER};

/// Primary slots, in service priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimSlot {
    /// CIA A execution.
    Ciaa = 0,
    /// CIA B execution.
    Ciab = 1,
    /// Disk rotation (byte transfer drive <-> FIFO).
    Dsk = 2,
    /// Disk/audio/sprite/bitplane DMA dispatcher.
    Dma = 3,
    /// Copper.
    Cop = 4,
    /// Blitter.
    Blt = 5,
    /// Raster line housekeeping (HSYNC, VSYNC).
    Ras = 6,
    /// Secondary-table fan-out.
    Sec = 7,
}

pub const PRIM_SLOT_CNT: usize = 8;

impl PrimSlot {
    pub const ALL: [Self; PRIM_SLOT_CNT] = [
        Self::Ciaa,
        Self::Ciab,
        Self::Dsk,
        Self::Dma,
        Self::Cop,
        Self::Blt,
        Self::Ras,
        Self::Sec,
    ];
}

/// Secondary slots: one per interrupt source, plus disk change and the
/// inspection target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecSlot {
    IrqTbe = 0,
    IrqDskblk = 1,
    IrqSoft = 2,
    IrqPorts = 3,
    IrqCoper = 4,
    IrqVertb = 5,
    IrqBlit = 6,
    IrqAud0 = 7,
    IrqAud1 = 8,
    IrqAud2 = 9,
    IrqAud3 = 10,
    IrqRbf = 11,
    IrqDsksyn = 12,
    IrqExter = 13,
    Dch = 14,
    Ins = 15,
}

pub const SEC_SLOT_CNT: usize = 16;

impl SecSlot {
    pub const ALL: [Self; SEC_SLOT_CNT] = [
        Self::IrqTbe,
        Self::IrqDskblk,
        Self::IrqSoft,
        Self::IrqPorts,
        Self::IrqCoper,
        Self::IrqVertb,
        Self::IrqBlit,
        Self::IrqAud0,
        Self::IrqAud1,
        Self::IrqAud2,
        Self::IrqAud3,
        Self::IrqRbf,
        Self::IrqDsksyn,
        Self::IrqExter,
        Self::Dch,
        Self::Ins,
    ];

    /// The interrupt slot for INTREQ bit `n`.
    #[must_use]
    pub fn irq(n: u16) -> Self {
        Self::ALL[(n & 0xF) as usize]
    }
}

/// What a pending event means to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventId {
    /// Empty slot; serving it is a no-op.
    #[default]
    None,

    // CIA slots
    CiaExecute,

    // DSK slot
    DskRotate,

    // DMA dispatcher slot
    DmaDisk,
    DmaAud0,
    DmaAud1,
    DmaAud2,
    DmaAud3,
    DmaSpr0,
    DmaSpr1,
    DmaSpr2,
    DmaSpr3,
    DmaSpr4,
    DmaSpr5,
    DmaSpr6,
    DmaSpr7,
    DmaBpl1,
    DmaBpl2,
    DmaBpl3,
    DmaBpl4,
    DmaBpl5,
    DmaBpl6,

    // Copper slot
    CopRequestDma,
    CopFetch,
    CopMove,
    CopWaitOrSkip,
    CopWait,
    CopSkip,
    CopJmp1,
    CopJmp2,

    // Blitter slot
    BltInit,
    BltExecute,
    BltFastBlit,
    BltComplete,

    // Raster slot
    RasHsync,

    // SEC fan-out
    SecTrigger,

    // Secondary table: interrupt slots
    IrqSet,
    IrqClear,

    // Secondary table: disk change
    DchEject,
    DchInsert,

    // Secondary table: inspection targets
    InsAmiga,
    InsCpu,
    InsMem,
    InsCia,
    InsAgnus,
    InsPaula,
    InsDenise,
    InsEvents,
}

impl EventId {
    /// Stable wire code for snapshots.
    #[must_use]
    pub fn code(self) -> u8 {
        ID_TABLE.iter().position(|&id| id == self).unwrap_or(0) as u8
    }

    /// Decode a snapshot wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        ID_TABLE.get(usize::from(code)).copied()
    }
}

/// Order defines the wire codes; append only.
const ID_TABLE: [EventId; 48] = [
    EventId::None,
    EventId::CiaExecute,
    EventId::DskRotate,
    EventId::DmaDisk,
    EventId::DmaAud0,
    EventId::DmaAud1,
    EventId::DmaAud2,
    EventId::DmaAud3,
    EventId::DmaSpr0,
    EventId::DmaSpr1,
    EventId::DmaSpr2,
    EventId::DmaSpr3,
    EventId::DmaSpr4,
    EventId::DmaSpr5,
    EventId::DmaSpr6,
    EventId::DmaSpr7,
    EventId::DmaBpl1,
    EventId::DmaBpl2,
    EventId::DmaBpl3,
    EventId::DmaBpl4,
    EventId::DmaBpl5,
    EventId::DmaBpl6,
    EventId::CopRequestDma,
    EventId::CopFetch,
    EventId::CopMove,
    EventId::CopWaitOrSkip,
    EventId::CopWait,
    EventId::CopSkip,
    EventId::CopJmp1,
    EventId::CopJmp2,
    EventId::BltInit,
    EventId::BltExecute,
    EventId::BltFastBlit,
    EventId::BltComplete,
    EventId::RasHsync,
    EventId::SecTrigger,
    EventId::IrqSet,
    EventId::IrqClear,
    EventId::DchEject,
    EventId::DchInsert,
    EventId::InsAmiga,
    EventId::InsCpu,
    EventId::InsMem,
    EventId::InsCia,
    EventId::InsAgnus,
    EventId::InsPaula,
    EventId::InsDenise,
    EventId::InsEvents,
];

/// One slot of either table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub trigger: Cycle,
    pub id: EventId,
    /// Handler-defined payload (drive number, sprite index, ...).
    pub data: i64,
}

impl Event {
    const EMPTY: Self = Self {
        trigger: NEVER,
        id: EventId::None,
        data: 0,
    };
}

/// The slotted scheduler. `next_prim` is maintained as the minimum primary
/// trigger after every mutation, so the drain loop's fast path is a single
/// comparison.
pub struct Scheduler {
    pub primary: [Event; PRIM_SLOT_CNT],
    pub secondary: [Event; SEC_SLOT_CNT],
    next_prim: Cycle,
    next_sec: Cycle,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            primary: [Event::EMPTY; PRIM_SLOT_CNT],
            secondary: [Event::EMPTY; SEC_SLOT_CNT],
            next_prim: NEVER,
            next_sec: NEVER,
        }
    }

    #[must_use]
    pub fn next_primary_trigger(&self) -> Cycle {
        self.next_prim
    }

    #[must_use]
    pub fn next_secondary_trigger(&self) -> Cycle {
        self.next_sec
    }

    #[must_use]
    pub fn has_event(&self, slot: PrimSlot) -> bool {
        self.primary[slot as usize].id != EventId::None
    }

    #[must_use]
    pub fn is_pending(&self, slot: PrimSlot) -> bool {
        self.primary[slot as usize].trigger != NEVER
    }

    #[must_use]
    pub fn has_sec_event(&self, slot: SecSlot) -> bool {
        self.secondary[slot as usize].id != EventId::None
    }

    #[must_use]
    pub fn is_sec_pending(&self, slot: SecSlot) -> bool {
        self.secondary[slot as usize].trigger != NEVER
    }

    //
    // Primary table.
    //

    pub fn schedule_abs(&mut self, slot: PrimSlot, cycle: Cycle, id: EventId) {
        self.schedule_abs_data(slot, cycle, id, 0);
    }

    pub fn schedule_abs_data(&mut self, slot: PrimSlot, cycle: Cycle, id: EventId, data: i64) {
        self.primary[slot as usize] = Event {
            trigger: cycle,
            id,
            data,
        };
        self.update_next_prim();
    }

    /// Keep the slot's event id, move its trigger.
    pub fn reschedule_abs(&mut self, slot: PrimSlot, cycle: Cycle) {
        debug_assert!(self.has_event(slot), "reschedule of empty slot {slot:?}");
        self.primary[slot as usize].trigger = cycle;
        self.update_next_prim();
    }

    /// Park the event: trigger NEVER, id kept.
    pub fn disable(&mut self, slot: PrimSlot) {
        self.primary[slot as usize].trigger = NEVER;
        self.update_next_prim();
    }

    /// Empty the slot completely.
    pub fn cancel(&mut self, slot: PrimSlot) {
        self.primary[slot as usize] = Event::EMPTY;
        self.update_next_prim();
    }

    //
    // Secondary table. Every mutation re-mirrors the earliest secondary
    // trigger into the primary SEC slot.
    //

    pub fn sec_schedule_abs(&mut self, slot: SecSlot, cycle: Cycle, id: EventId, data: i64) {
        self.secondary[slot as usize] = Event {
            trigger: cycle,
            id,
            data,
        };
        self.mirror_sec();
    }

    pub fn sec_reschedule_abs(&mut self, slot: SecSlot, cycle: Cycle) {
        debug_assert!(
            self.has_sec_event(slot),
            "reschedule of empty secondary slot {slot:?}"
        );
        self.secondary[slot as usize].trigger = cycle;
        self.mirror_sec();
    }

    pub fn sec_disable(&mut self, slot: SecSlot) {
        self.secondary[slot as usize].trigger = NEVER;
        self.mirror_sec();
    }

    pub fn sec_cancel(&mut self, slot: SecSlot) {
        self.secondary[slot as usize] = Event::EMPTY;
        self.mirror_sec();
    }

    fn update_next_prim(&mut self) {
        self.next_prim = self
            .primary
            .iter()
            .map(|e| e.trigger)
            .min()
            .unwrap_or(NEVER);
    }

    fn mirror_sec(&mut self) {
        self.next_sec = self
            .secondary
            .iter()
            .map(|e| e.trigger)
            .min()
            .unwrap_or(NEVER);
        self.primary[PrimSlot::Sec as usize].id = EventId::SecTrigger;
        self.primary[PrimSlot::Sec as usize].trigger = self.next_sec;
        self.update_next_prim();
    }

    /// Re-derive the SEC mirror after secondary events were served.
    pub fn rebuild_sec_mirror(&mut self) {
        self.mirror_sec();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        for event in self.primary.iter().chain(self.secondary.iter()) {
            w.put_i64(event.trigger);
            w.put_u8(event.id.code());
            w.put_i64(event.data);
        }
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        let mut load_one = |r: &mut crate::snapshot::SnapshotReader<'_>| {
            let trigger = r.get_i64()?;
            let id = EventId::from_code(r.get_u8()?)
                .ok_or(crate::snapshot::SnapshotError::Corrupt)?;
            let data = r.get_i64()?;
            Ok::<Event, crate::snapshot::SnapshotError>(Event { trigger, id, data })
        };
        for slot in 0..PRIM_SLOT_CNT {
            self.primary[slot] = load_one(r)?;
        }
        for slot in 0..SEC_SLOT_CNT {
            self.secondary[slot] = load_one(r)?;
        }
        self.update_next_prim();
        // The SEC mirror is part of the primary table and was serialized
        // with it; only the cached minimum needs re-deriving.
        self.next_sec = self
            .secondary
            .iter()
            .map(|e| e.trigger)
            .min()
            .unwrap_or(NEVER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_primary(s: &Scheduler) -> Cycle {
        s.primary.iter().map(|e| e.trigger).min().unwrap()
    }

    #[test]
    fn next_trigger_tracks_minimum() {
        let mut s = Scheduler::new();
        assert_eq!(s.next_primary_trigger(), NEVER);

        s.schedule_abs(PrimSlot::Cop, 100, EventId::CopFetch);
        s.schedule_abs(PrimSlot::Ciaa, 40, EventId::CiaExecute);
        s.schedule_abs(PrimSlot::Ras, 500, EventId::RasHsync);
        assert_eq!(s.next_primary_trigger(), 40);
        assert_eq!(s.next_primary_trigger(), min_primary(&s));

        s.cancel(PrimSlot::Ciaa);
        assert_eq!(s.next_primary_trigger(), 100);
        assert_eq!(s.next_primary_trigger(), min_primary(&s));
    }

    #[test]
    fn reschedule_is_idempotent() {
        let mut s = Scheduler::new();
        s.schedule_abs(PrimSlot::Blt, 300, EventId::BltExecute);
        let snapshot = s.primary;
        s.reschedule_abs(PrimSlot::Blt, 300);
        assert_eq!(s.primary, snapshot);
        assert_eq!(s.next_primary_trigger(), 300);
    }

    #[test]
    fn disable_keeps_id() {
        let mut s = Scheduler::new();
        s.schedule_abs(PrimSlot::Cop, 64, EventId::CopWait);
        s.disable(PrimSlot::Cop);
        assert!(s.has_event(PrimSlot::Cop));
        assert!(!s.is_pending(PrimSlot::Cop));
        s.reschedule_abs(PrimSlot::Cop, 128);
        assert_eq!(s.primary[PrimSlot::Cop as usize].id, EventId::CopWait);
        assert_eq!(s.next_primary_trigger(), 128);
    }

    #[test]
    fn secondary_minimum_is_mirrored() {
        let mut s = Scheduler::new();
        s.sec_schedule_abs(SecSlot::IrqVertb, 900, EventId::IrqSet, 5);
        s.sec_schedule_abs(SecSlot::IrqDskblk, 700, EventId::IrqSet, 1);
        assert_eq!(s.next_secondary_trigger(), 700);
        assert_eq!(s.primary[PrimSlot::Sec as usize].trigger, 700);
        assert_eq!(s.primary[PrimSlot::Sec as usize].id, EventId::SecTrigger);

        s.sec_cancel(SecSlot::IrqDskblk);
        assert_eq!(s.primary[PrimSlot::Sec as usize].trigger, 900);

        s.sec_cancel(SecSlot::IrqVertb);
        assert_eq!(s.primary[PrimSlot::Sec as usize].trigger, NEVER);
    }

    #[test]
    fn irq_slot_lookup() {
        assert_eq!(SecSlot::irq(0), SecSlot::IrqTbe);
        assert_eq!(SecSlot::irq(5), SecSlot::IrqVertb);
        assert_eq!(SecSlot::irq(13), SecSlot::IrqExter);
    }
}
