//! The chip set wired together: event dispatch, the custom register file,
//! and the CPU's view of the bus.
//!
//! All chips live side by side in [`AmigaBus`]; event handlers are methods
//! here so they can reach every collaborator without back-pointers. The
//! drain loop serves due slots in index order, which is the hardware
//! arbitration order for same-cycle activity.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#![allow(clippy::too_many_lines)]

use cpu_m68000::{BusAccess, FunctionCode, M68kBus};
use format_adf::Adf;

use crate::agnus::dma;
use crate::agnus::{Agnus, SprDmaState};
use crate::beam::{Beam, HPOS_MAX};
use crate::blitter::Blitter;
use crate::breakpoints::GuardCollection;
use crate::cia::Cia;
use crate::config::{AmigaConfig, BlitterAccuracy};
use crate::copper::Copper;
use crate::custom_regs as reg;
use crate::cycles::{cia_cycles, dma_cycles, msec, Cycle, NEVER};
use crate::denise::Denise;
use crate::drive::Drive;
use crate::events::{EventId, PrimSlot, SecSlot};
use crate::keyboard::Keyboard;
use crate::memory::{MemSrc, Memory};
use crate::messages::{MessageQueue, MsgType};
use crate::paula::disk::{ArmOutcome, DiskOutcome, DiskState};
use crate::paula::Paula;
use crate::ports::ControlPort;
use crate::rtc::Rtc;
use crate::serial::{SerialDevice, SerialPort};

/// Rotation period of the disk byte shifter, in DMA cycles.
const DSK_ROTATE_PERIOD: Cycle = 56;

/// Fixed DSKBLK delay after a turbo transfer.
const TURBO_DSKBLK_DELAY: Cycle = 64;

pub struct AmigaBus {
    pub mem: Memory,
    pub agnus: Agnus,
    pub denise: Denise,
    pub paula: Paula,
    pub ciaa: Cia,
    pub ciab: Cia,
    pub copper: Copper,
    pub blitter: Blitter,
    pub keyboard: Keyboard,
    pub port1: ControlPort,
    pub port2: ControlPort,
    pub rtc: Rtc,
    pub serial: SerialPort,
    pub df: [Drive; 4],
    pub msgs: MessageQueue,

    pub blitter_accuracy: BlitterAccuracy,
    pub watchpoints: GuardCollection,
    pub watchpoints_enabled: bool,
    /// Set when a watchpoint fired; consumed by the run loop.
    pub watchpoint_hit: Option<u32>,
    /// Set by the inspection event; consumed by the run loop.
    pub inspection_due: bool,

    /// Disks waiting for their delayed insertion event.
    pending_insert: [Option<Adf>; 4],
    fifo_warning_sent: bool,
}

impl AmigaBus {
    #[must_use]
    pub fn new(config: &AmigaConfig, msgs: MessageQueue) -> Self {
        let mut denise = Denise::new();
        denise.emulate_sprites = config.emulate_sprites;
        denise.clx_spr_spr = config.clx_spr_spr;
        denise.clx_spr_plf = config.clx_spr_plf;
        denise.clx_plf_plf = config.clx_plf_plf;

        let mut paula = Paula::new();
        paula.disk.use_fifo = config.fifo_buffering;
        paula.disk.speed = config.drive_speed;
        for (n, dc) in config.drives.iter().enumerate() {
            paula.disk.connected[n] = dc.connected;
        }

        let mut serial = SerialPort::new();
        serial.device = if config.serial_loopback {
            SerialDevice::Loopback
        } else {
            SerialDevice::None
        };

        let mut df = [Drive::new(0), Drive::new(1), Drive::new(2), Drive::new(3)];
        for (n, dc) in config.drives.iter().enumerate() {
            df[n].turbo = dc.turbo;
        }

        Self {
            mem: Memory::new(config),
            agnus: Agnus::new(),
            denise,
            paula,
            ciaa: Cia::new(),
            ciab: Cia::new(),
            copper: Copper::new(),
            blitter: Blitter::new(),
            keyboard: Keyboard::new(),
            port1: ControlPort::new(0),
            port2: ControlPort::new(1),
            rtc: Rtc::new(),
            serial,
            df,
            msgs,
            blitter_accuracy: config.blitter_accuracy,
            watchpoints: GuardCollection::new(),
            watchpoints_enabled: false,
            watchpoint_hit: None,
            inspection_due: false,
            pending_insert: [None, None, None, None],
            fifo_warning_sent: false,
        }
    }

    /// Power-on reset: chips to their reset state, ROM overlaid, and the
    /// standing events scheduled.
    pub fn hard_reset(&mut self) {
        self.agnus = Agnus::new();
        self.denise.reset();
        self.paula.reset();
        self.ciaa.reset();
        self.ciab.reset();
        self.copper.reset();
        self.blitter.reset();
        self.keyboard.reset();
        self.port1.reset();
        self.port2.reset();
        self.rtc.reset();
        self.serial.reset();
        for drive in &mut self.df {
            drive.reset();
        }
        self.mem.set_overlay(true);
        self.watchpoint_hit = None;
        self.fifo_warning_sent = false;

        // Standing events: the two CIAs and the raster housekeeping.
        self.agnus
            .schedule_rel(PrimSlot::Ciaa, cia_cycles(1), EventId::CiaExecute);
        self.agnus
            .schedule_rel(PrimSlot::Ciab, cia_cycles(1), EventId::CiaExecute);
        self.agnus
            .schedule_pos(PrimSlot::Ras, Beam::new(0, HPOS_MAX), EventId::RasHsync);
        self.rebuild_dma_schedule();
    }

    //
    // The drain loop.
    //

    /// Process every primary event due at or before `cycle`. Handlers may
    /// schedule follow-ups at the current cycle; those are served in the
    /// same call.
    pub fn execute_until(&mut self, cycle: Cycle) {
        while self.agnus.scheduler.next_primary_trigger() <= cycle {
            let now = self.agnus.scheduler.next_primary_trigger();
            self.agnus.clock = now;
            for slot in PrimSlot::ALL {
                let event = self.agnus.scheduler.primary[slot as usize];
                if event.trigger <= now {
                    if event.id == EventId::None {
                        self.agnus.scheduler.cancel(slot);
                    } else {
                        self.serve_primary(slot, event.id);
                    }
                }
            }
        }
        self.agnus.clock = cycle;
    }

    fn serve_primary(&mut self, slot: PrimSlot, id: EventId) {
        match slot {
            PrimSlot::Ciaa => self.serve_ciaa(),
            PrimSlot::Ciab => self.serve_ciab(),
            PrimSlot::Dsk => self.serve_disk_rotation(),
            PrimSlot::Dma => self.serve_dma(id),
            PrimSlot::Cop => self.serve_copper(id),
            PrimSlot::Blt => self.serve_blitter(id),
            PrimSlot::Ras => self.serve_hsync(),
            PrimSlot::Sec => self.serve_secondary(),
        }
    }

    //
    // CIA slots.
    //

    fn serve_ciaa(&mut self) {
        self.ciaa.clock = self.agnus.clock;
        self.ciaa.execute_eclock();
        // Keyboard bytes shift in whenever the serial line is idle.
        if let Some(byte) = self.keyboard.try_send() {
            self.ciaa.receive_serial(byte);
        }
        if self.ciaa.irq_active() {
            self.raise_irq(reg::INT_PORTS, 0);
        }
        self.agnus.reschedule_rel(PrimSlot::Ciaa, cia_cycles(1));
    }

    fn serve_ciab(&mut self) {
        self.ciab.clock = self.agnus.clock;
        self.ciab.execute_eclock();
        if self.ciab.irq_active() {
            self.raise_irq(reg::INT_EXTER, 0);
        }
        self.agnus.reschedule_rel(PrimSlot::Ciab, cia_cycles(1));
    }

    //
    // Disk rotation.
    //

    fn serve_disk_rotation(&mut self) {
        let clock = self.agnus.clock;
        if let Some(n) = self.paula.disk.selected {
            let outcome = self.paula.disk.service_rotation(&mut self.df[n], clock);
            self.apply_disk_outcome(outcome);
        }
        self.report_fifo_error();

        if self.df.iter().any(|d| d.motor) {
            self.agnus
                .reschedule_rel(PrimSlot::Dsk, dma_cycles(DSK_ROTATE_PERIOD));
        } else {
            self.agnus.scheduler.cancel(PrimSlot::Dsk);
        }
    }

    fn apply_disk_outcome(&mut self, outcome: DiskOutcome) {
        if outcome.raise_dsksyn {
            self.raise_irq(reg::INT_DSKSYN, 0);
        }
        if outcome.raise_dskblk {
            self.raise_irq(reg::INT_DSKBLK, 0);
        }
    }

    fn report_fifo_error(&mut self) {
        if self.paula.disk.fifo_error && !self.fifo_warning_sent {
            self.fifo_warning_sent = true;
            self.paula.disk.clear_fifo();
            self.msgs.put(MsgType::DiskWarning);
        }
    }

    //
    // The DMA dispatcher slot.
    //

    fn serve_dma(&mut self, id: EventId) {
        let h = self.agnus.hpos();
        match id {
            EventId::DmaDisk => self.serve_disk_dma(),
            EventId::DmaAud0 => self.serve_audio_dma(0),
            EventId::DmaAud1 => self.serve_audio_dma(1),
            EventId::DmaAud2 => self.serve_audio_dma(2),
            EventId::DmaAud3 => self.serve_audio_dma(3),
            EventId::DmaSpr0 => self.serve_sprite_dma(0),
            EventId::DmaSpr1 => self.serve_sprite_dma(1),
            EventId::DmaSpr2 => self.serve_sprite_dma(2),
            EventId::DmaSpr3 => self.serve_sprite_dma(3),
            EventId::DmaSpr4 => self.serve_sprite_dma(4),
            EventId::DmaSpr5 => self.serve_sprite_dma(5),
            EventId::DmaSpr6 => self.serve_sprite_dma(6),
            EventId::DmaSpr7 => self.serve_sprite_dma(7),
            EventId::DmaBpl1 => self.serve_bitplane_dma(1),
            EventId::DmaBpl2 => self.serve_bitplane_dma(2),
            EventId::DmaBpl3 => self.serve_bitplane_dma(3),
            EventId::DmaBpl4 => self.serve_bitplane_dma(4),
            EventId::DmaBpl5 => self.serve_bitplane_dma(5),
            EventId::DmaBpl6 => self.serve_bitplane_dma(6),
            _ => {}
        }
        self.schedule_dma_from(h + 1);
    }

    /// Chain the DMA slot to the next owned slot of this line.
    fn schedule_dma_from(&mut self, h: u16) {
        let v = self.agnus.pos_v;
        if h <= HPOS_MAX {
            if let Some(next) = dma::first_owned_slot(&self.agnus, h) {
                let id = self.agnus.dma_event[usize::from(next)];
                self.agnus.schedule_pos(PrimSlot::Dma, Beam::new(v, next), id);
                return;
            }
        }
        self.agnus.scheduler.cancel(PrimSlot::Dma);
    }

    /// Rebuild the table for the current line and reschedule the
    /// dispatcher from the current horizontal position.
    pub fn rebuild_dma_schedule(&mut self) {
        let v = self.agnus.pos_v;
        let disk_active = !matches!(self.paula.disk.state, DiskState::Off)
            && self.paula.disk.words_left() > 0;
        dma::build_table(&mut self.agnus, v, disk_active);
        self.schedule_dma_from(self.agnus.hpos());
    }

    fn serve_disk_dma(&mut self) {
        let clock = self.agnus.clock;
        let Some(n) = self.paula.disk.selected else {
            return;
        };
        let mut dskpt = self.agnus.dskpt;
        let outcome = self.paula.disk.perform_dma_slot(
            &mut self.df[n],
            &mut self.mem,
            &mut dskpt,
            clock,
        );
        self.agnus.dskpt = dskpt;
        self.apply_disk_outcome(outcome);
        self.report_fifo_error();
        if self.paula.disk.state == DiskState::Off {
            // Transfer complete: drop the disk slots for the rest of the
            // line so the CPU gets them back.
            self.rebuild_dma_schedule();
        }
    }

    fn serve_audio_dma(&mut self, channel: usize) {
        let irqs = self.paula.audio.service_dma(channel, &self.mem);
        self.paula.intreq |= irqs;
    }

    fn serve_bitplane_dma(&mut self, plane: u8) {
        let idx = usize::from(plane - 1);
        let word = self.mem.read_chip16(self.agnus.bpl_pt[idx]);
        self.agnus.bpl_pt[idx] = self.agnus.bpl_pt[idx].wrapping_add(2);
        self.denise.write_bpldat(idx, word);
        if plane == 1 {
            // BPL1DAT loads the shift registers and draws 16 pixels.
            let h = self.agnus.hpos();
            self.denise.fill_shift_registers(h);
        }
    }

    fn serve_sprite_dma(&mut self, n: usize) {
        let v = self.agnus.pos_v;
        match self.agnus.sprite[n].state {
            SprDmaState::FetchCtl => self.sprite_fetch_ctl(n),
            SprDmaState::Wait => {
                if v == self.agnus.sprite[n].vstart {
                    self.agnus.sprite[n].state = SprDmaState::Active;
                    self.sprite_fetch_data(n);
                }
            }
            SprDmaState::Active => {
                if v == self.agnus.sprite[n].vstop {
                    self.sprite_fetch_ctl(n);
                } else {
                    self.sprite_fetch_data(n);
                }
            }
            SprDmaState::Off => {}
        }
    }

    fn sprite_fetch_ctl(&mut self, n: usize) {
        let pos = self.mem.read_chip16(self.agnus.spr_pt[n]);
        self.agnus.spr_pt[n] = self.agnus.spr_pt[n].wrapping_add(2);
        let ctl = self.mem.read_chip16(self.agnus.spr_pt[n]);
        self.agnus.spr_pt[n] = self.agnus.spr_pt[n].wrapping_add(2);
        self.denise.write_sprpos(n, pos);
        self.denise.write_sprctl(n, ctl);

        let vstart = (pos >> 8) | ((ctl & 0x04) << 6);
        let vstop = (ctl >> 8) | ((ctl & 0x02) << 7);
        self.agnus.sprite[n].vstart = vstart;
        self.agnus.sprite[n].vstop = vstop;
        self.agnus.sprite[n].state = if vstart == 0 && vstop == 0 {
            SprDmaState::Off
        } else {
            SprDmaState::Wait
        };
    }

    fn sprite_fetch_data(&mut self, n: usize) {
        let data = self.mem.read_chip16(self.agnus.spr_pt[n]);
        self.agnus.spr_pt[n] = self.agnus.spr_pt[n].wrapping_add(2);
        let datb = self.mem.read_chip16(self.agnus.spr_pt[n]);
        self.agnus.spr_pt[n] = self.agnus.spr_pt[n].wrapping_add(2);
        self.denise.write_sprdatb(n, datb);
        self.denise.write_sprdata(n, data);
    }

    //
    // Copper slot.
    //

    fn serve_copper(&mut self, id: EventId) {
        if !self.agnus.channel_enabled(reg::DMAF_COPEN) {
            self.agnus.scheduler.disable(PrimSlot::Cop);
            return;
        }
        match id {
            EventId::CopRequestDma => {
                self.copper.active = true;
                self.copper.wake_on_blitter = false;
                self.copper.pc = self.copper.cop1lc;
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
            }
            EventId::CopFetch => {
                self.copper.ir1 = self.mem.read_chip16(self.copper.pc);
                self.copper.pc = self.copper.pc.wrapping_add(2);
                let next = if self.copper.is_move() {
                    EventId::CopMove
                } else {
                    EventId::CopWaitOrSkip
                };
                self.agnus.schedule_rel(PrimSlot::Cop, dma_cycles(2), next);
            }
            EventId::CopMove => {
                self.copper.ir2 = self.mem.read_chip16(self.copper.pc);
                self.copper.pc = self.copper.pc.wrapping_add(2);
                if !self.copper.move_is_legal() {
                    // An unguarded MOVE below $080 halts the Copper until
                    // the next frame.
                    self.copper.active = false;
                    self.agnus.scheduler.cancel(PrimSlot::Cop);
                    return;
                }
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
                let target = self.copper.move_target();
                let value = self.copper.ir2;
                self.write_custom16(target, value);
            }
            EventId::CopWaitOrSkip => {
                self.copper.ir2 = self.mem.read_chip16(self.copper.pc);
                self.copper.pc = self.copper.pc.wrapping_add(2);
                if self.copper.is_wait() {
                    self.resolve_wait();
                } else {
                    self.agnus
                        .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopSkip);
                }
            }
            EventId::CopWait => {
                // The comparator position has been reached; the remaining
                // gate is the Blitter-finished condition.
                if !self.copper.bfd() && self.blitter.running {
                    self.copper.wake_on_blitter = true;
                    self.agnus.scheduler.disable(PrimSlot::Cop);
                    return;
                }
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
            }
            EventId::CopSkip => {
                if self.copper.compare(self.agnus.beam()) {
                    self.copper.pc = self.copper.pc.wrapping_add(4);
                }
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
            }
            EventId::CopJmp1 => {
                self.copper.pc = self.copper.cop1lc;
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
            }
            EventId::CopJmp2 => {
                self.copper.pc = self.copper.cop2lc;
                self.agnus
                    .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopFetch);
            }
            _ => {}
        }
    }

    fn resolve_wait(&mut self) {
        if self.copper.is_wait_forever() {
            self.agnus
                .scheduler
                .schedule_abs(PrimSlot::Cop, NEVER, EventId::CopWait);
            return;
        }
        let beam = self.agnus.beam();
        if self.copper.compare(beam) {
            self.agnus
                .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopWait);
            return;
        }
        match self.copper.next_trigger(beam, self.agnus.lof) {
            Some(target) => self.agnus.schedule_pos(PrimSlot::Cop, target, EventId::CopWait),
            None => self
                .agnus
                .scheduler
                .schedule_abs(PrimSlot::Cop, NEVER, EventId::CopWait),
        }
    }

    //
    // Blitter slot.
    //

    fn serve_blitter(&mut self, id: EventId) {
        match id {
            EventId::BltInit | EventId::BltExecute => {
                let done = self.blitter.execute_word(&mut self.mem);
                if done {
                    self.agnus
                        .schedule_rel(PrimSlot::Blt, dma_cycles(1), EventId::BltComplete);
                    // BBUSY holds until the completion event.
                    self.blitter.running = true;
                } else {
                    let step = self.blitter.word_step_duration();
                    self.agnus
                        .schedule_rel(PrimSlot::Blt, step, EventId::BltExecute);
                }
            }
            EventId::BltFastBlit => {
                let duration = self.blitter.estimated_duration();
                self.blitter.execute_full(&mut self.mem);
                self.blitter.running = true;
                self.agnus
                    .schedule_rel(PrimSlot::Blt, duration, EventId::BltComplete);
            }
            EventId::BltComplete => {
                self.blitter.running = false;
                self.agnus.scheduler.cancel(PrimSlot::Blt);
                self.raise_irq(reg::INT_BLIT, 0);
                if self.copper.wake_on_blitter {
                    self.copper.wake_on_blitter = false;
                    self.agnus
                        .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopWait);
                }
            }
            _ => {}
        }
    }

    /// Start the armed blit (BLTSIZE written with BLTEN on, or BLTEN
    /// turned on with a blit armed).
    fn start_blitter(&mut self) {
        let first = match self.blitter_accuracy {
            BlitterAccuracy::Fast => EventId::BltFastBlit,
            BlitterAccuracy::CycleExact => EventId::BltExecute,
        };
        self.agnus.schedule_rel(PrimSlot::Blt, dma_cycles(2), first);
    }

    //
    // Raster housekeeping.
    //

    fn serve_hsync(&mut self) {
        let v = self.agnus.pos_v;
        let line_start = self.agnus.line_start;
        let lof = self.agnus.lof;

        // Flush the finished line through Denise and the audio unit.
        self.denise.clock = self.agnus.clock;
        self.denise.end_of_line(v, lof, line_start);
        self.paula.audio.end_of_line();

        if self.agnus.channel_enabled(reg::DMAF_BPLEN) && self.agnus.in_bpl_dma_line(v) {
            self.agnus.apply_bpl_modulos();
        }

        // CIA-B counts horizontal sync pulses on its TOD pin.
        self.ciab.tod_pulse();
        if self.ciab.irq_active() {
            self.raise_irq(reg::INT_EXTER, 0);
        }

        let lace = self.denise.bplcon0 & 0x0004 != 0;
        if self.agnus.advance_line(lace) {
            self.serve_vsync(lof);
        }

        self.rebuild_dma_schedule();
        let v_new = self.agnus.pos_v;
        self.agnus
            .schedule_pos(PrimSlot::Ras, Beam::new(v_new, HPOS_MAX), EventId::RasHsync);
    }

    fn serve_vsync(&mut self, finished_lof: bool) {
        // Vertical blank interrupt.
        self.raise_irq(reg::INT_VERTB, dma_cycles(1));

        // CIA-A counts vertical sync pulses.
        self.ciaa.tod_pulse();
        if self.ciaa.irq_active() {
            self.raise_irq(reg::INT_PORTS, 0);
        }

        // Swap the finished field to the host.
        self.denise
            .pixel_engine
            .swap_buffers(finished_lof, self.agnus.frame);

        // Sprites restart their control fetch sequence each frame.
        for unit in &mut self.agnus.sprite {
            unit.state = SprDmaState::FetchCtl;
        }

        // The Copper restarts from COP1LC.
        if self.agnus.channel_enabled(reg::DMAF_COPEN) {
            self.agnus
                .schedule_rel(PrimSlot::Cop, dma_cycles(2), EventId::CopRequestDma);
        } else {
            self.agnus
                .scheduler
                .schedule_abs(PrimSlot::Cop, NEVER, EventId::CopRequestDma);
        }
    }

    //
    // Secondary table.
    //

    fn serve_secondary(&mut self) {
        let now = self.agnus.clock;
        for slot in SecSlot::ALL {
            let event = self.agnus.scheduler.secondary[slot as usize];
            if event.trigger > now || event.id == EventId::None {
                continue;
            }
            match event.id {
                EventId::IrqSet => {
                    self.paula.set_irq_bit(event.data as u16);
                    self.agnus.scheduler.sec_cancel(slot);
                }
                EventId::IrqClear => {
                    self.paula.clear_irq_bit(event.data as u16);
                    self.agnus.scheduler.sec_cancel(slot);
                }
                EventId::DchEject => {
                    let nr = event.data as usize & 3;
                    self.df[nr].eject_disk();
                    self.msgs.put_data(MsgType::DriveDiskEject, nr as i64);
                    // The insertion half of the pair keeps the slot.
                    self.agnus
                        .sec_schedule_rel(SecSlot::Dch, msec(1500), EventId::DchInsert, nr as i64);
                }
                EventId::DchInsert => {
                    let nr = event.data as usize & 3;
                    if let Some(disk) = self.pending_insert[nr].take() {
                        self.df[nr].insert_disk(disk);
                        self.msgs.put_data(MsgType::DriveDiskInsert, nr as i64);
                    }
                    self.agnus.scheduler.sec_cancel(slot);
                }
                EventId::InsAmiga
                | EventId::InsCpu
                | EventId::InsMem
                | EventId::InsCia
                | EventId::InsAgnus
                | EventId::InsPaula
                | EventId::InsDenise
                | EventId::InsEvents => {
                    self.inspection_due = true;
                    // Periodic: once per frame.
                    let period = crate::beam::cycles_in_frame(self.agnus.lof);
                    self.agnus.scheduler.sec_reschedule_abs(slot, now + period);
                }
                _ => {
                    self.agnus.scheduler.sec_cancel(slot);
                }
            }
        }
        self.agnus.scheduler.rebuild_sec_mirror();
    }

    /// Route an interrupt request through its secondary slot; `delay`
    /// models the source's latency.
    pub fn raise_irq(&mut self, bit: u16, delay: Cycle) {
        self.agnus
            .sec_schedule_rel(SecSlot::irq(bit), delay, EventId::IrqSet, i64::from(bit));
    }

    //
    // Disks.
    //

    /// Insert a disk. If the drive is occupied, an eject/insert event pair
    /// (1.5 s apart) lets the system software see the change.
    pub fn insert_disk(&mut self, nr: usize, disk: Adf) {
        if self.df[nr].has_disk() {
            self.pending_insert[nr] = Some(disk);
            self.agnus
                .sec_schedule_rel(SecSlot::Dch, dma_cycles(2), EventId::DchEject, nr as i64);
        } else {
            self.df[nr].insert_disk(disk);
            self.msgs.put_data(MsgType::DriveDiskInsert, nr as i64);
        }
    }

    pub fn eject_disk(&mut self, nr: usize) -> Option<Adf> {
        let disk = self.df[nr].eject_disk();
        if disk.is_some() {
            self.msgs.put_data(MsgType::DriveDiskEject, nr as i64);
        }
        disk
    }

    //
    // CIA address decoding.
    //

    fn cia_read(&mut self, addr: u32) -> u8 {
        let regnum = ((addr >> 8) & 0x0F) as u8;
        if addr & 1 != 0 {
            if regnum == 0x00 {
                // Port A inputs: drive status and fire buttons.
                self.ciaa.external_a = self.paula.disk.drive_status(&self.df)
                    & self.port1.pra_mask()
                    & self.port2.pra_mask();
            }
            self.ciaa.read(regnum)
        } else {
            self.ciab.read(regnum)
        }
    }

    fn cia_write(&mut self, addr: u32, value: u8) {
        let regnum = ((addr >> 8) & 0x0F) as u8;
        if addr & 1 != 0 {
            self.ciaa.write(regnum, value);
            match regnum {
                0x00 | 0x02 => {
                    // OVL (PRA bit 0) drives the memory overlay directly.
                    let overlay = self.ciaa.port_a() & 0x01 != 0;
                    if overlay != self.mem.overlay {
                        self.mem.set_overlay(overlay);
                        self.msgs.put(MsgType::MemLayout);
                    }
                }
                0x0C => {
                    // Writing the serial register acknowledges the keyboard.
                    self.keyboard.acknowledge();
                }
                _ => {}
            }
            if self.ciaa.irq_active() {
                self.raise_irq(reg::INT_PORTS, 0);
            }
        } else {
            let motor_before: [bool; 4] = [
                self.df[0].motor,
                self.df[1].motor,
                self.df[2].motor,
                self.df[3].motor,
            ];
            let old = self.ciab.port_b();
            self.ciab.write(regnum, value);
            if regnum == 0x01 || regnum == 0x03 {
                let new = self.ciab.port_b();
                let spinning = self.paula.disk.prb_did_change(old, new, &mut self.df);
                for n in 0..4 {
                    if self.df[n].motor != motor_before[n] {
                        let msg = if self.df[n].motor {
                            MsgType::DriveMotorOn
                        } else {
                            MsgType::DriveMotorOff
                        };
                        self.msgs.put_data(msg, n as i64);
                    }
                }
                if spinning {
                    if !self.agnus.scheduler.is_pending(PrimSlot::Dsk) {
                        self.agnus.schedule_rel(
                            PrimSlot::Dsk,
                            dma_cycles(DSK_ROTATE_PERIOD),
                            EventId::DskRotate,
                        );
                    }
                } else {
                    self.agnus.scheduler.cancel(PrimSlot::Dsk);
                }
            }
            if self.ciab.irq_active() {
                self.raise_irq(reg::INT_EXTER, 0);
            }
        }
    }

    //
    // Custom register file.
    //

    pub fn read_custom16(&mut self, offset: u16) -> u16 {
        let offset = offset & 0x1FE;
        match offset {
            reg::DMACONR => {
                let mut value = self.agnus.dmacon & 0x07FF;
                if self.blitter.running {
                    value |= reg::DMAF_BBUSY;
                }
                if self.blitter.bzero {
                    value |= reg::DMAF_BZERO;
                }
                value
            }
            reg::VPOSR => self.agnus.read_vposr(),
            reg::VHPOSR => self.agnus.read_vhposr(),
            reg::DSKDATR => 0,
            reg::JOY0DAT => self.port1.joydat(),
            reg::JOY1DAT => self.port2.joydat(),
            reg::CLXDAT => self.denise.read_clxdat(),
            reg::ADKCONR => self.paula.adkcon,
            reg::POT0DAT | reg::POT1DAT => 0,
            reg::POTGOR => 0xFF00,
            reg::SERDATR => self.serial.read_serdatr(),
            reg::DSKBYTR => {
                let dma_on = self.agnus.channel_enabled(reg::DMAF_DSKEN);
                self.paula.disk.peek_dskbytr(self.agnus.clock, dma_on)
            }
            reg::INTENAR => self.paula.intena,
            reg::INTREQR => self.paula.intreq,
            _ => 0,
        }
    }

    pub fn write_custom16(&mut self, offset: u16, value: u16) {
        let offset = offset & 0x1FE;
        let clock = self.agnus.clock;
        match offset {
            // Disk
            reg::DSKPTH => Agnus::set_ptr_hi(&mut self.agnus.dskpt, value),
            reg::DSKPTL => Agnus::set_ptr_lo(&mut self.agnus.dskpt, value),
            reg::DSKLEN => self.write_dsklen(value),
            reg::DSKDAT => {}
            reg::DSKSYNC => self.paula.disk.poke_dsksync(value),

            // Beam position writes are accepted and ignored.
            reg::VPOSW | reg::VHPOSW => {}

            // Copper
            reg::COPCON => self.copper.danger = value & 0x02 != 0,
            reg::COP1LCH => Agnus::set_ptr_hi(&mut self.copper.cop1lc, value),
            reg::COP1LCL => Agnus::set_ptr_lo(&mut self.copper.cop1lc, value),
            reg::COP2LCH => Agnus::set_ptr_hi(&mut self.copper.cop2lc, value),
            reg::COP2LCL => Agnus::set_ptr_lo(&mut self.copper.cop2lc, value),
            reg::COPJMP1 => self.copper_strobe(EventId::CopJmp1),
            reg::COPJMP2 => self.copper_strobe(EventId::CopJmp2),

            // Serial
            reg::SERDAT => {
                if self.serial.write_serdat(value) {
                    self.raise_irq(reg::INT_TBE, dma_cycles(8));
                }
                if self.serial.rx_full() {
                    self.raise_irq(reg::INT_RBF, dma_cycles(16));
                }
                self.msgs.put_data(MsgType::SerOut, i64::from(value & 0xFF));
            }
            reg::SERPER => self.serial.serper = value,
            reg::POTGO => {}

            // Blitter
            reg::BLTCON0 => self.blitter.bltcon0 = value,
            reg::BLTCON1 => self.blitter.bltcon1 = value,
            reg::BLTAFWM => self.blitter.afwm = value,
            reg::BLTALWM => self.blitter.alwm = value,
            reg::BLTCPTH => Agnus::set_ptr_hi(&mut self.blitter.cpt, value),
            reg::BLTCPTL => Agnus::set_ptr_lo(&mut self.blitter.cpt, value),
            reg::BLTBPTH => Agnus::set_ptr_hi(&mut self.blitter.bpt, value),
            reg::BLTBPTL => Agnus::set_ptr_lo(&mut self.blitter.bpt, value),
            reg::BLTAPTH => Agnus::set_ptr_hi(&mut self.blitter.apt, value),
            reg::BLTAPTL => Agnus::set_ptr_lo(&mut self.blitter.apt, value),
            reg::BLTDPTH => Agnus::set_ptr_hi(&mut self.blitter.dpt, value),
            reg::BLTDPTL => Agnus::set_ptr_lo(&mut self.blitter.dpt, value),
            reg::BLTSIZE => {
                self.blitter.write_bltsize(value);
                if self.agnus.channel_enabled(reg::DMAF_BLTEN) {
                    self.start_blitter();
                }
            }
            reg::BLTCMOD => self.blitter.cmod = value,
            reg::BLTBMOD => self.blitter.bmod = value,
            reg::BLTAMOD => self.blitter.amod = value,
            reg::BLTDMOD => self.blitter.dmod = value,
            reg::BLTCDAT => self.blitter.cdat = value,
            reg::BLTBDAT => self.blitter.bdat = value,
            reg::BLTADAT => self.blitter.adat = value,

            // Display windows
            reg::DIWSTRT => {
                self.agnus.diwstrt = value;
                self.rebuild_dma_schedule();
            }
            reg::DIWSTOP => {
                self.agnus.diwstop = value;
                self.rebuild_dma_schedule();
            }
            reg::DDFSTRT => {
                self.agnus.ddfstrt = value;
                self.rebuild_dma_schedule();
            }
            reg::DDFSTOP => {
                self.agnus.ddfstop = value;
                self.rebuild_dma_schedule();
            }

            reg::DMACON => self.write_dmacon(value),
            reg::CLXCON => self.denise.write_clxcon(value),
            reg::INTENA => self.paula.write_intena(value),
            reg::INTREQ => self.paula.write_intreq(value),
            reg::ADKCON => self.paula.write_adkcon(value),

            // Audio
            reg::AUD_BASE..=reg::AUD_END => self.paula.audio.write_register(offset, value),

            // Bitplanes
            0x0E0..=0x0F6 => {
                let plane = usize::from((offset - 0x0E0) / 4);
                if offset & 2 == 0 {
                    Agnus::set_ptr_hi(&mut self.agnus.bpl_pt[plane], value);
                } else {
                    Agnus::set_ptr_lo(&mut self.agnus.bpl_pt[plane], value);
                }
            }
            reg::BPLCON0 => {
                self.denise.write_bplcon0(clock, value);
                self.agnus.set_bplcon0(value);
                self.rebuild_dma_schedule();
            }
            reg::BPLCON1 => self.denise.write_bplcon1(clock, value),
            reg::BPLCON2 => self.denise.write_bplcon2(clock, value),
            reg::BPL1MOD => self.agnus.bpl1mod = value,
            reg::BPL2MOD => self.agnus.bpl2mod = value,
            0x110..=0x11A => {
                let plane = usize::from((offset - 0x110) / 2);
                self.denise.write_bpldat(plane, value);
                if plane == 0 {
                    let h = self.agnus.hpos();
                    self.denise.fill_shift_registers(h);
                }
            }

            // Sprites
            0x120..=0x13E => {
                let n = usize::from((offset - 0x120) / 4);
                if offset & 2 == 0 {
                    Agnus::set_ptr_hi(&mut self.agnus.spr_pt[n], value);
                } else {
                    Agnus::set_ptr_lo(&mut self.agnus.spr_pt[n], value);
                }
            }
            0x140..=0x17E => {
                let n = usize::from((offset - 0x140) / 8);
                match (offset - 0x140) % 8 {
                    0 => self.denise.write_sprpos(n, value),
                    2 => self.denise.write_sprctl(n, value),
                    4 => self.denise.write_sprdata(n, value),
                    _ => self.denise.write_sprdatb(n, value),
                }
            }

            // Colour registers
            reg::COLOR00..=reg::COLOR31 => {
                let index = (offset - reg::COLOR00) / 2;
                self.denise.pixel_engine.record_color(clock, index, value);
            }

            _ => {}
        }
    }

    fn write_dsklen(&mut self, value: u16) {
        let wordsync = self.paula.wordsync();
        let turbo = self
            .paula
            .disk
            .selected
            .map(|n| self.df[n].turbo)
            .unwrap_or(false);
        // Arming rewinds the head of the selected drive.
        if let Some(n) = self.paula.disk.selected {
            self.df[n].rewind();
        }
        let outcome = self.paula.disk.poke_dsklen(value, wordsync, turbo);
        if outcome == ArmOutcome::Turbo {
            if let Some(n) = self.paula.disk.selected {
                let mut dskpt = self.agnus.dskpt;
                let result =
                    self.paula
                        .disk
                        .perform_turbo_dma(&mut self.df[n], &mut self.mem, &mut dskpt);
                self.agnus.dskpt = dskpt;
                if result.raise_dskblk {
                    self.raise_irq(reg::INT_DSKBLK, dma_cycles(TURBO_DSKBLK_DELAY));
                }
            }
        }
        self.rebuild_dma_schedule();
    }

    fn write_dmacon(&mut self, value: u16) {
        let old = self.agnus.dmacon;
        self.agnus.write_dmacon(value);
        let new = self.agnus.dmacon;

        // Audio channels follow their enables.
        let irqs = self.paula.audio.sync_dmacon(new);
        self.paula.intreq |= irqs;

        // Copper enable: wake a parked Copper slot.
        let copen = reg::DMAF_DMAEN | reg::DMAF_COPEN;
        if new & copen == copen && old & copen != copen {
            if self.agnus.scheduler.has_event(PrimSlot::Cop)
                && !self.agnus.scheduler.is_pending(PrimSlot::Cop)
            {
                self.agnus.reschedule_rel(PrimSlot::Cop, dma_cycles(2));
            }
        }

        // Blitter enable with a blit armed and no event in flight.
        let blten = reg::DMAF_DMAEN | reg::DMAF_BLTEN;
        if new & blten == blten
            && old & blten != blten
            && self.blitter.running
            && !self.agnus.scheduler.is_pending(PrimSlot::Blt)
        {
            self.start_blitter();
        }

        self.rebuild_dma_schedule();
    }

    fn copper_strobe(&mut self, id: EventId) {
        self.copper.active = true;
        self.agnus.schedule_rel(PrimSlot::Cop, dma_cycles(2), id);
    }

    //
    // RTC decoding.
    //

    fn rtc_read(&self, addr: u32) -> u8 {
        self.rtc.read(((addr >> 2) & 0x0F) as u8)
    }

    fn rtc_write(&mut self, addr: u32, value: u8) {
        self.rtc.write(((addr >> 2) & 0x0F) as u8, value);
    }

    //
    // Watchpoints.
    //

    fn check_watchpoint(&mut self, addr: u32) {
        if self.watchpoints_enabled && self.watchpoints.check(addr) {
            self.watchpoint_hit = Some(addr);
        }
    }

    /// Chip bus wait states for a CPU access at the current beam position.
    fn chip_wait(&self) -> u8 {
        dma::cpu_wait_at(&self.agnus, self.agnus.hpos())
    }
}

//
// The CPU's bus protocol.
//

impl M68kBus for AmigaBus {
    fn read_word(&mut self, addr: u32, _fc: FunctionCode) -> BusAccess {
        let addr = addr & 0x00FF_FFFE;
        match self.mem.src(addr) {
            MemSrc::Cia => {
                let hi = self.cia_read(addr);
                let lo = self.cia_read(addr | 1);
                BusAccess::ready(u16::from(hi) << 8 | u16::from(lo))
            }
            MemSrc::Custom => BusAccess::ready(self.read_custom16((addr & 0x1FE) as u16)),
            MemSrc::Rtc => {
                let value = self.rtc_read(addr | 1);
                BusAccess::ready(u16::from(value))
            }
            MemSrc::ChipRam | MemSrc::SlowRam => {
                self.check_watchpoint(addr);
                let wait = self.chip_wait();
                let hi = self.mem.read8(addr);
                let lo = self.mem.read8(addr | 1);
                BusAccess::delayed(u16::from(hi) << 8 | u16::from(lo), wait)
            }
            _ => {
                let hi = self.mem.read8(addr);
                let lo = self.mem.read8(addr | 1);
                BusAccess::ready(u16::from(hi) << 8 | u16::from(lo))
            }
        }
    }

    fn write_word(&mut self, addr: u32, value: u16, _fc: FunctionCode) -> BusAccess {
        let addr = addr & 0x00FF_FFFE;
        match self.mem.src(addr) {
            MemSrc::Cia => {
                self.cia_write(addr, (value >> 8) as u8);
                self.cia_write(addr | 1, value as u8);
                BusAccess::ready(0)
            }
            MemSrc::Custom => {
                self.write_custom16((addr & 0x1FE) as u16, value);
                BusAccess::ready(0)
            }
            MemSrc::Rtc => {
                self.rtc_write(addr | 1, value as u8);
                BusAccess::ready(0)
            }
            MemSrc::ChipRam | MemSrc::SlowRam => {
                self.check_watchpoint(addr);
                let wait = self.chip_wait();
                self.mem.write8(addr, (value >> 8) as u8);
                self.mem.write8(addr | 1, value as u8);
                BusAccess::delayed(0, wait)
            }
            _ => {
                self.mem.write8(addr, (value >> 8) as u8);
                self.mem.write8(addr | 1, value as u8);
                BusAccess::ready(0)
            }
        }
    }

    fn read_byte(&mut self, addr: u32, _fc: FunctionCode) -> BusAccess {
        let addr = addr & 0x00FF_FFFF;
        match self.mem.src(addr) {
            MemSrc::Cia => BusAccess::ready(u16::from(self.cia_read(addr))),
            MemSrc::Custom => {
                let word = self.read_custom16((addr & 0x1FE) as u16);
                let byte = if addr & 1 == 0 {
                    (word >> 8) as u8
                } else {
                    word as u8
                };
                BusAccess::ready(u16::from(byte))
            }
            MemSrc::Rtc => BusAccess::ready(u16::from(self.rtc_read(addr))),
            MemSrc::ChipRam | MemSrc::SlowRam => {
                self.check_watchpoint(addr);
                BusAccess::delayed(u16::from(self.mem.read8(addr)), self.chip_wait())
            }
            _ => BusAccess::ready(u16::from(self.mem.read8(addr))),
        }
    }

    fn write_byte(&mut self, addr: u32, value: u8, _fc: FunctionCode) -> BusAccess {
        let addr = addr & 0x00FF_FFFF;
        match self.mem.src(addr) {
            MemSrc::Cia => {
                self.cia_write(addr, value);
                BusAccess::ready(0)
            }
            MemSrc::Custom => {
                // A byte write drives only one half of the data bus; the
                // register sees it in the addressed position.
                let word = if addr & 1 == 0 {
                    u16::from(value) << 8
                } else {
                    u16::from(value)
                };
                self.write_custom16((addr & 0x1FE) as u16, word);
                BusAccess::ready(0)
            }
            MemSrc::Rtc => {
                self.rtc_write(addr, value);
                BusAccess::ready(0)
            }
            MemSrc::ChipRam | MemSrc::SlowRam => {
                self.check_watchpoint(addr);
                let wait = self.chip_wait();
                self.mem.write8(addr, value);
                BusAccess::delayed(0, wait)
            }
            _ => {
                self.mem.write8(addr, value);
                BusAccess::ready(0)
            }
        }
    }

    fn interrupt_ack(&mut self, level: u8) -> u8 {
        24 + level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmigaConfig;

    fn bus() -> AmigaBus {
        let mut bus = AmigaBus::new(&AmigaConfig::a500(), MessageQueue::new());
        bus.mem.load_rom(vec![0u8; 256 * 1024]);
        bus.hard_reset();
        bus
    }

    #[test]
    fn hard_reset_schedules_standing_events() {
        let bus = bus();
        assert!(bus.agnus.scheduler.is_pending(PrimSlot::Ciaa));
        assert!(bus.agnus.scheduler.is_pending(PrimSlot::Ciab));
        assert!(bus.agnus.scheduler.is_pending(PrimSlot::Ras));
        assert!(bus.agnus.scheduler.next_primary_trigger() > 0);
    }

    #[test]
    fn execute_until_advances_clock_and_lines() {
        let mut bus = bus();
        let one_line = crate::beam::CYCLES_PER_LINE;
        bus.execute_until(one_line + 8);
        assert_eq!(bus.agnus.clock, one_line + 8);
        assert_eq!(bus.agnus.pos_v, 1);
    }

    #[test]
    fn chip_clocks_trail_master_clock() {
        let mut bus = bus();
        bus.execute_until(100_000);
        assert!(bus.ciaa.clock <= bus.agnus.clock);
        assert!(bus.ciab.clock <= bus.agnus.clock);
        assert!(bus.denise.clock <= bus.agnus.clock);
    }

    #[test]
    fn intena_intreq_round_trip() {
        let mut bus = bus();
        bus.write_custom16(reg::INTENA, 0xC010);
        assert_eq!(bus.read_custom16(reg::INTENAR), 0x4010);
        bus.write_custom16(reg::INTREQ, 0x8010);
        assert_eq!(bus.read_custom16(reg::INTREQR) & 0x0010, 0x0010);
        bus.write_custom16(reg::INTREQ, 0x0010);
        assert_eq!(bus.read_custom16(reg::INTREQR) & 0x0010, 0);
    }

    #[test]
    fn vertb_interrupt_fires_each_frame() {
        let mut bus = bus();
        bus.write_custom16(reg::INTENA, 0xC020);
        bus.execute_until(crate::beam::cycles_in_frame(true) + 1000);
        assert_ne!(bus.paula.intreq & (1 << reg::INT_VERTB), 0);
        assert_eq!(bus.paula.compute_ipl(), 3);
    }

    #[test]
    fn color_writes_reach_the_palette_at_line_end() {
        let mut bus = bus();
        bus.write_custom16(reg::COLOR00, 0x0A5A);
        // Not applied until the raster handler flushes the line.
        assert_eq!(bus.denise.pixel_engine.color(0), 0);
        bus.execute_until(crate::beam::CYCLES_PER_LINE + 8);
        assert_eq!(bus.denise.pixel_engine.color(0), 0x0A5A);
    }

    #[test]
    fn overlay_follows_cia_a_pra() {
        let mut bus = bus();
        assert!(bus.mem.overlay);
        let fc = FunctionCode::SupervisorData;
        bus.write_byte(0xBFE201, 0x01, fc); // DDRA bit 0 output
        bus.write_byte(0xBFE001, 0x00, fc); // OVL low
        assert!(!bus.mem.overlay);
    }

    #[test]
    fn motor_on_schedules_rotation_events() {
        let mut bus = bus();
        let fc = FunctionCode::SupervisorData;
        // DDRB all output, then select df0 with motor on (active low).
        bus.write_byte(0xBFD300, 0xFF, fc);
        bus.write_byte(0xBFD100, !(0x80 | 0x08), fc);
        assert!(bus.df[0].motor);
        assert!(bus.agnus.scheduler.is_pending(PrimSlot::Dsk));
        // Motor off cancels them.
        bus.write_byte(0xBFD100, !0x08, fc);
        assert!(!bus.df[0].motor);
        assert!(!bus.agnus.scheduler.is_pending(PrimSlot::Dsk));
    }

    #[test]
    fn dskbytr_reflects_write_mode() {
        let mut bus = bus();
        bus.write_custom16(reg::DSKLEN, 0xC000);
        bus.write_custom16(reg::DSKLEN, 0xC004);
        let value = bus.read_custom16(reg::DSKBYTR);
        assert_ne!(value & 0x2000, 0);
    }

    #[test]
    fn blitter_runs_through_the_event_slot() {
        let mut bus = bus();
        bus.mem.write_chip16(0x1000, 0x1234);
        bus.write_custom16(reg::DMACON, 0x8000 | reg::DMAF_DMAEN | reg::DMAF_BLTEN);
        bus.write_custom16(reg::BLTCON0, 0x09F0);
        bus.write_custom16(reg::BLTAFWM, 0xFFFF);
        bus.write_custom16(reg::BLTALWM, 0xFFFF);
        bus.write_custom16(reg::BLTAPTH, 0);
        bus.write_custom16(reg::BLTAPTL, 0x1000);
        bus.write_custom16(reg::BLTDPTH, 0);
        bus.write_custom16(reg::BLTDPTL, 0x2000);
        bus.write_custom16(reg::INTENA, 0xC000 | (1 << reg::INT_BLIT));
        bus.write_custom16(reg::BLTSIZE, (1 << 6) | 1);
        assert!(bus.blitter.running);
        assert_ne!(bus.read_custom16(reg::DMACONR) & reg::DMAF_BBUSY, 0);

        bus.execute_until(bus.agnus.clock + dma_cycles(64));
        assert!(!bus.blitter.running);
        assert_eq!(bus.mem.read_chip16(0x2000), 0x1234);
        assert_ne!(bus.paula.intreq & (1 << reg::INT_BLIT), 0);
    }
}
