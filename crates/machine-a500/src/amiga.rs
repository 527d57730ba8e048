//! The machine root and the run loop.
//!
//! Components are created once, in dependency order, and live inside the
//! machine for its whole life; disks and ROMs are the only payloads that
//! ever get swapped. The run loop alternates between one CPU instruction
//! and draining the scheduler to the new CPU clock, then honors the
//! control flags. All chip state is touched only by the thread running
//! the loop; the host reaches in through the shared access lock (info and
//! stats snapshots, stable framebuffers) and the atomic control flags.

#![allow(clippy::cast_possible_truncation)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use format_adf::Adf;
use format_rom::RomFile;

use crate::breakpoints::Guard;
use crate::bus::AmigaBus;
use crate::config::{
    AmigaConfig, BlitterAccuracy, ConfigOption, DriveOption, FilterActivation, FilterType,
};
use crate::cpu::Cpu;
use crate::cycles::{Cycle, PAL_CRYSTAL_HZ};
use crate::events::{EventId, SecSlot};
use crate::messages::{MessageQueue, MsgType};
use crate::serial::SerialDevice;
use crate::snapshot::{Snapshot, SnapshotError, SnapshotReader, SnapshotWriter};

// Run loop control flags.
pub const RL_SNAPSHOT: u32 = 1 << 0;
pub const RL_INSPECT: u32 = 1 << 1;
pub const RL_TRACE: u32 = 1 << 2;
pub const RL_BREAKPOINTS: u32 = 1 << 3;
pub const RL_STOP: u32 = 1 << 4;

/// Wall-clock drift beyond which the timer base resets instead of trying
/// to catch up.
const MAX_DRIFT: Duration = Duration::from_millis(200);

const MAX_SNAPSHOTS: usize = 8;

/// Power/run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    PoweredOff,
    Paused,
    Running,
}

/// Host input event, queued from the UI thread and drained by the worker
/// at frame boundaries.
#[derive(Debug, Clone, Copy)]
pub enum InputEvent {
    /// Raw Amiga key code.
    Key { code: u8, pressed: bool },
    MouseButton { port: usize, pressed: bool },
    MouseMove { dx: i16, dy: i16 },
}

/// Clonable handle for posting input events from the host.
#[derive(Clone, Default)]
pub struct InputQueue {
    events: Arc<Mutex<Vec<InputEvent>>>,
}

impl InputQueue {
    pub fn push(&self, event: InputEvent) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }

    fn drain(&self) -> Vec<InputEvent> {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut events)
    }
}

/// Inspection snapshot published under the shared lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaInfo {
    pub cpu_clock: Cycle,
    pub dma_clock: Cycle,
    pub ciaa_clock: Cycle,
    pub ciab_clock: Cycle,
    pub frame: i64,
    pub vpos: u16,
    pub hpos: u16,
    pub pc: u32,
}

/// Counters published under the shared lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaStats {
    pub frames: u64,
    pub audio_overruns: u64,
    pub messages_dropped: u64,
}

/// Shared state guarded by the single access lock.
#[derive(Default)]
pub struct SharedState {
    pub info: AmigaInfo,
    pub stats: AmigaStats,
}

pub struct Amiga {
    pub cpu: Cpu,
    pub bus: AmigaBus,
    config: AmigaConfig,
    state: EmuState,
    ctrl: Arc<AtomicU32>,
    pub warp: bool,
    debug_mode: bool,
    msgs: MessageQueue,
    shared: Arc<Mutex<SharedState>>,
    input: InputQueue,
    /// Per-frame audio hand-off to the host; a full channel drops the
    /// frame and counts it as an overrun.
    audio_tx: Option<std::sync::mpsc::SyncSender<Vec<f32>>>,
    aros_rom: bool,

    auto_snapshots: Vec<Snapshot>,
    user_snapshots: Vec<Snapshot>,

    // Host-timer synchronization.
    time_base: Instant,
    clock_base: Cycle,
    synced_frame: i64,
}

impl Amiga {
    #[must_use]
    pub fn new(config: AmigaConfig) -> Self {
        let msgs = MessageQueue::new();
        let mut amiga = Self {
            cpu: Cpu::new(),
            bus: AmigaBus::new(&config, msgs.clone()),
            config,
            state: EmuState::PoweredOff,
            ctrl: Arc::new(AtomicU32::new(0)),
            warp: false,
            debug_mode: false,
            msgs,
            shared: Arc::new(Mutex::new(SharedState::default())),
            input: InputQueue::default(),
            audio_tx: None,
            aros_rom: false,
            auto_snapshots: Vec::new(),
            user_snapshots: Vec::new(),
            time_base: Instant::now(),
            clock_base: 0,
            synced_frame: 0,
        };
        amiga.cpu.speed = amiga.config.cpu_speed;
        amiga
    }

    //
    // Handles for the host side.
    //

    #[must_use]
    pub fn message_queue(&self) -> MessageQueue {
        self.msgs.clone()
    }

    #[must_use]
    pub fn ctrl_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.ctrl)
    }

    #[must_use]
    pub fn shared_handle(&self) -> Arc<Mutex<SharedState>> {
        Arc::clone(&self.shared)
    }

    #[must_use]
    pub fn input_queue(&self) -> InputQueue {
        self.input.clone()
    }

    /// Attach the audio hand-off channel; the receiver side feeds the host
    /// audio ring.
    pub fn audio_receiver(&mut self) -> std::sync::mpsc::Receiver<Vec<f32>> {
        let (tx, rx) = std::sync::mpsc::sync_channel(8);
        self.audio_tx = Some(tx);
        rx
    }

    #[must_use]
    pub fn config(&self) -> &AmigaConfig {
        &self.config
    }

    pub fn set_control_flags(&self, flags: u32) {
        self.ctrl.fetch_or(flags, Ordering::SeqCst);
    }

    pub fn clear_control_flags(&self, flags: u32) {
        self.ctrl.fetch_and(!flags, Ordering::SeqCst);
    }

    /// Turn tracing and breakpoint evaluation on or off together.
    pub fn set_debug_mode(&mut self, enable: bool) {
        self.debug_mode = enable;
        if enable {
            self.set_control_flags(RL_TRACE | RL_BREAKPOINTS);
        } else {
            self.clear_control_flags(RL_TRACE | RL_BREAKPOINTS);
        }
    }

    /// Register an inspection target as a normal slot registration in the
    /// scheduler; the matching event refreshes the info structs once per
    /// frame.
    pub fn set_inspection_target(&mut self, id: EventId) {
        self.bus
            .agnus
            .sec_schedule_rel(SecSlot::Ins, 0, id, 0);
    }

    pub fn clear_inspection_target(&mut self) {
        self.bus.agnus.scheduler.sec_cancel(SecSlot::Ins);
    }

    //
    // Configuration. Validation precedes mutation; invalid values are
    // rejected with no side effect.
    //

    pub fn configure(&mut self, option: ConfigOption, value: i64) -> bool {
        match option {
            ConfigOption::AgnusRevision | ConfigOption::DeniseRevision | ConfigOption::RtClock => {
                if !(0..=1).contains(&value) {
                    return false;
                }
                if option == ConfigOption::RtClock {
                    self.config.rtc_enabled = value == 1;
                    self.bus.mem.rtc_mapped = value == 1;
                    self.bus.mem.update_bank_map();
                }
            }
            ConfigOption::ChipRam => {
                if ![256, 512, 1024, 2048].contains(&value) {
                    return false;
                }
                self.config.chip_ram_kb = value as usize;
                self.bus.mem.alloc_chip(value as usize);
            }
            ConfigOption::SlowRam => {
                if value % 256 != 0 || value > 512 || value < 0 {
                    return false;
                }
                self.config.slow_ram_kb = value as usize;
                self.bus.mem.alloc_slow(value as usize);
            }
            ConfigOption::FastRam => {
                if value % 64 != 0 || value > 8192 || value < 0 {
                    return false;
                }
                self.config.fast_ram_kb = value as usize;
                self.bus.mem.alloc_fast(value as usize);
            }
            ConfigOption::ExtRomStart => {
                if value != 0xE0 && value != 0xF0 {
                    return false;
                }
                self.config.ext_rom_start = value as u8;
                self.bus.mem.set_ext_start(value as u8);
            }
            ConfigOption::EmulateSprites => {
                self.config.emulate_sprites = value != 0;
                self.bus.denise.emulate_sprites = value != 0;
            }
            ConfigOption::ClxSprSpr => {
                self.config.clx_spr_spr = value != 0;
                self.bus.denise.clx_spr_spr = value != 0;
            }
            ConfigOption::ClxSprPlf => {
                self.config.clx_spr_plf = value != 0;
                self.bus.denise.clx_spr_plf = value != 0;
            }
            ConfigOption::ClxPlfPlf => {
                self.config.clx_plf_plf = value != 0;
                self.bus.denise.clx_plf_plf = value != 0;
            }
            ConfigOption::FilterActivation => {
                self.config.filter_activation = match value {
                    0 => FilterActivation::Never,
                    1 => FilterActivation::PowerLed,
                    2 => FilterActivation::Always,
                    _ => return false,
                };
            }
            ConfigOption::FilterType => {
                self.config.filter_type = match value {
                    0 => FilterType::Butterworth,
                    1 => FilterType::None,
                    _ => return false,
                };
            }
            ConfigOption::CpuSpeed => {
                if ![1, 2, 4].contains(&value) {
                    return false;
                }
                self.config.cpu_speed = value as u32;
                self.cpu.speed = value as u32;
            }
            ConfigOption::BlitterAccuracy => {
                self.config.blitter_accuracy = match value {
                    0 => BlitterAccuracy::Fast,
                    1 => BlitterAccuracy::CycleExact,
                    _ => return false,
                };
                self.bus.blitter_accuracy = self.config.blitter_accuracy;
            }
            ConfigOption::FifoBuffering => {
                self.config.fifo_buffering = value != 0;
                self.bus.paula.disk.use_fifo = value != 0;
            }
            ConfigOption::SerialDevice => {
                self.config.serial_loopback = match value {
                    0 => false,
                    1 => true,
                    _ => return false,
                };
                self.bus.serial.device = if value == 1 {
                    SerialDevice::Loopback
                } else {
                    SerialDevice::None
                };
            }
            ConfigOption::DriveSpeed => {
                if !(1..=64).contains(&value) {
                    return false;
                }
                self.config.drive_speed = value as u32;
                self.bus.paula.disk.speed = value as u32;
            }
        }
        self.msgs.put(MsgType::Config);
        true
    }

    pub fn configure_drive(&mut self, nr: usize, option: DriveOption, value: i64) -> bool {
        if nr >= 4 {
            return false;
        }
        match option {
            DriveOption::Connect => {
                // The internal drive cannot be unplugged.
                if nr == 0 && value == 0 {
                    return false;
                }
                let connect = value != 0;
                self.config.drives[nr].connected = connect;
                self.bus.paula.disk.connected[nr] = connect;
                self.msgs.put_data(
                    if connect {
                        MsgType::DriveConnect
                    } else {
                        MsgType::DriveDisconnect
                    },
                    nr as i64,
                );
            }
            DriveOption::Type => {
                // Only the 3.5" DD mechanism (0) and its turbo variant (1)
                // exist.
                match value {
                    0 => self.bus.df[nr].turbo = false,
                    1 => self.bus.df[nr].turbo = true,
                    _ => return false,
                }
                self.config.drives[nr].turbo = value == 1;
            }
        }
        self.msgs.put(MsgType::Config);
        true
    }

    //
    // Payloads.
    //

    pub fn load_rom(&mut self, rom: RomFile) {
        self.aros_rom = rom.is_aros();
        self.bus.mem.load_rom(rom.data().to_vec());
        self.msgs.put(MsgType::MemLayout);
    }

    /// Load a ROM image without signature checking (test harnesses).
    pub fn load_rom_unchecked(&mut self, data: Vec<u8>) {
        self.aros_rom = false;
        self.bus.mem.load_rom(data);
    }

    pub fn insert_disk(&mut self, nr: usize, disk: Adf) {
        self.bus.insert_disk(nr, disk);
    }

    pub fn eject_disk(&mut self, nr: usize) -> Option<Adf> {
        self.bus.eject_disk(nr)
    }

    //
    // Power and run state.
    //

    #[must_use]
    pub fn is_powered_off(&self) -> bool {
        self.state == EmuState::PoweredOff
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state == EmuState::Paused
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == EmuState::Running
    }

    /// Check the power-up preconditions, reporting failures through the
    /// message queue.
    pub fn ready_to_power_on(&self) -> bool {
        if !self.bus.mem.has_chip_ram() {
            self.msgs.put(MsgType::ChipRamLimit);
            return false;
        }
        if !self.bus.mem.has_rom() {
            self.msgs.put(MsgType::RomMissing);
            return false;
        }
        if self.aros_rom && self.bus.mem.chip_ram_bytes() + self.bus.mem.slow_ram_bytes() < 1 << 20
        {
            self.msgs.put(MsgType::ArosRamLimit);
            return false;
        }
        true
    }

    /// Power on into the paused state. Fails (with a message) when no ROM
    /// is loaded or memory is insufficient.
    pub fn power_on(&mut self) -> bool {
        if self.state != EmuState::PoweredOff {
            return true;
        }
        if !self.ready_to_power_on() {
            return false;
        }
        self.hard_reset();
        self.state = EmuState::Paused;
        self.msgs.put(MsgType::PowerOn);
        self.msgs.put(MsgType::PowerLedOn);
        true
    }

    pub fn power_off(&mut self) {
        if self.state == EmuState::PoweredOff {
            return;
        }
        self.state = EmuState::PoweredOff;
        self.msgs.put(MsgType::PowerOff);
        self.msgs.put(MsgType::PowerLedOff);
    }

    /// Reset to the power-on state (keeps configuration and payloads).
    pub fn hard_reset(&mut self) {
        self.bus.hard_reset();
        self.cpu.reset(&mut self.bus);
        self.msgs.put(MsgType::Reset);
    }

    pub fn set_warp(&mut self, warp: bool) {
        if self.warp == warp {
            return;
        }
        self.warp = warp;
        if warp {
            self.msgs.put(MsgType::WarpOn);
        } else {
            self.restart_timer();
            self.msgs.put(MsgType::WarpOff);
        }
    }

    //
    // Single stepping (used while paused).
    //

    /// Run until the next instruction has executed (step into).
    pub fn step_into(&mut self) {
        if self.state != EmuState::Paused {
            return;
        }
        self.execute_one_instruction();
        self.msgs
            .put_data(MsgType::BreakpointReached, i64::from(self.cpu.pc()));
    }

    /// Arm a soft breakpoint past the current instruction and report where
    /// execution stops (step over).
    pub fn step_over(&mut self) {
        if self.state != EmuState::Paused {
            return;
        }
        let next = self.next_instruction_addr();
        self.cpu.breakpoints.set_soft(next);
        self.set_control_flags(RL_BREAKPOINTS);
        loop {
            self.execute_one_instruction();
            if self.cpu.breakpoints.check(self.cpu.pc()) {
                break;
            }
        }
        self.msgs
            .put_data(MsgType::BreakpointReached, i64::from(self.cpu.pc()));
    }

    /// Address of the instruction following the current one, derived by
    /// decoding its length (enough for the step-over use case).
    #[must_use]
    pub fn next_instruction_addr(&self) -> u32 {
        let pc = self.cpu.pc();
        let opcode = self.spypeek16(pc);
        pc.wrapping_add(instruction_bytes(opcode, self.spypeek16(pc.wrapping_add(2))))
    }

    /// Side-effect-free word read for inspection.
    #[must_use]
    pub fn spypeek16(&self, addr: u32) -> u16 {
        let hi = self.bus.mem.spypeek8(addr & !1);
        let lo = self.bus.mem.spypeek8(addr | 1);
        u16::from(hi) << 8 | u16::from(lo)
    }

    /// One iteration of the run loop body, without control-flag handling.
    pub fn execute_one_instruction(&mut self) {
        let ipl = self.bus.paula.compute_ipl();
        self.cpu.core.set_ipl(ipl);
        let target = self.cpu.execute_instruction(&mut self.bus);
        self.bus.execute_until(target);
    }

    //
    // The run loop.
    //

    /// Body of the emulation thread. Returns when STOP is set, a
    /// breakpoint fires, or a watchpoint fires.
    pub fn run_loop(&mut self) {
        self.state = EmuState::Running;
        self.msgs.put(MsgType::Run);
        self.restart_timer();

        loop {
            self.execute_one_instruction();

            // Frame boundary: host-timer sync, input/audio exchange, auto
            // snapshot cadence.
            let frame = self.bus.agnus.frame;
            if frame != self.synced_frame {
                self.synced_frame = frame;
                if !self.warp {
                    self.synchronize_timing();
                }
                self.apply_input();
                self.ship_audio();
                if self.snapshot_is_due() {
                    self.set_control_flags(RL_SNAPSHOT);
                }
                self.update_stats();
            }

            let ctrl = self.ctrl.load(Ordering::SeqCst);
            if ctrl == 0 && !self.bus.inspection_due {
                continue;
            }

            if ctrl & RL_SNAPSHOT != 0 {
                self.take_auto_snapshot();
                self.clear_control_flags(RL_SNAPSHOT);
            }
            if ctrl & RL_INSPECT != 0 || self.bus.inspection_due {
                self.bus.inspection_due = false;
                self.inspect();
                self.clear_control_flags(RL_INSPECT);
            }
            if ctrl & RL_TRACE != 0 {
                self.cpu.record_instruction();
            }
            if ctrl & RL_BREAKPOINTS != 0 {
                let pc = self.cpu.pc();
                if self.cpu.breakpoints.check(pc) {
                    self.inspect();
                    self.msgs
                        .put_data(MsgType::BreakpointReached, i64::from(pc));
                    break;
                }
                if let Some(addr) = self.bus.watchpoint_hit.take() {
                    self.inspect();
                    self.msgs
                        .put_data(MsgType::WatchpointReached, i64::from(addr));
                    break;
                }
            }
            if ctrl & RL_STOP != 0 {
                self.clear_control_flags(RL_STOP);
                break;
            }
        }

        self.state = EmuState::Paused;
        self.inspect();
        self.msgs.put(MsgType::Pause);
    }

    fn apply_input(&mut self) {
        for event in self.input.drain() {
            match event {
                InputEvent::Key { code, pressed } => {
                    self.bus.keyboard.key_event(code, pressed);
                }
                InputEvent::MouseButton { port, pressed } => {
                    if port == 0 {
                        self.bus.port1.button = pressed;
                    } else {
                        self.bus.port2.button = pressed;
                    }
                }
                InputEvent::MouseMove { dx, dy } => {
                    self.bus.port1.mouse_moved(dx, dy);
                }
            }
        }
    }

    fn ship_audio(&mut self) {
        let samples = self.bus.paula.audio.drain_frame();
        if samples.is_empty() {
            return;
        }
        if let Some(tx) = &self.audio_tx {
            if tx.try_send(samples).is_err() {
                self.bus.paula.audio.overrun_count += 1;
            }
        }
    }

    pub fn add_breakpoint(&mut self, addr: u32) {
        self.cpu.breakpoints.add(Guard::at(addr));
        self.set_control_flags(RL_BREAKPOINTS);
    }

    pub fn add_watchpoint(&mut self, addr: u32) {
        self.bus.watchpoints.add(Guard::at(addr));
        self.bus.watchpoints_enabled = true;
        self.set_control_flags(RL_BREAKPOINTS);
    }

    //
    // Host-timer synchronization.
    //

    fn restart_timer(&mut self) {
        self.time_base = Instant::now();
        self.clock_base = self.bus.agnus.clock;
    }

    /// Sleep until wall clock catches up with simulated time. Drift beyond
    /// the limit in either direction resets the base instead.
    fn synchronize_timing(&mut self) {
        let elapsed_sim = self.bus.agnus.clock - self.clock_base;
        let target =
            Duration::from_nanos((elapsed_sim as u64).saturating_mul(1_000_000_000) / PAL_CRYSTAL_HZ as u64);
        let elapsed_host = self.time_base.elapsed();

        if elapsed_host > target {
            if elapsed_host - target > MAX_DRIFT {
                self.restart_timer();
            }
            return;
        }
        let ahead = target - elapsed_host;
        if ahead > MAX_DRIFT {
            self.restart_timer();
            return;
        }
        std::thread::sleep(ahead);
    }

    //
    // Inspection.
    //

    /// Publish the info snapshot under the shared lock.
    pub fn inspect(&mut self) {
        let info = AmigaInfo {
            cpu_clock: self.cpu.clock,
            dma_clock: self.bus.agnus.clock,
            ciaa_clock: self.bus.ciaa.clock,
            ciab_clock: self.bus.ciab.clock,
            frame: self.bus.agnus.frame,
            vpos: self.bus.agnus.pos_v,
            hpos: self.bus.agnus.hpos(),
            pc: self.cpu.pc(),
        };
        let mut shared = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shared.info = info;
    }

    fn update_stats(&mut self) {
        let mut shared = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shared.stats.frames += 1;
        shared.stats.audio_overruns = self.bus.paula.audio.overrun_count;
        shared.stats.messages_dropped = self.msgs.dropped();
    }

    #[must_use]
    pub fn info(&self) -> AmigaInfo {
        match self.shared.lock() {
            Ok(guard) => guard.info,
            Err(poisoned) => poisoned.into_inner().info,
        }
    }

    //
    // Snapshots.
    //

    fn snapshot_is_due(&self) -> bool {
        let interval = self.config.snapshot_interval_frames;
        interval > 0 && self.bus.agnus.frame % interval == 0
    }

    pub fn take_auto_snapshot(&mut self) {
        if self.auto_snapshots.len() >= MAX_SNAPSHOTS {
            self.auto_snapshots.pop();
        }
        let snapshot = Snapshot::capture(self);
        self.auto_snapshots.insert(0, snapshot);
        self.msgs.put(MsgType::AutoSnapshotSaved);
    }

    pub fn take_user_snapshot(&mut self) {
        if self.user_snapshots.len() >= MAX_SNAPSHOTS {
            self.user_snapshots.pop();
        }
        let snapshot = Snapshot::capture(self);
        self.user_snapshots.insert(0, snapshot);
        self.msgs.put(MsgType::UserSnapshotSaved);
    }

    pub fn restore_auto_snapshot(&mut self, nr: usize) -> Result<(), SnapshotError> {
        let snapshot = self
            .auto_snapshots
            .get(nr)
            .cloned()
            .ok_or(SnapshotError::Truncated)?;
        snapshot.apply(self)?;
        self.msgs.put(MsgType::AutoSnapshotLoaded);
        Ok(())
    }

    pub fn restore_user_snapshot(&mut self, nr: usize) -> Result<(), SnapshotError> {
        let snapshot = self
            .user_snapshots
            .get(nr)
            .cloned()
            .ok_or(SnapshotError::Truncated)?;
        snapshot.apply(self)?;
        self.msgs.put(MsgType::UserSnapshotLoaded);
        Ok(())
    }

    //
    // Machine-level (de)serialization, component order fixed.
    //

    pub(crate) fn save_state(&self, w: &mut SnapshotWriter) {
        // CPU.
        for &d in &self.cpu.core.regs.d {
            w.put_u32(d);
        }
        for &a in &self.cpu.core.regs.a {
            w.put_u32(a);
        }
        w.put_u32(self.cpu.core.regs.usp);
        w.put_u32(self.cpu.core.regs.ssp);
        w.put_u32(self.cpu.core.regs.pc);
        w.put_u16(self.cpu.core.regs.sr);
        w.put_bool(self.cpu.core.is_stopped());
        w.put_u8(self.cpu.core.ipl());
        w.put_i64(self.cpu.clock);

        self.bus.mem.save_state(w);
        self.bus.agnus.save_state(w);
        self.bus.ciaa.save_state(w);
        self.bus.ciab.save_state(w);

        // Paula.
        w.put_u16(self.bus.paula.intena);
        w.put_u16(self.bus.paula.intreq);
        w.put_u16(self.bus.paula.adkcon);
        self.bus.paula.audio.save_state(w);
        self.bus.paula.disk.save_state(w);

        self.bus.copper.save_state(w);
        self.bus.blitter.save_state(w);
        self.bus.denise.save_state(w);
        self.bus.serial.save_state(w);
        for drive in &self.bus.df {
            drive.save_state(w);
        }
    }

    pub(crate) fn load_state(&mut self, r: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
        for d in &mut self.cpu.core.regs.d {
            *d = r.get_u32()?;
        }
        for a in &mut self.cpu.core.regs.a {
            *a = r.get_u32()?;
        }
        self.cpu.core.regs.usp = r.get_u32()?;
        self.cpu.core.regs.ssp = r.get_u32()?;
        self.cpu.core.regs.pc = r.get_u32()?;
        self.cpu.core.regs.sr = r.get_u16()?;
        let stopped = r.get_bool()?;
        self.cpu.core.set_stopped(stopped);
        self.cpu.core.set_ipl(r.get_u8()?);
        self.cpu.clock = r.get_i64()?;

        self.bus.mem.load_state(r)?;
        self.bus.agnus.load_state(r)?;
        self.bus.ciaa.load_state(r)?;
        self.bus.ciab.load_state(r)?;

        self.bus.paula.intena = r.get_u16()?;
        self.bus.paula.intreq = r.get_u16()?;
        self.bus.paula.adkcon = r.get_u16()?;
        self.bus.paula.audio.load_state(r)?;
        self.bus.paula.disk.load_state(r)?;

        self.bus.copper.load_state(r)?;
        self.bus.blitter.load_state(r)?;
        self.bus.denise.load_state(r)?;
        self.bus.serial.load_state(r)?;
        for drive in &mut self.bus.df {
            drive.load_state(r)?;
        }

        // Derived tables are rebuilt rather than serialized.
        self.bus.rebuild_dma_schedule();
        self.restart_timer();
        Ok(())
    }
}

/// Byte length of the instruction at `pc` (operation word + extensions),
/// for placing the step-over breakpoint.
fn instruction_bytes(opcode: u16, ext: u16) -> u32 {
    let mode = (opcode >> 3) & 7;
    let regf = opcode & 7;

    // Control-flow forms with fixed sizes.
    if opcode & 0xFF00 == 0x6100 {
        // BSR
        return if opcode & 0xFF == 0 { 4 } else { 2 };
    }
    if opcode & 0xFFC0 == 0x4E80 {
        // JSR
        return 2 + ea_ext_bytes(mode, regf, false);
    }
    if opcode & 0xF000 == 0x7000 {
        return 2; // MOVEQ
    }
    if opcode & 0xC000 == 0 && opcode & 0xF000 != 0 {
        // MOVE: two EA fields.
        let size_long = (opcode >> 12) & 3 == 2;
        let dst_mode = (opcode >> 6) & 7;
        let dst_reg = (opcode >> 9) & 7;
        return 2
            + ea_ext_bytes(mode, regf, size_long)
            + ea_ext_bytes(dst_mode, dst_reg, size_long);
    }
    if opcode & 0xFF00 == 0x0C00 || opcode & 0xF100 == 0x0000 && opcode & 0x0E00 != 0x0800 {
        // Immediate group (CMPI/ORI/ANDI/...).
        let size = (opcode >> 6) & 3;
        let imm = if size == 2 { 4 } else { 2 };
        return 2 + imm + ea_ext_bytes(mode, regf, false);
    }
    let _ = ext;
    // Fallback: operation word plus its EA extension.
    2 + ea_ext_bytes(mode, regf, false)
}

fn ea_ext_bytes(mode: u16, regf: u16, long_imm: bool) -> u32 {
    match mode & 7 {
        5 | 6 => 2,
        7 => match regf & 7 {
            0 | 2 | 3 => 2,
            1 => 4,
            4 => {
                if long_imm {
                    4
                } else {
                    2
                }
            }
            _ => 0,
        },
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rom() -> Vec<u8> {
        // Kickstart-style image: signature, then a jump target at $F80008
        // holding an idle loop.
        let mut rom = vec![0u8; 256 * 1024];
        rom[..8].copy_from_slice(&[0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x08]);
        // LEA $0007FF00.L,A7 ; BRA.S *
        rom[8..14].copy_from_slice(&[0x4F, 0xF9, 0x00, 0x07, 0xFF, 0x00]);
        rom[14] = 0x60;
        rom[15] = 0xFE;
        rom
    }

    #[test]
    fn power_on_without_rom_reports_rom_missing() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        let msgs = amiga.message_queue();
        assert!(!amiga.power_on());
        assert!(amiga.is_powered_off());
        assert_eq!(msgs.get().unwrap().msg, MsgType::RomMissing);
    }

    #[test]
    fn power_on_with_rom_enters_paused_state() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(test_rom());
        assert!(amiga.power_on());
        assert!(amiga.is_paused());
    }

    #[test]
    fn reset_vectors_reach_the_cpu_through_the_overlay() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(test_rom());
        amiga.power_on();
        assert_eq!(amiga.cpu.pc(), 0x00F8_0008);
    }

    #[test]
    fn configure_rejects_invalid_values_without_side_effect() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        assert!(!amiga.configure(ConfigOption::ChipRam, 300));
        assert_eq!(amiga.config().chip_ram_kb, 512);
        assert!(amiga.configure(ConfigOption::ChipRam, 1024));
        assert_eq!(amiga.config().chip_ram_kb, 1024);
        assert_eq!(amiga.bus.mem.chip_ram_bytes(), 1024 * 1024);

        assert!(!amiga.configure(ConfigOption::CpuSpeed, 3));
        assert!(amiga.configure(ConfigOption::CpuSpeed, 2));
        assert_eq!(amiga.cpu.speed, 2);

        assert!(!amiga.configure(ConfigOption::FastRam, 100));
        assert!(amiga.configure(ConfigOption::FastRam, 1024));
    }

    #[test]
    fn drive_zero_cannot_be_disconnected() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        assert!(!amiga.configure_drive(0, DriveOption::Connect, 0));
        assert!(amiga.configure_drive(1, DriveOption::Connect, 1));
        assert!(amiga.bus.paula.disk.connected[1]);
    }

    #[test]
    fn instructions_advance_cpu_and_chips_in_step() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(test_rom());
        amiga.power_on();
        for _ in 0..100 {
            amiga.execute_one_instruction();
        }
        assert!(amiga.cpu.clock > 0);
        assert_eq!(amiga.bus.agnus.clock, amiga.cpu.clock);
        assert!(amiga.bus.ciaa.clock <= amiga.bus.agnus.clock);
    }

    #[test]
    fn step_over_lands_after_the_instruction() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(test_rom());
        amiga.power_on();
        let msgs = amiga.message_queue();
        while msgs.get().is_some() {}

        // First instruction is the 6-byte LEA.
        let pc = amiga.cpu.pc();
        assert_eq!(amiga.next_instruction_addr(), pc + 6);
        amiga.step_over();
        let message = loop {
            let m = msgs.get().unwrap();
            if m.msg == MsgType::BreakpointReached {
                break m;
            }
        };
        assert_eq!(message.data, i64::from(pc + 6));
        assert_eq!(amiga.cpu.pc(), pc + 6);
    }

    #[test]
    fn breakpoint_skip_count_holds_off_firing() {
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(test_rom());
        amiga.power_on();

        // The BRA.S loop at $F8000E executes forever; break on its 3rd pass.
        let mut guard = Guard::at(0x00F8_000E);
        guard.skip_count = 2;
        amiga.cpu.breakpoints.add(guard);
        amiga.set_control_flags(RL_BREAKPOINTS);

        let mut visits = 0;
        loop {
            amiga.execute_one_instruction();
            if amiga.cpu.pc() == 0x00F8_000E {
                visits += 1;
                if amiga.cpu.breakpoints.check(amiga.cpu.pc()) {
                    break;
                }
            }
        }
        assert_eq!(visits, 3);
    }
}
