//! Host-thread boundary.
//!
//! The machine runs its cooperative loop on one dedicated worker thread.
//! This handle owns that thread: `run` spawns it, `pause` sets the STOP
//! flag and joins at the next instruction boundary, and the re-entrant
//! `suspend`/`resume` pair brackets host-side accesses to machine state.
//! While paused, `with_machine` hands out direct access under the mutex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::amiga::{Amiga, SharedState, RL_STOP};
use crate::denise::pixels::StableBuffers;
use crate::messages::MessageQueue;

pub struct AmigaThread {
    machine: Arc<Mutex<Amiga>>,
    ctrl: Arc<AtomicU32>,
    shared: Arc<Mutex<SharedState>>,
    stable: Arc<Mutex<StableBuffers>>,
    msgs: MessageQueue,
    handle: Option<JoinHandle<()>>,
    suspend_count: u32,
    /// Whether the loop should be running when the suspend count drops
    /// back to zero.
    was_running: bool,
}

impl AmigaThread {
    #[must_use]
    pub fn new(amiga: Amiga) -> Self {
        let ctrl = amiga.ctrl_handle();
        let shared = amiga.shared_handle();
        let stable = amiga.bus.denise.pixel_engine.stable_handle();
        let msgs = amiga.message_queue();
        Self {
            machine: Arc::new(Mutex::new(amiga)),
            ctrl,
            shared,
            stable,
            msgs,
            handle: None,
            suspend_count: 0,
            was_running: false,
        }
    }

    #[must_use]
    pub fn message_queue(&self) -> MessageQueue {
        self.msgs.clone()
    }

    #[must_use]
    pub fn shared_handle(&self) -> Arc<Mutex<SharedState>> {
        Arc::clone(&self.shared)
    }

    #[must_use]
    pub fn stable_buffers(&self) -> Arc<Mutex<StableBuffers>> {
        Arc::clone(&self.stable)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the emulation thread. No-op if it is already running.
    pub fn run(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let machine = Arc::clone(&self.machine);
        self.handle = Some(std::thread::spawn(move || {
            let mut guard = match machine.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.run_loop();
        }));
    }

    /// Stop the loop at the next instruction boundary and wait for it.
    pub fn pause(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.ctrl.fetch_or(RL_STOP, Ordering::SeqCst);
        let _ = handle.join();
        self.ctrl.fetch_and(!RL_STOP, Ordering::SeqCst);
    }

    /// Re-entrant suspension: the first call pauses, matching resumes
    /// restart only when the counter returns to zero.
    pub fn suspend(&mut self) {
        if self.suspend_count == 0 {
            self.was_running = self.handle.is_some();
            self.pause();
        }
        self.suspend_count += 1;
    }

    pub fn resume(&mut self) {
        if self.suspend_count == 0 {
            return;
        }
        self.suspend_count -= 1;
        if self.suspend_count == 0 && self.was_running {
            self.run();
        }
    }

    /// Direct machine access. Callers must hold the thread suspended (or
    /// otherwise know the loop is not running); the mutex enforces mutual
    /// exclusion either way.
    pub fn with_machine<R>(&self, f: impl FnOnce(&mut Amiga) -> R) -> R {
        let mut guard = match self.machine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Drop for AmigaThread {
    fn drop(&mut self) {
        self.pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmigaConfig;
    use crate::messages::MsgType;

    fn looping_machine() -> Amiga {
        let mut rom = vec![0u8; 256 * 1024];
        rom[..8].copy_from_slice(&[0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x08]);
        rom[8] = 0x60; // BRA.S *
        rom[9] = 0xFE;
        let mut amiga = Amiga::new(AmigaConfig::a500());
        amiga.load_rom_unchecked(rom);
        amiga.power_on();
        amiga.warp = true;
        amiga
    }

    #[test]
    fn run_and_pause_round_trip() {
        let mut thread = AmigaThread::new(looping_machine());
        let msgs = thread.message_queue();
        thread.run();
        // The worker makes progress while we wait.
        std::thread::sleep(std::time::Duration::from_millis(30));
        thread.pause();
        assert!(!thread.is_running());
        let clock = thread.with_machine(|amiga| amiga.bus.agnus.clock);
        assert!(clock > 0);
        // RUN and PAUSE were reported.
        let mut seen_run = false;
        let mut seen_pause = false;
        while let Some(m) = msgs.get() {
            seen_run |= m.msg == MsgType::Run;
            seen_pause |= m.msg == MsgType::Pause;
        }
        assert!(seen_run && seen_pause);
    }

    #[test]
    fn suspend_resume_is_reentrant() {
        let mut thread = AmigaThread::new(looping_machine());
        thread.run();
        thread.suspend();
        thread.suspend();
        assert!(!thread.is_running());
        thread.resume();
        assert!(!thread.is_running());
        thread.resume();
        assert!(thread.is_running());
        thread.pause();
    }

    #[test]
    fn stable_framebuffers_are_reachable_while_running() {
        let mut thread = AmigaThread::new(looping_machine());
        let stable = thread.stable_buffers();
        thread.run();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let swaps = {
            let guard = stable.lock().unwrap();
            guard.swap_count
        };
        thread.pause();
        assert!(swaps > 0, "no buffer swap observed");
    }
}
