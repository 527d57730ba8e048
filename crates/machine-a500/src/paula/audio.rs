//! The four audio channels.
//!
//! Each channel plays 8-bit signed samples from chip RAM at a rate set by
//! its period register (in colour clocks). DMA keeps one word playing and
//! one word prefetched; the block interrupt fires when a block starts or
//! wraps. Sample synthesis runs at line granularity: the raster handler
//! ticks each channel through the 227 colour clocks of the finished line
//! and resamples the outputs into the host-rate frame buffer.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use crate::beam::HPOS_CNT;
use crate::custom_regs;
use crate::memory::Memory;

/// Host sample rate the frame buffer is resampled to.
pub const SAMPLE_RATE: u32 = 44_100;

/// Periods below the hardware minimum are clamped for playback.
const MIN_PERIOD: u16 = 124;

/// PAL line rate, used for the line-to-host-rate resampling step.
const LINES_PER_SECOND: f64 = 15_625.0;

#[derive(Clone, Copy)]
pub struct AudioChannel {
    /// Block start address (AUDxLCH/LCL).
    pub lc: u32,
    /// Current fetch pointer.
    ptr: u32,
    /// Block length in words (AUDxLEN).
    pub len: u16,
    words_left: u32,
    /// Sample period in colour clocks (AUDxPER).
    pub per: u16,
    /// Volume 0-64 (AUDxVOL).
    pub vol: u8,
    /// Last fetched word (AUDxDAT).
    pub dat: u16,
    current: Option<u16>,
    next: Option<u16>,
    hi_byte: bool,
    period_counter: u16,
    output: i8,
    dma_active: bool,
    dma_was_enabled: bool,
}

impl Default for AudioChannel {
    fn default() -> Self {
        Self {
            lc: 0,
            ptr: 0,
            len: 0,
            words_left: 0,
            per: MIN_PERIOD,
            vol: 0,
            dat: 0,
            current: None,
            next: None,
            hi_byte: true,
            period_counter: MIN_PERIOD,
            output: 0,
            dma_active: false,
            dma_was_enabled: false,
        }
    }
}

impl AudioChannel {
    fn effective_period(&self) -> u16 {
        self.per.max(MIN_PERIOD)
    }

    fn block_words(&self) -> u32 {
        if self.len == 0 {
            65_536
        } else {
            u32::from(self.len)
        }
    }

    fn start_block(&mut self) {
        self.ptr = self.lc & 0x001F_FFFE;
        self.words_left = self.block_words();
        self.current = None;
        self.next = None;
        self.hi_byte = true;
        self.period_counter = self.effective_period();
        self.dma_active = true;
    }

    fn stop(&mut self) {
        self.dma_active = false;
        self.current = None;
        self.next = None;
        self.hi_byte = true;
    }

    /// Track the channel's DMACON enable; returns true when a block just
    /// started (which raises the channel interrupt).
    fn sync_enable(&mut self, enabled: bool) -> bool {
        let mut started = false;
        if enabled && !self.dma_was_enabled {
            self.start_block();
            started = true;
        } else if !enabled && self.dma_was_enabled {
            self.stop();
        }
        self.dma_was_enabled = enabled;
        started
    }

    /// CPU-driven playback through AUDxDAT when DMA is off.
    pub fn write_dat(&mut self, value: u16) {
        self.dat = value;
        if !self.dma_active {
            self.current = Some(value);
            self.next = None;
            self.hi_byte = true;
            self.period_counter = self.effective_period();
        }
    }

    /// Does the channel want a word in its DMA slot?
    fn wants_word(&self) -> bool {
        self.dma_active && (self.current.is_none() || self.next.is_none())
    }

    /// Fetch one word from chip RAM; returns true when the block wrapped.
    fn fetch(&mut self, mem: &Memory) -> bool {
        let mut wrapped = false;
        if self.words_left == 0 {
            self.ptr = self.lc & 0x001F_FFFE;
            self.words_left = self.block_words();
            wrapped = true;
        }
        let word = mem.read_chip16(self.ptr);
        self.ptr = self.ptr.wrapping_add(2);
        self.words_left -= 1;
        self.dat = word;
        if self.current.is_none() {
            self.current = Some(word);
            self.hi_byte = true;
        } else {
            self.next = Some(word);
        }
        wrapped
    }

    /// One colour clock of the output stage.
    fn tick_cck(&mut self) {
        self.period_counter = self.period_counter.saturating_sub(1);
        if self.period_counter != 0 {
            return;
        }
        self.period_counter = self.effective_period();

        if self.current.is_none() {
            if let Some(word) = self.next.take() {
                self.current = Some(word);
                self.hi_byte = true;
            }
        }
        let Some(word) = self.current else {
            return;
        };
        let byte = if self.hi_byte {
            (word >> 8) as u8
        } else {
            word as u8
        };
        self.output = byte as i8;
        if self.hi_byte {
            self.hi_byte = false;
        } else {
            self.hi_byte = true;
            self.current = self.next.take();
        }
    }

    fn level(&self) -> f32 {
        f32::from(self.output) / 128.0 * f32::from(self.vol.min(64)) / 64.0
    }
}

/// The audio unit: four channels plus the per-frame host-rate buffer.
pub struct AudioUnit {
    pub channels: [AudioChannel; 4],
    /// Interleaved stereo samples synthesized this frame.
    frame: Vec<f32>,
    /// Fractional resampling accumulator.
    sample_debt: f64,
    /// Samples the host failed to drain in time.
    pub overrun_count: u64,
}

impl AudioUnit {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: [AudioChannel::default(); 4],
            frame: Vec::with_capacity(2048),
            sample_debt: 0.0,
            overrun_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.channels = [AudioChannel::default(); 4];
        self.frame.clear();
        self.sample_debt = 0.0;
    }

    /// Word write to an AUDx register block ($0A0-$0DF).
    pub fn write_register(&mut self, offset: u16, value: u16) {
        let rel = offset - custom_regs::AUD_BASE;
        let ch = &mut self.channels[usize::from(rel / 0x10)];
        match (rel % 0x10) / 2 {
            0 => ch.lc = (ch.lc & 0x0000_FFFF) | (u32::from(value & 0x001F) << 16),
            1 => ch.lc = (ch.lc & 0xFFFF_0000) | u32::from(value & 0xFFFE),
            2 => ch.len = value,
            3 => ch.per = value,
            4 => ch.vol = (value & 0x7F).min(64) as u8,
            5 => ch.write_dat(value),
            _ => {}
        }
    }

    /// Follow DMACON: start or stop channels. The returned mask carries the
    /// INTREQ bits (7-10) of channels whose block just started.
    pub fn sync_dmacon(&mut self, dmacon: u16) -> u16 {
        let master = dmacon & custom_regs::DMAF_DMAEN != 0;
        let mut irqs = 0;
        for (n, ch) in self.channels.iter_mut().enumerate() {
            let enabled = master && dmacon & (1 << n) != 0;
            if ch.sync_enable(enabled) {
                irqs |= 1 << (custom_regs::INT_AUD0 + n as u16);
            }
        }
        irqs
    }

    /// Serve the channel's DMA slot. Returns the INTREQ bit mask to raise
    /// (block wrap interrupt).
    pub fn service_dma(&mut self, channel: usize, mem: &Memory) -> u16 {
        let ch = &mut self.channels[channel];
        if !ch.wants_word() {
            return 0;
        }
        if ch.fetch(mem) {
            1 << (custom_regs::INT_AUD0 + channel as u16)
        } else {
            0
        }
    }

    /// Advance all channels through one raster line and resample into the
    /// frame buffer.
    pub fn end_of_line(&mut self) {
        for _ in 0..HPOS_CNT {
            for ch in &mut self.channels {
                ch.tick_cck();
            }
        }

        // OCS stereo routing: channels 0 and 3 left, 1 and 2 right.
        let left = (self.channels[0].level() + self.channels[3].level()) * 0.5;
        let right = (self.channels[1].level() + self.channels[2].level()) * 0.5;

        self.sample_debt += f64::from(SAMPLE_RATE) / LINES_PER_SECOND;
        while self.sample_debt >= 1.0 {
            self.sample_debt -= 1.0;
            if self.frame.len() >= 8192 {
                self.overrun_count += 1;
                continue;
            }
            self.frame.push(left.clamp(-1.0, 1.0));
            self.frame.push(right.clamp(-1.0, 1.0));
        }
    }

    /// Hand the accumulated frame samples to the host and start over.
    pub fn drain_frame(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.frame)
    }
}

impl Default for AudioUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmigaConfig;

    fn enabled_ch0() -> u16 {
        0x8000 | custom_regs::DMAF_DMAEN | custom_regs::DMAF_AUD0EN
    }

    #[test]
    fn register_block_decoding() {
        let mut unit = AudioUnit::new();
        unit.write_register(0x0A0, 0x0001);
        unit.write_register(0x0A2, 0x2000);
        unit.write_register(0x0A4, 0x0010);
        unit.write_register(0x0A6, 200);
        unit.write_register(0x0A8, 0x7F);
        assert_eq!(unit.channels[0].lc, 0x0001_2000);
        assert_eq!(unit.channels[0].len, 0x0010);
        assert_eq!(unit.channels[0].per, 200);
        assert_eq!(unit.channels[0].vol, 64);
    }

    #[test]
    fn dma_start_raises_block_irq() {
        let mut unit = AudioUnit::new();
        let mut dmacon = 0u16;
        custom_regs::set_clr_write(&mut dmacon, enabled_ch0());
        let irqs = unit.sync_dmacon(dmacon);
        assert_eq!(irqs, 1 << custom_regs::INT_AUD0);
        // Steady state: no repeat.
        assert_eq!(unit.sync_dmacon(dmacon), 0);
    }

    #[test]
    fn fetch_and_output_produce_signal() {
        let mut unit = AudioUnit::new();
        let mut mem = Memory::new(&AmigaConfig::a500());
        mem.write_chip16(0x3000, 0x7F7F);

        unit.write_register(0x0A0, 0x0000);
        unit.write_register(0x0A2, 0x3000);
        unit.write_register(0x0A4, 0x0001);
        unit.write_register(0x0A6, 124);
        unit.write_register(0x0A8, 64);

        let mut dmacon = 0u16;
        custom_regs::set_clr_write(&mut dmacon, enabled_ch0());
        unit.sync_dmacon(dmacon);
        unit.service_dma(0, &mem);

        unit.end_of_line();
        let frame = unit.drain_frame();
        assert!(!frame.is_empty());
        // Left channel carries channel 0.
        assert!(frame[0] > 0.2, "left = {}", frame[0]);
        assert!(frame[1].abs() < 0.01, "right = {}", frame[1]);
    }
}

impl AudioUnit {
    pub fn save_state(&self, w: &mut crate::snapshot::SnapshotWriter) {
        for ch in &self.channels {
            w.put_u32(ch.lc);
            w.put_u32(ch.ptr);
            w.put_u16(ch.len);
            w.put_u32(ch.words_left);
            w.put_u16(ch.per);
            w.put_u8(ch.vol);
            w.put_u16(ch.dat);
            w.put_u16(ch.current.unwrap_or(0));
            w.put_bool(ch.current.is_some());
            w.put_u16(ch.next.unwrap_or(0));
            w.put_bool(ch.next.is_some());
            w.put_bool(ch.hi_byte);
            w.put_u16(ch.period_counter);
            w.put_u8(ch.output as u8);
            w.put_bool(ch.dma_active);
            w.put_bool(ch.dma_was_enabled);
        }
        w.put_u64(self.overrun_count);
    }

    pub fn load_state(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        for ch in &mut self.channels {
            ch.lc = r.get_u32()?;
            ch.ptr = r.get_u32()?;
            ch.len = r.get_u16()?;
            ch.words_left = r.get_u32()?;
            ch.per = r.get_u16()?;
            ch.vol = r.get_u8()?;
            ch.dat = r.get_u16()?;
            let current = r.get_u16()?;
            ch.current = r.get_bool()?.then_some(current);
            let next = r.get_u16()?;
            ch.next = r.get_bool()?.then_some(next);
            ch.hi_byte = r.get_bool()?;
            ch.period_counter = r.get_u16()?;
            ch.output = r.get_u8()? as i8;
            ch.dma_active = r.get_bool()?;
            ch.dma_was_enabled = r.get_bool()?;
        }
        self.overrun_count = r.get_u64()?;
        self.frame.clear();
        self.sample_debt = 0.0;
        Ok(())
    }
}
