//! The master time base.
//!
//! All timestamps are master-clock cycles at the 28 MHz crystal. Component
//! clocks are fixed divisions: CPU = master/4, DMA (colour clock) =
//! master/8, CIA E-clock = master/40.

/// A master-clock timestamp or duration. Signed so that deltas and
//  not-yet-reached times subtract cleanly.
pub type Cycle = i64;

/// Trigger value of an empty or disabled event slot.
pub const NEVER: Cycle = i64::MAX;

/// PAL master crystal frequency in Hz.
pub const PAL_CRYSTAL_HZ: i64 = 28_375_160;

/// Master cycles per CPU clock.
pub const MASTER_PER_CPU: Cycle = 4;

/// Master cycles per DMA cycle (colour clock).
pub const MASTER_PER_DMA: Cycle = 8;

/// Master cycles per CIA E-clock.
pub const MASTER_PER_CIA: Cycle = 40;

/// Convert CPU clocks to master cycles.
#[must_use]
pub const fn cpu_cycles(n: Cycle) -> Cycle {
    n * MASTER_PER_CPU
}

/// Convert DMA cycles to master cycles.
#[must_use]
pub const fn dma_cycles(n: Cycle) -> Cycle {
    n * MASTER_PER_DMA
}

/// Convert CIA E-clocks to master cycles.
#[must_use]
pub const fn cia_cycles(n: Cycle) -> Cycle {
    n * MASTER_PER_CIA
}

/// Master cycles elapsed in `ms` milliseconds of simulated PAL time.
#[must_use]
pub const fn msec(ms: i64) -> Cycle {
    PAL_CRYSTAL_HZ * ms / 1000
}

/// Master cycles expressed in whole CPU clocks.
#[must_use]
pub const fn as_cpu_cycles(c: Cycle) -> Cycle {
    c / MASTER_PER_CPU
}

/// Master cycles expressed in whole DMA cycles.
#[must_use]
pub const fn as_dma_cycles(c: Cycle) -> Cycle {
    c / MASTER_PER_DMA
}

/// Master cycles expressed in whole CIA E-clocks.
#[must_use]
pub const fn as_cia_cycles(c: Cycle) -> Cycle {
    c / MASTER_PER_CIA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions() {
        assert_eq!(cpu_cycles(3), 12);
        assert_eq!(dma_cycles(2), 16);
        assert_eq!(cia_cycles(1), 40);
        assert_eq!(as_cpu_cycles(12), 3);
        assert_eq!(as_dma_cycles(17), 2);
        assert_eq!(as_cia_cycles(80), 2);
    }

    #[test]
    fn one_and_a_half_seconds() {
        assert_eq!(msec(1500), PAL_CRYSTAL_HZ * 3 / 2);
    }
}
