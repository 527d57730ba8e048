//! Beam geometry.
//!
//! Every master cycle inside a frame maps to exactly one beam position
//! `(v, h)`: `v` indexes the raster line, `h` the DMA cycle within the
//! line (0..227). PAL frames alternate between 313 lines (long, LOF set)
//! and 312 lines (short) when interlace toggles the LOF bit.

use crate::cycles::{dma_cycles, Cycle};

/// DMA cycles per raster line.
pub const HPOS_CNT: u16 = 227;
/// Last DMA cycle of a line; the HSYNC housekeeping event fires here.
pub const HPOS_MAX: u16 = HPOS_CNT - 1;
/// Lines in a PAL long frame.
pub const VPOS_CNT_LONG: u16 = 313;
/// Lines in a PAL short frame.
pub const VPOS_CNT_SHORT: u16 = 312;

/// Master cycles per raster line.
pub const CYCLES_PER_LINE: Cycle = dma_cycles(HPOS_CNT as Cycle);

/// A beam position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beam {
    pub v: u16,
    pub h: u16,
}

impl Beam {
    #[must_use]
    pub const fn new(v: u16, h: u16) -> Self {
        Self { v, h }
    }
}

/// Lines in the frame selected by the LOF bit.
#[must_use]
pub const fn lines_in_frame(lof: bool) -> u16 {
    if lof {
        VPOS_CNT_LONG
    } else {
        VPOS_CNT_SHORT
    }
}

/// Master cycles in the frame selected by the LOF bit.
#[must_use]
pub const fn cycles_in_frame(lof: bool) -> Cycle {
    lines_in_frame(lof) as Cycle * CYCLES_PER_LINE
}

/// Beam position to master-cycle offset from the frame start.
#[must_use]
pub const fn beam_to_offset(beam: Beam) -> Cycle {
    beam.v as Cycle * CYCLES_PER_LINE + dma_cycles(beam.h as Cycle)
}

/// Master-cycle offset from the frame start to a beam position.
#[must_use]
pub const fn offset_to_beam(offset: Cycle) -> Beam {
    let dma = offset / dma_cycles(1);
    Beam {
        v: (dma / HPOS_CNT as Cycle) as u16,
        h: (dma % HPOS_CNT as Cycle) as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(lines_in_frame(true), 313);
        assert_eq!(lines_in_frame(false), 312);
        assert_eq!(cycles_in_frame(true), 313 * 227 * 8);
    }

    #[test]
    fn beam_round_trip_over_one_frame() {
        // Every DMA-cycle-aligned master cycle maps back to itself.
        for v in [0u16, 1, 100, 312] {
            for h in [0u16, 1, 113, 226] {
                let beam = Beam::new(v, h);
                let offset = beam_to_offset(beam);
                assert_eq!(offset_to_beam(offset), beam);
            }
        }
    }

    #[test]
    fn every_cycle_has_one_position() {
        // Sub-DMA master cycles round down to the slot they belong to.
        let beam = Beam::new(10, 20);
        let offset = beam_to_offset(beam);
        for sub in 0..8 {
            assert_eq!(offset_to_beam(offset + sub), beam);
        }
    }
}
