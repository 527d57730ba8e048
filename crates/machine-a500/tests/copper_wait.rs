//! Copper display-list execution: a WAIT resolving at a beam position
//! must delay the following MOVE to the first slots after that position.

use machine_a500::amiga::Amiga;
use machine_a500::config::AmigaConfig;
use machine_a500::custom_regs as reg;
use machine_a500::denise::pixels::HPIXELS;

fn test_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 256 * 1024];
    rom[..8].copy_from_slice(&[0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x08]);
    rom[8] = 0x60;
    rom[9] = 0xFE;
    rom
}

fn run_until(amiga: &mut Amiga, mut cond: impl FnMut(&Amiga) -> bool, limit: u32) -> bool {
    for _ in 0..limit {
        if cond(amiga) {
            return true;
        }
        amiga.execute_one_instruction();
    }
    false
}

#[test]
fn wait_gates_the_move_to_line_100() {
    let mut amiga = Amiga::new(AmigaConfig::a500());
    amiga.load_rom_unchecked(test_rom());
    assert!(amiga.power_on());

    // Copper list: WAIT (v=100, h=0) ; MOVE COLOR00,$0F00 ; WAIT forever.
    let list: [u16; 6] = [0x6401, 0xFFFE, 0x0180, 0x0F00, 0xFFFF, 0xFFFE];
    for (i, word) in list.iter().enumerate() {
        amiga.bus.mem.write_chip16(0x2000 + i as u32 * 2, *word);
    }
    amiga.bus.write_custom16(reg::COP1LCH, 0x0000);
    amiga.bus.write_custom16(reg::COP1LCL, 0x2000);
    amiga
        .bus
        .write_custom16(reg::DMACON, 0x8000 | reg::DMAF_DMAEN | reg::DMAF_COPEN);

    // The list starts at the next vertical blank (frame 1).
    let reached = run_until(
        &mut amiga,
        |a| a.bus.agnus.frame == 1 && a.bus.agnus.pos_v == 99,
        300_000,
    );
    assert!(reached, "never reached frame 1 line 99");
    assert_eq!(
        amiga.bus.denise.pixel_engine.color(0),
        0,
        "colour changed before the WAIT position"
    );

    let reached = run_until(
        &mut amiga,
        |a| a.bus.agnus.frame == 1 && a.bus.agnus.pos_v == 102,
        50_000,
    );
    assert!(reached);
    assert_eq!(
        amiga.bus.denise.pixel_engine.color(0),
        0x0F00,
        "MOVE did not land after the WAIT resolved"
    );

    // The framebuffer shows it: line 99 still background, line 101 red.
    let fb = amiga.bus.denise.pixel_engine.working(true);
    assert_eq!(fb.data[99 * HPIXELS + 400], 0xFF00_0000);
    assert_eq!(fb.data[101 * HPIXELS + 400], 0xFFFF_0000);

    // The terminal WAIT parks the Copper for the rest of the frame.
    let parked = run_until(
        &mut amiga,
        |a| a.bus.agnus.frame == 1 && a.bus.agnus.pos_v == 200,
        300_000,
    );
    assert!(parked);
    assert!(amiga.bus.copper.is_wait_forever());
}
