//! Frame pacing: the frame counter and the framebuffer swap cadence.

use machine_a500::amiga::Amiga;
use machine_a500::config::AmigaConfig;

fn test_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 256 * 1024];
    rom[..8].copy_from_slice(&[0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x08]);
    rom[8] = 0x60;
    rom[9] = 0xFE;
    rom
}

#[test]
fn fifty_frames_mean_fifty_swaps() {
    let mut amiga = Amiga::new(AmigaConfig::a500());
    amiga.load_rom_unchecked(test_rom());
    assert!(amiga.power_on());
    let stable = amiga.bus.denise.pixel_engine.stable_handle();

    let start_frame = amiga.bus.agnus.frame;
    let mut steps = 0u64;
    while amiga.bus.agnus.frame < start_frame + 50 {
        amiga.execute_one_instruction();
        steps += 1;
        assert!(steps < 20_000_000, "runaway loop");
    }

    amiga.inspect();
    assert_eq!(amiga.info().frame - start_frame, 50);

    let swaps = stable.lock().unwrap().swap_count;
    assert_eq!(swaps, 50);
    assert_eq!(swaps % 2, 0);
}

#[test]
fn beam_position_is_published_through_info() {
    let mut amiga = Amiga::new(AmigaConfig::a500());
    amiga.load_rom_unchecked(test_rom());
    assert!(amiga.power_on());
    for _ in 0..10_000 {
        amiga.execute_one_instruction();
    }
    amiga.inspect();
    let info = amiga.info();
    assert!(info.vpos < 313);
    assert!(info.hpos < 227);
    assert_eq!(info.dma_clock, amiga.bus.agnus.clock);
    assert!(info.ciaa_clock <= info.dma_clock);
    assert!(info.ciab_clock <= info.dma_clock);
}
