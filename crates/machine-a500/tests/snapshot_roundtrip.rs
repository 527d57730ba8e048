//! Save-state round trips: `load(save(state))` reproduces the state, and
//! version mismatches leave the target machine untouched.

use format_adf::Adf;
use machine_a500::amiga::Amiga;
use machine_a500::config::AmigaConfig;
use machine_a500::custom_regs as reg;
use machine_a500::snapshot::{Snapshot, SnapshotError};

fn test_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 256 * 1024];
    rom[..8].copy_from_slice(&[0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x08]);
    // A little activity: MOVEQ #7,D0 ; loop: ADDQ.L #1,D1 ; BRA.S loop
    rom[8..14].copy_from_slice(&[0x70, 0x07, 0x52, 0x81, 0x60, 0xFC]);
    rom
}

fn busy_machine() -> Amiga {
    let mut amiga = Amiga::new(AmigaConfig::a500());
    amiga.load_rom_unchecked(test_rom());
    assert!(amiga.power_on());
    amiga.insert_disk(0, Adf::blank());

    // Stir up non-default chip state.
    amiga.bus.write_custom16(reg::INTENA, 0xC02A);
    amiga.bus.write_custom16(reg::COLOR00, 0x0123);
    amiga.bus.write_custom16(reg::DSKSYNC, 0x8914);
    amiga.bus.write_custom16(reg::BPLCON0, 0x2200);
    for _ in 0..25_000 {
        amiga.execute_one_instruction();
    }
    amiga
}

#[test]
fn capture_apply_capture_is_identity() {
    let mut original = busy_machine();
    let first = Snapshot::capture(&original);

    // Restore into a fresh machine with the same ROM payload.
    let mut restored = Amiga::new(AmigaConfig::a500());
    restored.load_rom_unchecked(test_rom());
    first.apply(&mut restored).expect("snapshot applies");

    let second = Snapshot::capture(&restored);
    assert_eq!(first.data(), second.data());

    // Both machines continue identically.
    for _ in 0..5_000 {
        original.execute_one_instruction();
        restored.execute_one_instruction();
    }
    assert_eq!(original.cpu.pc(), restored.cpu.pc());
    assert_eq!(original.cpu.core.regs.d, restored.cpu.core.regs.d);
    assert_eq!(original.bus.agnus.clock, restored.bus.agnus.clock);
    assert_eq!(original.bus.agnus.pos_v, restored.bus.agnus.pos_v);
}

#[test]
fn version_mismatch_preserves_live_state() {
    let mut amiga = busy_machine();
    let pc_before = amiga.cpu.pc();
    let clock_before = amiga.bus.agnus.clock;

    let mut bytes = Snapshot::capture(&amiga).data().to_vec();
    bytes[4] = 0x7F; // future version
    let bogus = Snapshot::from_bytes(bytes);
    assert_eq!(
        bogus.apply(&mut amiga).unwrap_err(),
        SnapshotError::VersionMismatch(0x7F)
    );
    assert_eq!(amiga.cpu.pc(), pc_before);
    assert_eq!(amiga.bus.agnus.clock, clock_before);
}
