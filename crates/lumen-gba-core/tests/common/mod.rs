use lumen_gba_core::backup::BackupType;
use lumen_gba_core::gba::{Gba, LaunchConfig};

/// Zero-filled ROM of `len` bytes with `code` planted at header offset 0xAC
/// when the ROM is large enough to carry a header.
pub fn rom_with_code(len: usize, code: &[u8; 4]) -> Vec<u8> {
    let mut rom = vec![0u8; len];
    if len >= 0xB0 {
        rom[0xAC..0xB0].copy_from_slice(code);
    }
    rom
}

pub fn boot(rom: Vec<u8>) -> Gba {
    boot_with(LaunchConfig {
        rom,
        ..Default::default()
    })
}

pub fn boot_with(config: LaunchConfig) -> Gba {
    let mut gba = Gba::new();
    gba.reset(config);
    gba
}

pub fn boot_with_backup(rom: Vec<u8>, backup_type: BackupType) -> Gba {
    boot_with(LaunchConfig {
        rom,
        backup_type,
        ..Default::default()
    })
}
