mod common;

use lumen_gba_core::backup::BackupType;
use lumen_gba_core::bus::Access;
use lumen_gba_core::gba::Gba;

fn billed(gba: &mut Gba, access: impl FnOnce(&mut Gba)) -> u64 {
    let before = gba.scheduler.cycles();
    access(gba);
    gba.scheduler.cycles() - before
}

#[test]
fn ewram_and_iwram_round_trip_all_widths() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    gba.write32(0x0200_0000, 0xDEAD_BEEF, Access::NonSequential);
    assert_eq!(gba.read32(0x0200_0000, Access::NonSequential), 0xDEAD_BEEF);
    assert_eq!(gba.read16(0x0200_0002, Access::Sequential), 0xDEAD);
    assert_eq!(gba.read8(0x0200_0001, Access::Sequential), 0xBE);

    gba.write8(0x0300_7FFF, 0x42, Access::NonSequential);
    assert_eq!(gba.read8(0x0300_7FFF, Access::NonSequential), 0x42);
    // 32 KiB IWRAM mirrors through the whole page.
    assert_eq!(gba.read8(0x0300_FFFF, Access::NonSequential), 0x42);
}

#[test]
fn rotated_reads_equal_ror_of_the_aligned_read() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));
    gba.write32(0x0200_0010, 0x1122_3344, Access::NonSequential);

    for misalign in 0..4u32 {
        let addr = 0x0200_0010 + misalign;
        let aligned = gba.read32(addr & !0x3, Access::NonSequential);
        let rotated = gba.read32_ror(addr, Access::NonSequential);
        assert_eq!(rotated, aligned.rotate_right(8 * (addr & 0x3)));
    }
    for misalign in 0..2u32 {
        let addr = 0x0200_0010 + misalign;
        let aligned = gba.read16(addr & !0x1, Access::NonSequential) as u32;
        let rotated = gba.read16_ror(addr, Access::NonSequential);
        assert_eq!(rotated, aligned.rotate_right(8 * (addr & 0x1)));
    }
}

#[test]
fn palram_byte_stores_mirror_to_both_lanes() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    gba.write8(0x0500_0001, 0xAB, Access::NonSequential);
    assert_eq!(gba.read16(0x0500_0000, Access::NonSequential), 0xABAB);

    gba.write8(0x0500_0006, 0x3C, Access::NonSequential);
    assert_eq!(gba.read16(0x0500_0006, Access::NonSequential), 0x3C3C);
}

#[test]
fn vram_byte_stores_mirror_in_bg_and_drop_in_obj() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    // Mode 0: OBJ VRAM starts at 0x10000.
    gba.write8(0x0600_0003, 0x7E, Access::NonSequential);
    assert_eq!(gba.read16(0x0600_0002, Access::NonSequential), 0x7E7E);

    gba.write8(0x0601_0000, 0x55, Access::NonSequential);
    assert_eq!(gba.read16(0x0601_0000, Access::NonSequential), 0);

    // Bitmap modes push the OBJ floor up to 0x14000.
    gba.write16(0x0400_0000, 0x0003, Access::NonSequential);
    gba.write8(0x0601_0000, 0x55, Access::NonSequential);
    assert_eq!(gba.read16(0x0601_0000, Access::NonSequential), 0x5555);

    gba.write8(0x0601_4000, 0x66, Access::NonSequential);
    assert_eq!(gba.read16(0x0601_4000, Access::NonSequential), 0);
}

#[test]
fn oam_byte_stores_are_dropped() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    gba.write16(0x0700_0000, 0x1234, Access::NonSequential);
    gba.write8(0x0700_0000, 0xFF, Access::NonSequential);
    assert_eq!(gba.read16(0x0700_0000, Access::NonSequential), 0x1234);
}

#[test]
fn rom_reads_return_data_then_address_pattern_past_the_end() {
    let mut rom = common::rom_with_code(0x200, b"TEST");
    rom[0] = 0x11;
    rom[1] = 0x22;
    let mut gba = common::boot(rom);

    assert_eq!(gba.read16(0x0800_0000, Access::NonSequential), 0x2211);

    // Past the ROM, the bus sees the half-word address as data.
    let addr = 0x0800_1000u32;
    assert_eq!(
        gba.read16(addr, Access::NonSequential),
        ((addr >> 1) & 0xFFFF) as u16
    );
    let addr = 0x0800_1004u32;
    assert_eq!(
        gba.read32(addr, Access::NonSequential),
        ((addr >> 1) & 0xFFFF) | ((((addr + 2) >> 1) & 0xFFFF) << 16)
    );
}

#[test]
fn cartridge_128k_boundary_is_always_non_sequential() {
    let mut gba = common::boot(common::rom_with_code(0x40000, b"TEST"));

    // Default WAITCNT: ws0 non-sequential 5 cycles, sequential 3 (16-bit).
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0802_0000, Access::Sequential);
    });
    assert_eq!(cost, 5);

    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0802_0002, Access::Sequential);
    });
    assert_eq!(cost, 3);

    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0802_0004, Access::NonSequential);
    });
    assert_eq!(cost, 5);
}

#[test]
fn waitstate_control_reprices_the_cartridge_rows() {
    let mut gba = common::boot(common::rom_with_code(0x1000, b"TEST"));

    // ws0 non-sequential index 2 (2 base cycles), sequential fast.
    gba.write16(0x0400_0204, (2 << 2) | (1 << 4), Access::NonSequential);

    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0010, Access::NonSequential);
    });
    assert_eq!(cost, 3);
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0012, Access::Sequential);
    });
    assert_eq!(cost, 2);

    // 32-bit access pays one non-sequential plus one sequential half-word.
    let cost = billed(&mut gba, |gba| {
        gba.read32(0x0800_0020, Access::NonSequential);
    });
    assert_eq!(cost, 5);
}

#[test]
fn sram_reads_broadcast_the_byte_across_lanes() {
    let mut gba = common::boot_with_backup(common::rom_with_code(0xC0, b"TEST"), BackupType::Sram);

    gba.write8(0x0E00_0000, 0x5A, Access::NonSequential);
    assert_eq!(gba.read8(0x0E00_0000, Access::NonSequential), 0x5A);
    assert_eq!(gba.read16(0x0E00_0000, Access::NonSequential), 0x5A5A);
    assert_eq!(gba.read32(0x0E00_0000, Access::NonSequential), 0x5A5A_5A5A);

    // Wider writes land as the byte in the addressed lane.
    gba.write16(0x0E00_0011, 0xBBAA, Access::NonSequential);
    assert_eq!(gba.read8(0x0E00_0011, Access::NonSequential), 0xBB);

    // The mirror page reaches the same storage.
    assert_eq!(gba.read8(0x0F00_0000, Access::NonSequential), 0x5A);
}

#[test]
fn bios_reads_are_gated_on_the_program_counter() {
    let mut rom = common::rom_with_code(0xC0, b"TEST");
    rom[0] = 0;
    let mut gba = common::boot(rom);
    gba.memory.load_bios(&[0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]);

    // Executing inside the BIOS: reads land and refresh the latch.
    gba.core.set_pc(0x0000_0000);
    assert_eq!(gba.read32(0x0000_0000, Access::NonSequential), 0xDDCC_BBAA);
    assert_eq!(gba.read32(0x0000_0004, Access::NonSequential), 0x4433_2211);

    // Executing outside: the latch is all the bus returns.
    gba.core.set_pc(0x0800_0000);
    assert_eq!(gba.read32(0x0000_0000, Access::NonSequential), 0x4433_2211);
    assert_eq!(gba.read16(0x0000_0000, Access::NonSequential), 0x2211);

    // BIOS writes are ignored.
    gba.write32(0x0000_0000, 0x5555_5555, Access::NonSequential);
    gba.core.set_pc(0x0000_0000);
    assert_eq!(gba.read32(0x0000_0000, Access::NonSequential), 0xDDCC_BBAA);
}

#[test]
fn open_bus_reads_come_from_the_pipeline_or_dma_latch() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    // ARM state: the decoded pipeline word.
    gba.core.prefetch = [0x1111_1111, 0x2345_6789];
    gba.core.set_pc(0x0800_0000);
    assert_eq!(gba.read32(0x0100_0000, Access::NonSequential), 0x2345_6789);
    // A byte read sees the latch shifted down to its lane.
    assert_eq!(gba.read8(0x0100_0001, Access::NonSequential), 0x67);

    // After a DMA access, the DMA latch takes precedence.
    gba.memory.dma_bus = 0xCAFE_F00D;
    gba.memory.was_last_access_from_dma = true;
    assert_eq!(gba.read32_raw(0x0100_0000), 0xCAFE_F00D);
    gba.memory.was_last_access_from_dma = false;

    // Thumb state mixes the two pipeline half-words by PC region.
    gba.core.cpsr |= 1 << 5;
    gba.core.prefetch = [0x0000_1111, 0x0000_2222];
    gba.core.set_pc(0x0300_0000); // IWRAM, 4-byte aligned PC
    assert_eq!(gba.read32_raw(0x0100_0000), 0x1111_2222);
    gba.core.set_pc(0x0300_0002);
    assert_eq!(gba.read32_raw(0x0100_0000), 0x2222_1111);
    gba.core.set_pc(0x0200_0000); // EWRAM: decoded on both halves
    assert_eq!(gba.read32_raw(0x0100_0000), 0x2222_2222);
}

#[test]
fn raw_accessors_do_not_charge_cycles() {
    let mut gba = common::boot(common::rom_with_code(0xC0, b"TEST"));

    let cost = billed(&mut gba, |gba| {
        gba.write32_raw(0x0200_0000, 0x0BAD_F00D);
        assert_eq!(gba.read32_raw(0x0200_0000), 0x0BAD_F00D);
    });
    assert_eq!(cost, 0);
}
