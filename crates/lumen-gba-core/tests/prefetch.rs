mod common;

use lumen_gba_core::bus::Access;
use lumen_gba_core::cpu::CPSR_THUMB;
use lumen_gba_core::gba::Gba;

/// WAITCNT with the prefetch buffer enabled and ws0 set to fast sequential
/// (sequential half-word cost 2).
const WAITCNT_PREFETCH_FAST_WS0: u16 = (1 << 14) | (1 << 4);

fn billed(gba: &mut Gba, access: impl FnOnce(&mut Gba)) -> u64 {
    let before = gba.scheduler.cycles();
    access(gba);
    gba.scheduler.cycles() - before
}

fn boot_thumb_prefetch() -> Gba {
    let mut gba = common::boot(common::rom_with_code(0x1000, b"TEST"));
    gba.core.cpsr |= CPSR_THUMB;
    gba.write16(0x0400_0204, WAITCNT_PREFETCH_FAST_WS0, Access::NonSequential);
    gba
}

#[test]
fn sequential_hit_costs_a_single_cycle() {
    let mut gba = boot_thumb_prefetch();

    // Miss: pays the full non-sequential cost and restarts the fetcher.
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0000, Access::NonSequential);
    });
    assert_eq!(cost, 5);
    assert_eq!(gba.memory.pbuffer.tail, 0x0800_0002);

    // Off-cartridge work gives the fetcher time to pull entries in.
    let _ = billed(&mut gba, |gba| {
        gba.read32(0x0300_0000, Access::NonSequential);
        gba.idle_for(3);
    });
    assert!(gba.memory.pbuffer.size >= 1);

    // The tabulated sequential cost is 2; the hit costs 1.
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0002, Access::Sequential);
    });
    assert_eq!(cost, 1);
}

#[test]
fn in_flight_hit_waits_out_the_countdown() {
    let mut gba = boot_thumb_prefetch();

    gba.read16(0x0800_0000, Access::NonSequential);
    assert_eq!(gba.memory.pbuffer.size, 0);
    let countdown = gba.memory.pbuffer.countdown;
    assert_eq!(countdown, 2);

    // No idle time has passed, so the next entry is still in flight; the
    // access waits exactly the remaining fetch time.
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0002, Access::Sequential);
    });
    assert_eq!(cost, countdown as u64);
    assert_eq!(gba.memory.pbuffer.size, 0);
    assert_eq!(gba.memory.pbuffer.tail, 0x0800_0004);
}

#[test]
fn size_stays_within_capacity_and_values_match_without_prefetch() {
    let mut rom = common::rom_with_code(0x1000, b"TEST");
    for (i, byte) in rom.iter_mut().enumerate().skip(0xB0) {
        *byte = i as u8;
    }

    // Same machine twice: prefetch enabled vs. left off.
    let mut gba = common::boot(rom.clone());
    gba.core.cpsr |= CPSR_THUMB;
    gba.write16(0x0400_0204, WAITCNT_PREFETCH_FAST_WS0, Access::NonSequential);
    let mut reference = common::boot(rom);
    reference.core.cpsr |= CPSR_THUMB;

    let mut with_prefetch = Vec::new();
    let mut without = Vec::new();
    for step in 0..32u32 {
        let addr = 0x0800_0100 + step * 2;
        with_prefetch.push(gba.read16(addr, Access::Sequential));
        without.push(reference.read16(addr, Access::Sequential));
        gba.idle_for(2);
        reference.idle_for(2);

        let pbuffer = &gba.memory.pbuffer;
        assert!(pbuffer.size <= pbuffer.capacity);
    }

    // Prefetch changes cycle totals, never the data the CPU sees.
    assert_eq!(with_prefetch, without);
}

#[test]
fn dma_bypasses_prefetch_without_resetting_it() {
    let mut gba = boot_thumb_prefetch();

    gba.read16(0x0800_0000, Access::NonSequential);
    gba.read32(0x0300_0000, Access::NonSequential);
    gba.idle_for(8);
    let saved = gba.memory.pbuffer.clone();
    assert!(saved.size > 0);

    // A cartridge access issued while DMA holds the bus is billed from the
    // tables and leaves the buffer untouched.
    gba.core.is_dma_running = true;
    let cost = billed(&mut gba, |gba| {
        gba.read16(0x0800_0200, Access::NonSequential);
    });
    assert_eq!(cost, 5);
    gba.core.is_dma_running = false;
    assert_eq!(gba.memory.pbuffer, saved);
}
