//! Bus/memory arbitrator.
//!
//! Every CPU and DMA access funnels through here: the top nibble of the
//! address selects a region, the per-emulator latency tables price the
//! access, and the value path applies each region's quirks (BIOS read
//! gating, palette byte-lane mirroring, SRAM byte broadcasting, open bus).
//!
//! The `*_raw` entry points skip cycle accounting and are used by the
//! quicksave codec and debugging hosts.
//!
//! ```text
//! Region        Bus   Read      Write     Cycles   Notes
//! ====================================================================
//! BIOS ROM      32    8/16/32   -         1/1/1    reads gated on PC
//! EWRAM 256K    16    8/16/32   8/16/32   3/3/6
//! IWRAM 32K     32    8/16/32   8/16/32   1/1/1
//! I/O           32    8/16/32   8/16/32   1/1/1
//! Palette RAM   16    8/16/32   16/32     1/1/2    byte writes mirrored
//! VRAM          16    8/16/32   16/32     1/1/2    byte writes mirrored/dropped
//! OAM           32    8/16/32   16/32     1/1/1    byte writes dropped
//! GamePak ROM   16    8/16/32   -         5/5/8    WAITCNT, seq/non-seq
//! GamePak SRAM  8     8         8         5        WAITCNT
//! ```

use log::trace;

use crate::gba::Gba;
use crate::gpio::{GPIO_REG_END, GPIO_REG_START};
use crate::memory::{
    vram_offset, PagedRam, BIOS_END, CART_0_REGION_1, CART_2_REGION_2, CART_MASK,
    CART_REGION_END, CART_REGION_START, EWRAM_MASK, EWRAM_REGION, IWRAM_MASK, IWRAM_REGION,
    OAM_MASK, OAM_REGION, PALRAM_MASK, PALRAM_REGION, SRAM_MIRROR_REGION, SRAM_REGION,
    VRAM_REGION, BIOS_REGION, IO_REGION, NON_SEQUENTIAL, SEQUENTIAL,
};

/// Whether an access follows the previous one on the same bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NonSequential = 0,
    Sequential = 1,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// An access width on the bus.
///
/// The capability set is deliberately small: zero-extension to the bus word,
/// truncation from it, and loads/stores against the region backing stores.
/// The dispatch below is generic over this trait so each width monomorphises
/// to straight-line code with no virtual calls.
pub trait BusValue: sealed::Sealed + Copy {
    const SIZE: u32;
    fn from_u32(val: u32) -> Self;
    fn to_u32(self) -> u32;
    fn load_ram(ram: &PagedRam, offset: usize) -> Self;
    fn store_ram(ram: &mut PagedRam, offset: usize, val: Self);
    fn load_bytes(bytes: &[u8], offset: usize) -> Self;
}

impl BusValue for u8 {
    const SIZE: u32 = 1;

    #[inline]
    fn from_u32(val: u32) -> Self {
        val as u8
    }

    #[inline]
    fn to_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    fn load_ram(ram: &PagedRam, offset: usize) -> Self {
        ram.read8(offset)
    }

    #[inline]
    fn store_ram(ram: &mut PagedRam, offset: usize, val: Self) {
        ram.write8(offset, val);
    }

    #[inline]
    fn load_bytes(bytes: &[u8], offset: usize) -> Self {
        bytes[offset]
    }
}

impl BusValue for u16 {
    const SIZE: u32 = 2;

    #[inline]
    fn from_u32(val: u32) -> Self {
        val as u16
    }

    #[inline]
    fn to_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    fn load_ram(ram: &PagedRam, offset: usize) -> Self {
        ram.read16(offset)
    }

    #[inline]
    fn store_ram(ram: &mut PagedRam, offset: usize, val: Self) {
        ram.write16(offset, val);
    }

    #[inline]
    fn load_bytes(bytes: &[u8], offset: usize) -> Self {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }
}

impl BusValue for u32 {
    const SIZE: u32 = 4;

    #[inline]
    fn from_u32(val: u32) -> Self {
        val
    }

    #[inline]
    fn to_u32(self) -> u32 {
        self
    }

    #[inline]
    fn load_ram(ram: &PagedRam, offset: usize) -> Self {
        ram.read32(offset)
    }

    #[inline]
    fn store_ram(ram: &mut PagedRam, offset: usize, val: Self) {
        ram.write32(offset, val);
    }

    #[inline]
    fn load_bytes(bytes: &[u8], offset: usize) -> Self {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }
}

#[inline]
fn align_down(addr: u32, size: u32) -> u32 {
    addr & !(size - 1)
}

/// "Address as data" pattern returned for cartridge reads past the ROM.
fn cart_unmapped_pattern<T: BusValue>(addr: u32) -> T {
    match T::SIZE {
        4 => T::from_u32(((addr >> 1) & 0xFFFF) | ((((addr + 2) >> 1) & 0xFFFF) << 16)),
        2 => T::from_u32((addr >> 1) & 0xFFFF),
        _ => T::from_u32((addr >> (1 + 8 * (addr & 1))) & 0xFF),
    }
}

impl Gba {
    /// Recompute the cartridge/SRAM rows of the latency tables from WAITCNT.
    pub(crate) fn update_waitstates(&mut self) {
        const NONSEQ_BASE: [u32; 4] = [4, 3, 2, 8];

        let waitcnt = self.io.waitcnt;
        let sram = (waitcnt & 0x3) as usize;
        let ws0_nonseq = ((waitcnt >> 2) & 0x3) as usize;
        let ws0_seq = (waitcnt >> 4) & 0x1;
        let ws1_nonseq = ((waitcnt >> 5) & 0x3) as usize;
        let ws1_seq = (waitcnt >> 7) & 0x1;
        let ws2_nonseq = ((waitcnt >> 8) & 0x3) as usize;
        let ws2_seq = (waitcnt >> 10) & 0x1;

        let memory = &mut self.memory;
        let t16 = &mut memory.access_time16;

        for page in [CART_0_REGION_1, CART_0_REGION_1 + 1] {
            t16[NON_SEQUENTIAL][page as usize] = 1 + NONSEQ_BASE[ws0_nonseq];
            t16[SEQUENTIAL][page as usize] = 1 + if ws0_seq != 0 { 1 } else { 2 };
        }
        for page in [CART_0_REGION_1 + 2, CART_0_REGION_1 + 3] {
            t16[NON_SEQUENTIAL][page as usize] = 1 + NONSEQ_BASE[ws1_nonseq];
            t16[SEQUENTIAL][page as usize] = 1 + if ws1_seq != 0 { 1 } else { 4 };
        }
        for page in [CART_0_REGION_1 + 4, CART_0_REGION_1 + 5] {
            t16[NON_SEQUENTIAL][page as usize] = 1 + NONSEQ_BASE[ws2_nonseq];
            t16[SEQUENTIAL][page as usize] = 1 + if ws2_seq != 0 { 1 } else { 8 };
        }
        for page in [SRAM_REGION, SRAM_MIRROR_REGION] {
            t16[NON_SEQUENTIAL][page as usize] = 1 + NONSEQ_BASE[sram];
            t16[SEQUENTIAL][page as usize] = 1 + NONSEQ_BASE[sram];
        }

        // A 32-bit access on the 16-bit cartridge bus is one non-sequential
        // plus one sequential half-word (or two sequential ones).
        for page in CART_0_REGION_1 as usize..=SRAM_MIRROR_REGION as usize {
            memory.access_time32[NON_SEQUENTIAL][page] =
                t16[NON_SEQUENTIAL][page] + t16[SEQUENTIAL][page];
            memory.access_time32[SEQUENTIAL][page] = 2 * t16[SEQUENTIAL][page];
        }

        // WAITCNT bit 14 gates the prefetch buffer, under the host setting's
        // master switch.
        self.memory.pbuffer.enabled =
            self.settings.prefetch_buffer && waitcnt & (1 << 14) != 0;
    }

    /// Charge the cycle cost of one bus access, routing cartridge fetches
    /// through the prefetch buffer when it is allowed to serve them.
    fn mem_access(&mut self, addr: u32, size: u32, mut access: Access) {
        let addr = align_down(addr, size);
        let page = (addr >> 24) & 0xF;
        let in_cart = (CART_REGION_START..=CART_REGION_END).contains(&page);

        // Crossing a 128 KiB boundary always reopens the cartridge row.
        if in_cart && addr & 0x1_FFFF == 0 {
            access = Access::NonSequential;
        }

        // A CPU access takes the bus back from the DMA engine; the engine
        // itself re-asserts the flag after every unit it moves.
        if !self.core.is_dma_running {
            self.memory.was_last_access_from_dma = false;
        }

        let row = access as usize;
        let cycles = if size <= 2 {
            self.memory.access_time16[row][page as usize]
        } else {
            self.memory.access_time32[row][page as usize]
        };

        if !in_cart || !self.memory.pbuffer.enabled || self.core.is_dma_running {
            self.memory.gamepak_bus_in_use = in_cart;
            self.idle_for(cycles);
            return;
        }

        self.memory.gamepak_bus_in_use = true;
        self.prefetch_access(addr, cycles, page);
    }

    fn prefetch_access(&mut self, addr: u32, cycles: u32, page: u32) {
        if self.memory.pbuffer.tail == addr {
            if self.memory.pbuffer.size == 0 {
                // Sequential hit on the entry still being fetched: release
                // the bus and wait it out. The prefetcher completes the
                // fetch during the idle time, and the CPU consumes it.
                let wait = self.memory.pbuffer.countdown;
                self.memory.gamepak_bus_in_use = false;
                self.idle_for(wait);
                let pbuffer = &mut self.memory.pbuffer;
                pbuffer.tail = pbuffer.tail.wrapping_add(pbuffer.insn_len);
                pbuffer.size -= 1;
            } else {
                // Sequential hit on a ready entry costs a single cycle.
                let pbuffer = &mut self.memory.pbuffer;
                pbuffer.tail = pbuffer.tail.wrapping_add(pbuffer.insn_len);
                pbuffer.size -= 1;
                self.memory.gamepak_bus_in_use = false;
                self.idle();
            }
            return;
        }

        // Miss: pay the tabulated cost with the bus held, then restart the
        // fetcher behind the new address with the current execution state's
        // geometry.
        self.idle_for(cycles);
        let thumb = self.core.thumb();
        let reload = if thumb {
            self.memory.access_time16[SEQUENTIAL][page as usize]
        } else {
            self.memory.access_time32[SEQUENTIAL][page as usize]
        };
        let (insn_len, capacity) = if thumb { (2, 8) } else { (4, 4) };
        self.memory.pbuffer.restart(addr, insn_len, capacity, reload);
    }

    /// Value driven onto the bus for reads the memory system cannot service.
    ///
    /// The rules follow GBATek's "GBA Unpredictable Things": the CPU pipeline
    /// latch supplies the value (with per-region mixing in Thumb state), and
    /// the DMA data latch takes over while the last bus user was the DMA
    /// engine.
    pub(crate) fn open_bus_read(&self, addr: u32) -> u32 {
        let shift = 8 * (addr & 0x3);

        if self.memory.was_last_access_from_dma {
            return self.memory.dma_bus >> shift;
        }

        if !self.core.thumb() {
            return self.core.prefetch[1] >> shift;
        }

        let pc = self.core.pc();
        let [fetched, decoded] = self.core.prefetch;
        let val = match pc >> 24 {
            EWRAM_REGION | PALRAM_REGION | VRAM_REGION | CART_0_REGION_1..=CART_2_REGION_2 => {
                decoded | (decoded << 16)
            }
            BIOS_REGION | OAM_REGION => {
                if pc & 0x2 == 0 {
                    decoded | (decoded << 16)
                } else {
                    fetched | (decoded << 16)
                }
            }
            IWRAM_REGION => {
                if pc & 0x2 == 0 {
                    decoded | (fetched << 16)
                } else {
                    fetched | (decoded << 16)
                }
            }
            page => panic!("open-bus read with the program counter in an impossible page: 0x{page:02X}"),
        };
        val >> shift
    }

    fn bus_read<T: BusValue>(&mut self, unaligned_addr: u32) -> T {
        let addr = align_down(unaligned_addr, T::SIZE);
        match addr >> 24 {
            BIOS_REGION if addr <= BIOS_END => {
                let shift = 8 * (addr & 0x3);
                if self.core.pc() <= BIOS_END {
                    let word_addr = (addr & !0x3) as usize;
                    self.memory.bios_bus = u32::from_le_bytes(
                        self.memory.bios[word_addr..word_addr + 4].try_into().unwrap(),
                    );
                }
                T::from_u32(self.memory.bios_bus >> shift)
            }
            EWRAM_REGION => T::load_ram(&self.memory.ewram, (addr & EWRAM_MASK) as usize),
            IWRAM_REGION => T::load_ram(&self.memory.iwram, (addr & IWRAM_MASK) as usize),
            IO_REGION => {
                let mut val = 0u32;
                for i in 0..T::SIZE {
                    val |= (self.io_read8(addr + i) as u32) << (8 * i);
                }
                T::from_u32(val)
            }
            PALRAM_REGION => T::load_ram(&self.memory.palram, (addr & PALRAM_MASK) as usize),
            VRAM_REGION => T::load_ram(&self.memory.vram, vram_offset(addr)),
            OAM_REGION => T::load_ram(&self.memory.oam, (addr & OAM_MASK) as usize),
            CART_REGION_START..=CART_REGION_END => {
                if self.backup.kind.is_eeprom()
                    && addr & self.backup.eeprom.mask == self.backup.eeprom.range
                {
                    return T::from_u32(self.eeprom_read8() as u32);
                }
                if (GPIO_REG_START..=GPIO_REG_END).contains(&addr) && self.gpio.readable() {
                    return T::from_u32(self.gpio_read8(addr) as u32);
                }
                let offset = (addr & CART_MASK) as usize;
                if offset + T::SIZE as usize <= self.memory.rom.len() {
                    T::load_bytes(self.memory.rom.bytes(), offset)
                } else {
                    cart_unmapped_pattern::<T>(addr)
                }
            }
            SRAM_REGION | SRAM_MIRROR_REGION => {
                // The backup bus is 8 bits wide; wider reads see the byte on
                // every lane.
                let byte = self.backup_read8(unaligned_addr) as u32;
                T::from_u32(byte.wrapping_mul(0x0101_0101))
            }
            _ => {
                trace!(
                    target: "bus",
                    "invalid read of size {} from 0x{addr:08X}",
                    T::SIZE,
                );
                T::from_u32(self.open_bus_read(addr))
            }
        }
    }

    fn bus_write<T: BusValue>(&mut self, unaligned_addr: u32, val: T) {
        let addr = align_down(unaligned_addr, T::SIZE);
        match addr >> 24 {
            // Write attempts to the BIOS are silently ignored.
            BIOS_REGION => {}
            EWRAM_REGION => T::store_ram(&mut self.memory.ewram, (addr & EWRAM_MASK) as usize, val),
            IWRAM_REGION => T::store_ram(&mut self.memory.iwram, (addr & IWRAM_MASK) as usize, val),
            IO_REGION => {
                let raw = val.to_u32();
                for i in 0..T::SIZE {
                    self.io_write8(addr + i, (raw >> (8 * i)) as u8);
                }
            }
            PALRAM_REGION => {
                if T::SIZE == 1 {
                    // Byte stores to palette RAM land on both byte lanes of
                    // the enclosing half-word.
                    let base = addr & !0x1;
                    let byte = val.to_u32() as u8;
                    self.memory.palram.write8((base & PALRAM_MASK) as usize, byte);
                    self.memory
                        .palram
                        .write8(((base + 1) & PALRAM_MASK) as usize, byte);
                } else {
                    T::store_ram(&mut self.memory.palram, (addr & PALRAM_MASK) as usize, val);
                }
            }
            VRAM_REGION => {
                if T::SIZE == 1 {
                    // Byte stores mirror like palette RAM in the background
                    // region and are dropped entirely in the OBJ region,
                    // whose floor depends on the video mode.
                    let obj_start = if self.io.bg_mode() <= 2 { 0x1_0000 } else { 0x1_4000 };
                    if addr & 0x1_FFFF < obj_start {
                        let base = addr & !0x1;
                        let byte = val.to_u32() as u8;
                        self.memory.vram.write8(vram_offset(base), byte);
                        self.memory.vram.write8(vram_offset(base + 1), byte);
                    }
                } else {
                    T::store_ram(&mut self.memory.vram, vram_offset(addr), val);
                }
            }
            OAM_REGION => {
                // Byte stores to OAM are dropped.
                if T::SIZE != 1 {
                    T::store_ram(&mut self.memory.oam, (addr & OAM_MASK) as usize, val);
                }
            }
            CART_REGION_START..=CART_REGION_END => {
                if self.backup.kind.is_eeprom()
                    && addr & self.backup.eeprom.mask == self.backup.eeprom.range
                {
                    self.eeprom_write8(val.to_u32() as u8);
                } else if (GPIO_REG_START..=GPIO_REG_END).contains(&addr) {
                    self.gpio_write8(addr, val.to_u32() as u8);
                }
                // Everything else on the cartridge bus ignores writes.
            }
            SRAM_REGION | SRAM_MIRROR_REGION => {
                // The backup chip sees a single byte, rotated out of the
                // lane the unaligned address selects.
                let lane = 8 * (unaligned_addr % T::SIZE);
                self.backup_write8(unaligned_addr, (val.to_u32() >> lane) as u8);
            }
            _ => {
                trace!(
                    target: "bus",
                    "invalid write of size {} to 0x{addr:08X}",
                    T::SIZE,
                );
            }
        }
    }

    pub fn read8(&mut self, addr: u32, access: Access) -> u8 {
        self.mem_access(addr, 1, access);
        self.bus_read::<u8>(addr)
    }

    pub fn read16(&mut self, addr: u32, access: Access) -> u16 {
        self.mem_access(addr, 2, access);
        self.bus_read::<u16>(addr)
    }

    /// 16-bit read rotated for a misaligned address, as the ARM7TDMI does
    /// for unaligned half-word loads.
    pub fn read16_ror(&mut self, addr: u32, access: Access) -> u32 {
        self.mem_access(addr, 2, access);
        let value = self.bus_read::<u16>(addr) as u32;
        value.rotate_right(8 * (addr & 0x1))
    }

    pub fn read32(&mut self, addr: u32, access: Access) -> u32 {
        self.mem_access(addr, 4, access);
        self.bus_read::<u32>(addr)
    }

    /// 32-bit read rotated for a misaligned address.
    pub fn read32_ror(&mut self, addr: u32, access: Access) -> u32 {
        self.mem_access(addr, 4, access);
        let value = self.bus_read::<u32>(addr);
        value.rotate_right(8 * (addr & 0x3))
    }

    pub fn write8(&mut self, addr: u32, val: u8, access: Access) {
        self.mem_access(addr, 1, access);
        self.bus_write::<u8>(addr, val);
    }

    pub fn write16(&mut self, addr: u32, val: u16, access: Access) {
        self.mem_access(addr, 2, access);
        self.bus_write::<u16>(addr, val);
    }

    pub fn write32(&mut self, addr: u32, val: u32, access: Access) {
        self.mem_access(addr, 4, access);
        self.bus_write::<u32>(addr, val);
    }

    // Untimed accessors for the quicksave codec and debugging hosts.

    pub fn read8_raw(&mut self, addr: u32) -> u8 {
        self.bus_read::<u8>(addr)
    }

    pub fn read16_raw(&mut self, addr: u32) -> u16 {
        self.bus_read::<u16>(addr)
    }

    pub fn read32_raw(&mut self, addr: u32) -> u32 {
        self.bus_read::<u32>(addr)
    }

    pub fn write8_raw(&mut self, addr: u32, val: u8) {
        self.bus_write::<u8>(addr, val);
    }

    pub fn write16_raw(&mut self, addr: u32, val: u16) {
        self.bus_write::<u16>(addr, val);
    }

    pub fn write32_raw(&mut self, addr: u32, val: u32) {
        self.bus_write::<u32>(addr, val);
    }
}
