//! Quicksave codec.
//!
//! A quicksave is a chunked, versioned binary snapshot of the whole emulator.
//! Every multi-byte integer is little-endian and every structure is written
//! field by field, so the format is independent of the host's struct layout.
//!
//! Stream layout (version 2):
//!
//! ```text
//! header     magic "HSQS", version u32, rom_size u32, rom_code u32
//! chunk*     kind u32, size u32, payload u8[size]
//! ```
//!
//! Unknown chunk kinds are skipped by their declared size so newer streams
//! degrade gracefully. RAM regions and the backup payload are run-length
//! encoded when that is strictly smaller than the raw bytes; loaders accept
//! both encodings unconditionally.
//!
//! Version 1 (load-only) predates the chunk container: a flat concatenation
//! of the same field-by-field records with the RAM regions raw.

use thiserror::Error;

use crate::apu::{Apu, Fifo, FIFO_CAPACITY};
use crate::backup::{BackupType, Eeprom, EepromState, Flash, FlashState};
use crate::cpu::Core;
use crate::dma::DmaChannel;
use crate::gba::Gba;
use crate::gpio::{Gpio, GpioDevice, Rtc, RtcState};
use crate::io::Io;
use crate::memory::PagedRam;
use crate::ppu::{Ppu, FRAMEBUFFER_PIXELS};
use crate::prefetch::PrefetchBuffer;
use crate::scheduler::{Event, EventKind};
use crate::timer::Timer;

pub const QUICKSAVE_MAGIC: [u8; 4] = *b"HSQS";
pub const QUICKSAVE_VERSION: u32 = 2;

const CHUNK_CORE: u32 = 1;
const CHUNK_IO: u32 = 2;
const CHUNK_PPU: u32 = 3;
const CHUNK_GPIO: u32 = 4;
const CHUNK_APU: u32 = 5;
const CHUNK_SCHEDULER: u32 = 6;
const CHUNK_SCHED_EVENTS: u32 = 7;
const CHUNK_MEMORY_META: u32 = 8;
const CHUNK_EWRAM: u32 = 9;
const CHUNK_IWRAM: u32 = 10;
const CHUNK_VRAM: u32 = 11;
const CHUNK_PALRAM: u32 = 12;
const CHUNK_OAM: u32 = 13;
const CHUNK_BACKUP_STORAGE: u32 = 14;

const ENCODING_RAW: u8 = 0;
const ENCODING_RLE: u8 = 1;

// Serialized record sizes. Loaders reject scalar chunks whose declared size
// differs from these, so any codec change must bump the format version.
const CORE_CHUNK_SIZE: u32 = 83;
const IO_CHUNK_SIZE: u32 = 204;
const PPU_CHUNK_SIZE: u32 = 6 + 4 * FRAMEBUFFER_PIXELS as u32;
const GPIO_CHUNK_SIZE: u32 = 27;
const APU_CHUNK_SIZE: u32 = 70;
const SCHEDULER_CHUNK_SIZE: u32 = 24;
const EVENT_RECORD_SIZE: u32 = 28;
const MEMORY_META_CHUNK_SIZE: u32 = 69;
const BACKUP_META_SIZE: u32 = 9;

#[derive(Debug, Error)]
pub enum QuickloadError {
    /// The quicksave was taken under a different ROM; nothing was modified.
    #[error("quicksave ROM size or code does not match the loaded ROM")]
    Mismatch,
    /// The stream is malformed. The emulator may have been partially
    /// modified and needs a reset.
    #[error("corrupt quicksave: {0}")]
    Corrupt(&'static str),
}

type Result<T> = std::result::Result<T, QuickloadError>;

#[derive(Default)]
struct Writer {
    data: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, val: u8) {
        self.data.push(val);
    }

    fn bool(&mut self, val: bool) {
        self.u8(val as u8);
    }

    fn u16(&mut self, val: u16) {
        self.data.extend_from_slice(&val.to_le_bytes());
    }

    fn u32(&mut self, val: u32) {
        self.data.extend_from_slice(&val.to_le_bytes());
    }

    fn u64(&mut self, val: u64) {
        self.data.extend_from_slice(&val.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

/// Bounds-checked cursor over a byte buffer. Chunk payloads get their own
/// reader over the chunk's slice, so every read is checked against the
/// enclosing chunk end rather than just the buffer end.
struct Reader<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(QuickloadError::Corrupt("truncated stream"));
        }
        let slice = &self.data[self.index..self.index + len];
        self.index += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn write_chunk(out: &mut Writer, kind: u32, payload: impl FnOnce(&mut Writer)) {
    let mut chunk = Writer::default();
    payload(&mut chunk);
    out.u32(kind);
    out.u32(chunk.data.len() as u32);
    out.bytes(&chunk.data);
}

/// Run-length encode `data` as (u16 length, u8 value) pairs.
fn encode_rle(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let value = data[i];
        let mut run = 1usize;
        while i + run < data.len() && data[i + run] == value && run < u16::MAX as usize {
            run += 1;
        }
        out.extend_from_slice(&(run as u16).to_le_bytes());
        out.push(value);
        i += run;
    }
    out
}

/// Write a region payload, picking RLE only when it is strictly smaller.
fn write_region_payload(out: &mut Writer, data: &[u8]) {
    let rle = encode_rle(data);

    out.u32(data.len() as u32);
    if !rle.is_empty() && rle.len() < data.len() {
        out.u8(ENCODING_RLE);
        out.bytes(&[0; 3]);
        out.bytes(&rle);
    } else {
        out.u8(ENCODING_RAW);
        out.bytes(&[0; 3]);
        out.bytes(data);
    }
}

/// Decode a region payload into `dst`, which must match the declared size.
fn read_region_payload(reader: &mut Reader, dst: &mut [u8]) -> Result<()> {
    let decoded_size = reader.u32()? as usize;
    let encoding = reader.u8()?;
    reader.take(3)?;

    if decoded_size != dst.len() {
        return Err(QuickloadError::Corrupt("region size mismatch"));
    }

    match encoding {
        ENCODING_RAW => {
            dst.copy_from_slice(reader.take(decoded_size)?);
            Ok(())
        }
        ENCODING_RLE => {
            let mut produced = 0;
            while produced < decoded_size {
                let run = reader.u16()? as usize;
                let value = reader.u8()?;
                if run > decoded_size - produced {
                    return Err(QuickloadError::Corrupt("RLE run overflows its region"));
                }
                dst[produced..produced + run].fill(value);
                produced += run;
            }
            Ok(())
        }
        _ => Err(QuickloadError::Corrupt("unknown region encoding")),
    }
}

fn encode_core(core: &Core, out: &mut Writer) {
    for reg in core.registers {
        out.u32(reg);
    }
    out.u32(core.cpsr);
    out.u32(core.spsr);
    out.u32(core.prefetch[0]);
    out.u32(core.prefetch[1]);
    out.bool(core.is_dma_running);
    out.bool(core.halted);
    out.bool(core.irq_line);
}

fn decode_core(reader: &mut Reader) -> Result<Core> {
    let mut registers = [0u32; 16];
    for reg in &mut registers {
        *reg = reader.u32()?;
    }
    Ok(Core {
        registers,
        cpsr: reader.u32()?,
        spsr: reader.u32()?,
        prefetch: [reader.u32()?, reader.u32()?],
        is_dma_running: reader.bool()?,
        halted: reader.bool()?,
        irq_line: reader.bool()?,
    })
}

fn encode_io(io: &Io, out: &mut Writer) {
    out.u16(io.dispcnt);
    out.u16(io.greenswap);
    out.u16(io.dispstat);
    out.u16(io.vcount);
    out.u16(io.soundcnt_l);
    out.u16(io.soundcnt_h);
    out.u16(io.soundcnt_x);
    out.u16(io.soundbias);
    out.u16(io.keyinput);
    out.u16(io.keycnt);
    out.u16(io.ie);
    out.u16(io.irq_flags);
    out.bool(io.ime);
    out.u16(io.waitcnt);
    out.u8(io.postflg);
    for timer in &io.timers {
        out.u16(timer.reload);
        out.u16(timer.control);
        out.u16(timer.counter);
        out.u64(timer.started_at);
        out.u32(timer.handle);
        out.bool(timer.is_counting);
    }
    for dma in &io.dma {
        out.u32(dma.src);
        out.u32(dma.dst);
        out.u16(dma.count);
        out.u16(dma.control);
        out.u32(dma.internal_src);
        out.u32(dma.internal_dst);
        out.u32(dma.internal_count);
        out.bool(dma.pending);
    }
}

fn decode_io(reader: &mut Reader) -> Result<Io> {
    let mut io = Io {
        dispcnt: reader.u16()?,
        greenswap: reader.u16()?,
        dispstat: reader.u16()?,
        vcount: reader.u16()?,
        soundcnt_l: reader.u16()?,
        soundcnt_h: reader.u16()?,
        soundcnt_x: reader.u16()?,
        soundbias: reader.u16()?,
        keyinput: reader.u16()?,
        keycnt: reader.u16()?,
        ie: reader.u16()?,
        irq_flags: reader.u16()?,
        ime: reader.bool()?,
        waitcnt: reader.u16()?,
        postflg: reader.u8()?,
        timers: Default::default(),
        dma: Default::default(),
    };
    for timer in &mut io.timers {
        *timer = Timer {
            reload: reader.u16()?,
            control: reader.u16()?,
            counter: reader.u16()?,
            started_at: reader.u64()?,
            handle: reader.u32()?,
            is_counting: reader.bool()?,
        };
    }
    for dma in &mut io.dma {
        *dma = DmaChannel {
            src: reader.u32()?,
            dst: reader.u32()?,
            count: reader.u16()?,
            control: reader.u16()?,
            internal_src: reader.u32()?,
            internal_dst: reader.u32()?,
            internal_count: reader.u32()?,
            pending: reader.bool()?,
        };
    }
    Ok(io)
}

fn encode_ppu(ppu: &Ppu, out: &mut Writer) {
    out.bool(ppu.skip_current_frame);
    out.u32(ppu.current_frame_skip_counter);
    out.bool(ppu.video_capture_enabled);
    for &pixel in ppu.framebuffer.iter() {
        out.u32(pixel);
    }
}

fn decode_ppu(reader: &mut Reader) -> Result<Ppu> {
    let mut ppu = Ppu::new();
    ppu.skip_current_frame = reader.bool()?;
    ppu.current_frame_skip_counter = reader.u32()?;
    ppu.video_capture_enabled = reader.bool()?;
    for pixel in ppu.framebuffer.iter_mut() {
        *pixel = reader.u32()?;
    }
    Ok(ppu)
}

fn encode_gpio(gpio: &Gpio, out: &mut Writer) {
    out.u32(gpio.device as u32);
    out.u8(gpio.data);
    out.u8(gpio.direction);
    out.u8(gpio.control);
    out.u8(gpio.rtc.state as u8);
    out.u8(gpio.rtc.active_reg);
    out.u8(gpio.rtc.bit_count);
    out.u64(gpio.rtc.buffer);
    out.u8(gpio.rtc.control);
    out.bytes(&gpio.rtc.datetime);
    out.u8(gpio.rtc.pins);
}

fn decode_gpio(reader: &mut Reader) -> Result<Gpio> {
    let device = GpioDevice::from_u32(reader.u32()?)
        .ok_or(QuickloadError::Corrupt("unknown GPIO device"))?;
    let data = reader.u8()?;
    let direction = reader.u8()?;
    let control = reader.u8()?;
    let rtc = Rtc {
        state: RtcState::from_u8(reader.u8()?)
            .ok_or(QuickloadError::Corrupt("unknown RTC state"))?,
        active_reg: reader.u8()?,
        bit_count: reader.u8()?,
        buffer: reader.u64()?,
        control: reader.u8()?,
        datetime: reader.take(7)?.try_into().unwrap(),
        pins: reader.u8()?,
    };
    Ok(Gpio {
        device,
        data,
        direction,
        control,
        rtc,
    })
}

fn encode_apu(apu: &Apu, out: &mut Writer) {
    for fifo in &apu.fifos {
        out.bytes(&fifo.data);
        out.u8(fifo.read_idx);
        out.u8(fifo.size);
    }
    out.u8(apu.latch[0] as u8);
    out.u8(apu.latch[1] as u8);
}

fn decode_apu(reader: &mut Reader) -> Result<Apu> {
    let mut apu = Apu::default();
    for fifo in &mut apu.fifos {
        *fifo = Fifo {
            data: reader.take(FIFO_CAPACITY)?.try_into().unwrap(),
            read_idx: reader.u8()?,
            size: reader.u8()?,
        };
        if fifo.read_idx as usize >= FIFO_CAPACITY || fifo.size as usize > FIFO_CAPACITY {
            return Err(QuickloadError::Corrupt("FIFO indices out of range"));
        }
    }
    apu.latch = [reader.u8()? as i8, reader.u8()? as i8];
    Ok(apu)
}

fn encode_event(event: &Event, out: &mut Writer) {
    out.u32(event.kind as u32);
    out.bool(event.active);
    out.bool(event.repeat);
    out.u16(0);
    out.u64(event.at);
    out.u64(event.period);
    out.u32(event.arg);
}

fn decode_event(reader: &mut Reader) -> Result<Event> {
    let kind = EventKind::from_u32(reader.u32()?)
        .ok_or(QuickloadError::Corrupt("unknown event kind"))?;
    let active = reader.bool()?;
    let repeat = reader.bool()?;
    reader.u16()?;
    let mut event = Event::once(kind, 0);
    event.active = active;
    event.repeat = repeat;
    event.at = reader.u64()?;
    event.period = reader.u64()?;
    event.arg = reader.u32()?;
    Ok(event)
}

fn encode_memory_meta(gba: &Gba, out: &mut Writer) {
    let flash = &gba.backup.flash;
    out.u8(flash.state as u8);
    out.u8(flash.bank);
    out.bool(flash.erase_mode);
    out.bool(flash.identify);

    let eeprom = &gba.backup.eeprom;
    out.u32(eeprom.mask);
    out.u32(eeprom.range);
    out.u8(eeprom.state as u8);
    out.u32(eeprom.address);
    out.u64(eeprom.buffer);
    out.u8(eeprom.bit_count);

    out.u32(gba.backup.kind as u32);

    let pbuffer = &gba.memory.pbuffer;
    out.u32(pbuffer.insn_len);
    out.u32(pbuffer.capacity);
    out.u32(pbuffer.size);
    out.u32(pbuffer.head);
    out.u32(pbuffer.tail);
    out.u32(pbuffer.countdown);
    out.u32(pbuffer.reload);
    out.bool(pbuffer.enabled);

    out.u32(gba.memory.bios_bus);
    out.u32(gba.memory.dma_bus);
    out.bool(gba.memory.was_last_access_from_dma);
    out.bool(gba.memory.gamepak_bus_in_use);
}

fn apply_memory_meta(gba: &mut Gba, reader: &mut Reader) -> Result<()> {
    let flash = Flash {
        state: FlashState::from_u8(reader.u8()?)
            .ok_or(QuickloadError::Corrupt("unknown flash state"))?,
        bank: reader.u8()?,
        erase_mode: reader.bool()?,
        identify: reader.bool()?,
    };
    let eeprom = Eeprom {
        mask: reader.u32()?,
        range: reader.u32()?,
        state: EepromState::from_u8(reader.u8()?)
            .ok_or(QuickloadError::Corrupt("unknown EEPROM state"))?,
        address: reader.u32()?,
        buffer: reader.u64()?,
        bit_count: reader.u8()?,
    };
    let backup_type = BackupType::from_u32(reader.u32()?)
        .ok_or(QuickloadError::Corrupt("unknown backup type"))?;
    let pbuffer = PrefetchBuffer {
        insn_len: reader.u32()?,
        capacity: reader.u32()?,
        size: reader.u32()?,
        head: reader.u32()?,
        tail: reader.u32()?,
        countdown: reader.u32()?,
        reload: reader.u32()?,
        enabled: reader.bool()?,
    };

    gba.backup.flash = flash;
    gba.backup.eeprom = eeprom;
    gba.backup.kind = backup_type;
    gba.memory.pbuffer = pbuffer;
    gba.memory.bios_bus = reader.u32()?;
    gba.memory.dma_bus = reader.u32()?;
    gba.memory.was_last_access_from_dma = reader.bool()?;
    gba.memory.gamepak_bus_in_use = reader.bool()?;
    Ok(())
}

fn write_region_chunk(out: &mut Writer, kind: u32, region: &PagedRam) {
    let data = region.to_vec();
    write_chunk(out, kind, |chunk| write_region_payload(chunk, &data));
}

fn load_region_chunk(region: &mut PagedRam, reader: &mut Reader) -> Result<()> {
    let mut buf = vec![0u8; region.len()];
    read_region_payload(reader, &mut buf)?;
    region.load_bytes(&buf);
    Ok(())
}

#[derive(Default)]
struct SeenChunks {
    core: bool,
    io: bool,
    ppu: bool,
    gpio: bool,
    apu: bool,
    scheduler: bool,
    memory_meta: bool,
    ewram: bool,
    iwram: bool,
    vram: bool,
    palram: bool,
    oam: bool,
    backup: bool,
}

impl SeenChunks {
    fn all_mandatory(&self) -> bool {
        self.core
            && self.io
            && self.ppu
            && self.gpio
            && self.apu
            && self.scheduler
            && self.memory_meta
            && self.ewram
            && self.iwram
            && self.vram
            && self.palram
            && self.oam
    }
}

impl Gba {
    /// Serialise the complete emulator state.
    ///
    /// Must only be called between instructions, when the machine state is
    /// quiescent.
    pub fn quicksave(&self) -> Vec<u8> {
        let mut out = Writer::default();

        out.bytes(&QUICKSAVE_MAGIC);
        out.u32(QUICKSAVE_VERSION);
        out.u32(self.memory.rom.len().min(u32::MAX as usize) as u32);
        out.u32(self.memory.rom.code());

        write_chunk(&mut out, CHUNK_CORE, |chunk| encode_core(&self.core, chunk));
        write_chunk(&mut out, CHUNK_IO, |chunk| encode_io(&self.io, chunk));
        write_chunk(&mut out, CHUNK_PPU, |chunk| encode_ppu(&self.ppu, chunk));
        write_chunk(&mut out, CHUNK_GPIO, |chunk| encode_gpio(&self.gpio, chunk));
        write_chunk(&mut out, CHUNK_APU, |chunk| encode_apu(&self.apu, chunk));

        let events = self.scheduler.events();
        write_chunk(&mut out, CHUNK_SCHEDULER, |chunk| {
            chunk.u64(self.scheduler.cycles());
            chunk.u64(self.scheduler.next_event());
            chunk.u64(events.len() as u64);
        });
        if !events.is_empty() {
            write_chunk(&mut out, CHUNK_SCHED_EVENTS, |chunk| {
                for event in events {
                    encode_event(event, chunk);
                }
            });
        }

        write_chunk(&mut out, CHUNK_MEMORY_META, |chunk| {
            encode_memory_meta(self, chunk)
        });

        write_region_chunk(&mut out, CHUNK_EWRAM, &self.memory.ewram);
        write_region_chunk(&mut out, CHUNK_IWRAM, &self.memory.iwram);
        write_region_chunk(&mut out, CHUNK_VRAM, &self.memory.vram);
        write_region_chunk(&mut out, CHUNK_PALRAM, &self.memory.palram);
        write_region_chunk(&mut out, CHUNK_OAM, &self.memory.oam);

        let storage = self.shared.backup_storage.data.lock().unwrap();
        if !storage.is_empty() {
            let dirty = self.shared.backup_dirty();
            write_chunk(&mut out, CHUNK_BACKUP_STORAGE, |chunk| {
                chunk.u64(storage.len() as u64);
                chunk.bool(dirty);
                write_region_payload(chunk, &storage);
            });
        }
        drop(storage);

        out.data
    }

    /// Restore the emulator from a quicksave stream.
    ///
    /// A `Mismatch` error leaves the state untouched. A `Corrupt` error may
    /// leave it partially restored; callers must treat the emulator as
    /// requiring a fresh reset.
    pub fn quickload(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = Reader::new(data);

        // Streams that predate the magic fall back to the flat v1 layout.
        if data.len() < 16 || data[0..4] != QUICKSAVE_MAGIC {
            return self.quickload_v1(data);
        }
        reader.take(4).unwrap();

        if reader.u32()? != QUICKSAVE_VERSION {
            return Err(QuickloadError::Corrupt("unsupported version"));
        }

        let rom_size = reader.u32()?;
        let rom_code = reader.u32()?;
        if rom_size != self.memory.rom.len().min(u32::MAX as usize) as u32
            || rom_code != self.memory.rom.code()
        {
            return Err(QuickloadError::Mismatch);
        }

        self.scheduler.clear_events();

        let mut seen = SeenChunks::default();
        let mut sched_snapshot: Option<(u64, u64, u64)> = None;
        let mut events_tmp: Vec<Event> = Vec::new();

        while reader.remaining() > 0 {
            let kind = reader.u32()?;
            let size = reader.u32()? as usize;
            let payload = reader.take(size)?;
            let mut chunk = Reader::new(payload);

            let expect_size = |expected: u32| -> Result<()> {
                if size == expected as usize {
                    Ok(())
                } else {
                    Err(QuickloadError::Corrupt("scalar chunk size mismatch"))
                }
            };

            match kind {
                CHUNK_CORE => {
                    expect_size(CORE_CHUNK_SIZE)?;
                    self.core = decode_core(&mut chunk)?;
                    seen.core = true;
                }
                CHUNK_IO => {
                    expect_size(IO_CHUNK_SIZE)?;
                    self.io = decode_io(&mut chunk)?;
                    seen.io = true;
                }
                CHUNK_PPU => {
                    expect_size(PPU_CHUNK_SIZE)?;
                    self.ppu = decode_ppu(&mut chunk)?;
                    seen.ppu = true;
                }
                CHUNK_GPIO => {
                    expect_size(GPIO_CHUNK_SIZE)?;
                    self.gpio = decode_gpio(&mut chunk)?;
                    seen.gpio = true;
                }
                CHUNK_APU => {
                    expect_size(APU_CHUNK_SIZE)?;
                    self.apu = decode_apu(&mut chunk)?;
                    seen.apu = true;
                }
                CHUNK_SCHEDULER => {
                    expect_size(SCHEDULER_CHUNK_SIZE)?;
                    sched_snapshot = Some((chunk.u64()?, chunk.u64()?, chunk.u64()?));
                    seen.scheduler = true;
                }
                CHUNK_SCHED_EVENTS => {
                    if size % EVENT_RECORD_SIZE as usize != 0 {
                        return Err(QuickloadError::Corrupt("odd scheduler event chunk size"));
                    }
                    events_tmp = Vec::with_capacity(size / EVENT_RECORD_SIZE as usize);
                    while chunk.remaining() > 0 {
                        events_tmp.push(decode_event(&mut chunk)?);
                    }
                }
                CHUNK_MEMORY_META => {
                    expect_size(MEMORY_META_CHUNK_SIZE)?;
                    apply_memory_meta(self, &mut chunk)?;
                    seen.memory_meta = true;
                }
                CHUNK_EWRAM => {
                    load_region_chunk(&mut self.memory.ewram, &mut chunk)?;
                    seen.ewram = true;
                }
                CHUNK_IWRAM => {
                    load_region_chunk(&mut self.memory.iwram, &mut chunk)?;
                    seen.iwram = true;
                }
                CHUNK_VRAM => {
                    load_region_chunk(&mut self.memory.vram, &mut chunk)?;
                    seen.vram = true;
                }
                CHUNK_PALRAM => {
                    load_region_chunk(&mut self.memory.palram, &mut chunk)?;
                    seen.palram = true;
                }
                CHUNK_OAM => {
                    load_region_chunk(&mut self.memory.oam, &mut chunk)?;
                    seen.oam = true;
                }
                CHUNK_BACKUP_STORAGE => {
                    if size < BACKUP_META_SIZE as usize {
                        return Err(QuickloadError::Corrupt("backup chunk too small"));
                    }
                    let backup_size = chunk.u64()? as usize;
                    let dirty = chunk.bool()?;

                    let mut storage = self.shared.backup_storage.data.lock().unwrap();
                    storage.clear();
                    storage.resize(backup_size, 0);
                    read_region_payload(&mut chunk, &mut storage[..])?;
                    drop(storage);

                    self.shared.set_backup_dirty(dirty);
                    seen.backup = true;
                }
                _ => {
                    // Unknown chunk from a future version: skip it.
                }
            }
        }

        if !seen.all_mandatory() {
            return Err(QuickloadError::Corrupt("mandatory chunk missing"));
        }

        let (cycles, next_event, events_len) =
            sched_snapshot.expect("scheduler chunk was marked seen");
        if events_len != events_tmp.len() as u64 {
            return Err(QuickloadError::Corrupt("scheduler event count mismatch"));
        }

        // Only now that every chunk validated does the event store change
        // hands.
        self.scheduler.restore(cycles, next_event, events_tmp);
        self.rebuild_event_bookkeeping();

        if !seen.backup {
            self.shared.set_backup_dirty(false);
        }

        Ok(())
    }

    /// Flat, pre-chunk stream layout. Produced by old builds; load-only.
    fn quickload_v1(&mut self, data: &[u8]) -> Result<()> {
        self.scheduler.clear_events();

        let mut reader = Reader::new(data);

        let core = decode_core(&mut reader)?;

        let mut ewram = vec![0u8; self.memory.ewram.len()];
        let mut iwram = vec![0u8; self.memory.iwram.len()];
        let mut vram = vec![0u8; self.memory.vram.len()];
        let mut palram = vec![0u8; self.memory.palram.len()];
        let mut oam = vec![0u8; self.memory.oam.len()];
        let ewram_len = ewram.len();
        ewram.copy_from_slice(reader.take(ewram_len)?);
        let iwram_len = iwram.len();
        iwram.copy_from_slice(reader.take(iwram_len)?);
        let vram_len = vram.len();
        vram.copy_from_slice(reader.take(vram_len)?);
        let palram_len = palram.len();
        palram.copy_from_slice(reader.take(palram_len)?);
        let oam_len = oam.len();
        oam.copy_from_slice(reader.take(oam_len)?);

        // The meta fields sit behind the flat region images in v1 streams.
        let mut meta = [0u8; MEMORY_META_CHUNK_SIZE as usize];
        let meta_len = meta.len();
        meta.copy_from_slice(reader.take(meta_len)?);

        let io = decode_io(&mut reader)?;
        let ppu = decode_ppu(&mut reader)?;
        let gpio = decode_gpio(&mut reader)?;
        let apu = decode_apu(&mut reader)?;

        let cycles = reader.u64()?;
        let next_event = reader.u64()?;
        let events_len = reader.u64()? as usize;

        let mut events = Vec::with_capacity(events_len);
        for _ in 0..events_len {
            events.push(decode_event(&mut reader)?);
        }

        // Everything decoded; commit.
        self.core = core;
        self.memory.ewram.load_bytes(&ewram);
        self.memory.iwram.load_bytes(&iwram);
        self.memory.vram.load_bytes(&vram);
        self.memory.palram.load_bytes(&palram);
        self.memory.oam.load_bytes(&oam);
        apply_memory_meta(self, &mut Reader::new(&meta))?;
        self.io = io;
        self.ppu = ppu;
        self.gpio = gpio;
        self.apu = apu;
        self.scheduler.restore(cycles, next_event, events);
        self.rebuild_event_bookkeeping();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_round_trips_and_caps_runs() {
        let mut data = vec![0xAAu8; 0x1_0000];
        data.extend_from_slice(&[1, 2, 3]);

        let encoded = encode_rle(&data);
        // 0x10000 bytes of 0xAA split into 0xFFFF + 1, then three singletons.
        assert_eq!(encoded.len(), 5 * 3);

        let mut payload = Writer::default();
        write_region_payload(&mut payload, &data);
        let mut decoded = vec![0u8; data.len()];
        read_region_payload(&mut Reader::new(&payload.data), &mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn raw_is_kept_when_rle_would_not_shrink() {
        let data: Vec<u8> = (0..=255).collect();
        let mut payload = Writer::default();
        write_region_payload(&mut payload, &data);
        assert_eq!(payload.data[4], ENCODING_RAW);

        let mut decoded = vec![0u8; data.len()];
        read_region_payload(&mut Reader::new(&payload.data), &mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn overlong_rle_runs_are_rejected() {
        let mut payload = Writer::default();
        payload.u32(4);
        payload.u8(ENCODING_RLE);
        payload.bytes(&[0; 3]);
        payload.u16(5);
        payload.u8(0xFF);

        let mut out = [0u8; 4];
        let err = read_region_payload(&mut Reader::new(&payload.data), &mut out).unwrap_err();
        assert!(matches!(err, QuickloadError::Corrupt(_)));
    }

    #[test]
    fn scalar_records_match_their_declared_sizes() {
        let mut out = Writer::default();
        encode_core(&Core::new(), &mut out);
        assert_eq!(out.data.len(), CORE_CHUNK_SIZE as usize);

        let mut out = Writer::default();
        encode_io(&Io::new(), &mut out);
        assert_eq!(out.data.len(), IO_CHUNK_SIZE as usize);

        let mut out = Writer::default();
        encode_ppu(&Ppu::new(), &mut out);
        assert_eq!(out.data.len(), PPU_CHUNK_SIZE as usize);

        let mut out = Writer::default();
        encode_gpio(&Gpio::default(), &mut out);
        assert_eq!(out.data.len(), GPIO_CHUNK_SIZE as usize);

        let mut out = Writer::default();
        encode_apu(&Apu::default(), &mut out);
        assert_eq!(out.data.len(), APU_CHUNK_SIZE as usize);

        let mut out = Writer::default();
        encode_event(&Event::once(EventKind::HDraw, 1), &mut out);
        assert_eq!(out.data.len(), EVENT_RECORD_SIZE as usize);
    }
}
