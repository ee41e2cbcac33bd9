//! Cartridge backup storage: SRAM, Flash and EEPROM.
//!
//! The storage contents live in the host-visible shared data so the frontend
//! can persist them under the dirty-flag protocol; the chip protocol state
//! machines live here and are captured by the quicksave memory-meta chunk.

use crate::gba::Gba;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupType {
    #[default]
    None = 0,
    Sram = 1,
    Flash64 = 2,
    Flash128 = 3,
    Eeprom4k = 4,
    Eeprom64k = 5,
}

impl BackupType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Sram,
            2 => Self::Flash64,
            3 => Self::Flash128,
            4 => Self::Eeprom4k,
            5 => Self::Eeprom64k,
            _ => return None,
        })
    }

    /// Size of the backing storage in bytes.
    pub fn storage_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Sram => 0x8000,
            Self::Flash64 => 0x1_0000,
            Self::Flash128 => 0x2_0000,
            Self::Eeprom4k => 0x200,
            Self::Eeprom64k => 0x2000,
        }
    }

    pub fn is_eeprom(self) -> bool {
        matches!(self, Self::Eeprom4k | Self::Eeprom64k)
    }

    fn is_flash(self) -> bool {
        matches!(self, Self::Flash64 | Self::Flash128)
    }

    /// Erased-state fill byte for a fresh storage buffer.
    fn fill_byte(self) -> u8 {
        if self.is_flash() || self.is_eeprom() {
            0xFF
        } else {
            0x00
        }
    }
}

/// Flash command sequence phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashState {
    #[default]
    Ready = 0,
    Cmd1 = 1,
    Cmd2 = 2,
    Write = 3,
    Bank = 4,
}

impl FlashState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Ready,
            1 => Self::Cmd1,
            2 => Self::Cmd2,
            3 => Self::Write,
            4 => Self::Bank,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flash {
    pub state: FlashState,
    pub bank: u8,
    pub erase_mode: bool,
    pub identify: bool,
}

/// EEPROM serial protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EepromState {
    #[default]
    Idle = 0,
    Request = 1,
    Sending = 2,
    Receiving = 3,
}

impl EepromState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Idle,
            1 => Self::Request,
            2 => Self::Sending,
            3 => Self::Receiving,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eeprom {
    /// Address mask/value pair the bus uses to spot EEPROM accesses inside
    /// the cartridge window.
    pub mask: u32,
    pub range: u32,
    pub state: EepromState,
    pub address: u32,
    pub buffer: u64,
    pub bit_count: u8,
}

impl Eeprom {
    /// Address bits in a request: 6 for the 4 kbit part, 14 for 64 kbit.
    fn address_bits(kind: BackupType) -> u8 {
        if kind == BackupType::Eeprom64k {
            14
        } else {
            6
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupStorage {
    pub kind: BackupType,
    pub flash: Flash,
    pub eeprom: Eeprom,
}

impl BackupStorage {
    /// Configure for a freshly reset emulator.
    pub fn init(&mut self, kind: BackupType, rom_len: usize) {
        *self = Self {
            kind,
            ..Default::default()
        };
        if kind.is_eeprom() {
            // Small carts expose EEPROM across the whole 0x0D page; carts
            // larger than 16 MiB only in its top 256 bytes.
            if rom_len > 0x0100_0000 {
                self.eeprom.mask = 0x0FFF_FF00;
                self.eeprom.range = 0x0DFF_FF00;
            } else {
                self.eeprom.mask = 0x0F00_0000;
                self.eeprom.range = 0x0D00_0000;
            }
        }
    }
}

/// Flash chip identification codes (manufacturer, device).
fn flash_id(kind: BackupType) -> (u8, u8) {
    match kind {
        BackupType::Flash128 => (0x62, 0x13), // Sanyo
        _ => (0xBF, 0xD4),                    // SST
    }
}

impl Gba {
    /// Allocate (or drop) the shared storage buffer for the configured type.
    pub(crate) fn backup_reset_storage(&mut self) {
        let size = self.backup.kind.storage_size();
        let fill = self.backup.kind.fill_byte();
        let mut storage = self.shared.backup_storage.data.lock().unwrap();
        storage.clear();
        storage.resize(size, fill);
        drop(storage);
        self.shared.set_backup_dirty(false);
    }

    /// 8-bit read on the SRAM bus (pages 0xE/0xF).
    pub(crate) fn backup_read8(&self, addr: u32) -> u8 {
        match self.backup.kind {
            BackupType::Sram => {
                let storage = self.shared.backup_storage.data.lock().unwrap();
                storage[(addr as usize) & 0x7FFF]
            }
            BackupType::Flash64 | BackupType::Flash128 => self.flash_read8(addr),
            _ => 0xFF,
        }
    }

    /// 8-bit write on the SRAM bus (pages 0xE/0xF).
    pub(crate) fn backup_write8(&mut self, addr: u32, val: u8) {
        match self.backup.kind {
            BackupType::Sram => {
                {
                    let mut storage = self.shared.backup_storage.data.lock().unwrap();
                    let len = storage.len();
                    if len > 0 {
                        storage[(addr as usize) & 0x7FFF & (len - 1)] = val;
                    }
                }
                self.shared.set_backup_dirty(true);
            }
            BackupType::Flash64 | BackupType::Flash128 => self.flash_write8(addr, val),
            _ => {}
        }
    }

    fn flash_read8(&self, addr: u32) -> u8 {
        let offset = (addr & 0xFFFF) as usize;
        if self.backup.flash.identify && offset < 2 {
            let (manufacturer, device) = flash_id(self.backup.kind);
            return if offset == 0 { manufacturer } else { device };
        }

        let base = self.backup.flash.bank as usize * 0x1_0000;
        let storage = self.shared.backup_storage.data.lock().unwrap();
        storage.get(base + offset).copied().unwrap_or(0xFF)
    }

    fn flash_write8(&mut self, addr: u32, val: u8) {
        let offset = addr & 0xFFFF;
        let flash = &mut self.backup.flash;

        match flash.state {
            FlashState::Ready => {
                if offset == 0x5555 && val == 0xAA {
                    flash.state = FlashState::Cmd1;
                }
            }
            FlashState::Cmd1 => {
                flash.state = if offset == 0x2AAA && val == 0x55 {
                    FlashState::Cmd2
                } else {
                    FlashState::Ready
                };
            }
            FlashState::Cmd2 => {
                flash.state = FlashState::Ready;
                if val == 0x30 && flash.erase_mode {
                    // Sector erase: the command byte goes to the sector base.
                    flash.erase_mode = false;
                    let base =
                        flash.bank as usize * 0x1_0000 + (offset as usize & 0xF000);
                    {
                        let mut storage = self.shared.backup_storage.data.lock().unwrap();
                        let end = (base + 0x1000).min(storage.len());
                        storage[base.min(end)..end].fill(0xFF);
                    }
                    self.shared.set_backup_dirty(true);
                    return;
                }
                if offset != 0x5555 {
                    return;
                }
                match val {
                    0x90 => flash.identify = true,
                    0xF0 => flash.identify = false,
                    0x80 => flash.erase_mode = true,
                    0x10 => {
                        if flash.erase_mode {
                            flash.erase_mode = false;
                            self.shared.backup_storage.data.lock().unwrap().fill(0xFF);
                            self.shared.set_backup_dirty(true);
                        }
                    }
                    0xA0 => flash.state = FlashState::Write,
                    0xB0 => {
                        if self.backup.kind == BackupType::Flash128 {
                            flash.state = FlashState::Bank;
                        }
                    }
                    _ => {}
                }
            }
            FlashState::Write => {
                flash.state = FlashState::Ready;
                let base = flash.bank as usize * 0x1_0000;
                {
                    let mut storage = self.shared.backup_storage.data.lock().unwrap();
                    if let Some(byte) = storage.get_mut(base + offset as usize) {
                        // Programming can only clear bits.
                        *byte &= val;
                    }
                }
                self.shared.set_backup_dirty(true);
            }
            FlashState::Bank => {
                flash.state = FlashState::Ready;
                if offset == 0 {
                    flash.bank = val & 1;
                }
            }
        }
    }

    /// Serial-bus read on the EEPROM window.
    pub(crate) fn eeprom_read8(&mut self) -> u8 {
        let eeprom = &mut self.backup.eeprom;
        match eeprom.state {
            EepromState::Sending => {
                // 4 dummy bits, then 64 data bits MSB first.
                let bit = if eeprom.bit_count < 4 {
                    0
                } else {
                    ((eeprom.buffer >> (67 - eeprom.bit_count)) & 1) as u8
                };
                eeprom.bit_count += 1;
                if eeprom.bit_count == 68 {
                    eeprom.state = EepromState::Idle;
                }
                bit
            }
            _ => 1, // ready
        }
    }

    /// Serial-bus write on the EEPROM window; only bit 0 matters.
    pub(crate) fn eeprom_write8(&mut self, val: u8) {
        let kind = self.backup.kind;
        let addr_bits = Eeprom::address_bits(kind);
        let bit = (val & 1) as u64;

        let eeprom = &mut self.backup.eeprom;
        match eeprom.state {
            EepromState::Idle | EepromState::Sending => {
                // First request bit must be 1.
                if bit == 1 {
                    eeprom.state = EepromState::Request;
                    eeprom.buffer = 1;
                    eeprom.bit_count = 1;
                }
            }
            EepromState::Request => {
                eeprom.buffer = (eeprom.buffer << 1) | bit;
                eeprom.bit_count += 1;
                if eeprom.bit_count == 2 + addr_bits {
                    // Request prefix: "11" reads, "10" writes.
                    let is_read = eeprom.buffer & (1 << addr_bits) != 0;
                    eeprom.address = (eeprom.buffer & ((1 << addr_bits) - 1)) as u32;
                    eeprom.bit_count = 0;
                    eeprom.buffer = 0;
                    if is_read {
                        // Request ends with one terminator bit, then the data
                        // can be clocked out.
                        eeprom.state = EepromState::Sending;
                        self.eeprom_load_read_buffer();
                    } else {
                        eeprom.state = EepromState::Receiving;
                    }
                }
            }
            EepromState::Receiving => {
                eeprom.buffer = (eeprom.buffer << 1) | bit;
                eeprom.bit_count += 1;
                if eeprom.bit_count == 65 {
                    // 64 data bits plus the stop bit; commit the block.
                    let address = eeprom.address as usize * 8;
                    let data = (eeprom.buffer >> 1).to_be_bytes();
                    eeprom.state = EepromState::Idle;
                    eeprom.bit_count = 0;
                    eeprom.buffer = 0;
                    {
                        let mut storage = self.shared.backup_storage.data.lock().unwrap();
                        let end = (address + 8).min(storage.len());
                        if address < end {
                            storage[address..end].copy_from_slice(&data[..end - address]);
                        }
                    }
                    self.shared.set_backup_dirty(true);
                }
            }
        }
    }

    fn eeprom_load_read_buffer(&mut self) {
        let address = self.backup.eeprom.address as usize * 8;
        let storage = self.shared.backup_storage.data.lock().unwrap();
        let mut block = [0xFFu8; 8];
        if address < storage.len() {
            let end = (address + 8).min(storage.len());
            block[..end - address].copy_from_slice(&storage[address..end]);
        }
        drop(storage);
        let eeprom = &mut self.backup.eeprom;
        eeprom.buffer = u64::from_be_bytes(block);
        eeprom.bit_count = 0;
    }
}
