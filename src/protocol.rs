//! JN516x bootloader commands and the request builders that encode them.

use core::cmp::Ordering;

use crate::frame::{self, FrameError};

/// Chip ID reported by the JN5168 found on ZiGate devices
pub const ZIGATE_CHIP_ID: u32 = 0x1040_8686;

/// Flash (manufacturer, device) ID of the internal flash
pub const ZIGATE_FLASH_ID: (u8, u8) = (0xCC, 0xEE);

/// Flash type to select for the internal flash
pub const ZIGATE_FLASH_TYPE: u8 = 8;

/// Marker at the start of every dumped or flashed image
pub const ZIGATE_BINARY_VERSION: [u8; 4] = [0x07, 0x03, 0x00, 0x08];

/// Baud rate the bootloader starts at
pub const DEFAULT_BAUD: u32 = 38_400;

/// Baud rate used for flashing
pub const WORKING_BAUD: u32 = 115_200;

/// Bootloader clock used to derive the baud rate divisor
pub const BAUD_CLOCK: u32 = 1_000_000;

pub const FLASH_START: u32 = 0x0000_0000;
pub const FLASH_END: u32 = 0x0004_0000;

/// Maximum bytes per flash read or write request
pub const MAX_CHUNK: usize = 128;

/// Offset of the big-endian image length within the first flash sector
pub const IMAGE_LENGTH_OFFSET: usize = 0x20;

/// RAM locations holding the MAC address, customer then factory
pub const MAC_ADDRESS_CUSTOMER: u32 = 0x0100_1570;
pub const MAC_ADDRESS_FACTORY: u32 = 0x0100_1580;
pub const MAC_ADDRESS_LEN: u16 = 8;

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Erases the whole flash
    FlashErase = 0x07,

    /// Writes a block of data to flash at the given address
    FlashWrite = 0x09,

    /// Reads up to 128 bytes of flash from the given address
    FlashRead = 0x0b,

    /// Reads a block of RAM from the given address
    RamRead = 0x1f,

    /// Reads the manufacturer and device ID of the attached flash
    FlashId = 0x25,

    /// Changes the bootloader baud rate
    ChangeBaudRate = 0x27,

    /// Selects the flash type (and optional custom jump address)
    SelectFlashType = 0x2c,

    /// Reads the chip ID
    ChipId = 0x32,
}

impl Command {
    /// Type byte of the response the bootloader answers this command with
    pub fn response_kind(self) -> u8 {
        self as u8 + 1
    }
}

/// Divisor for the change baud rate command, `None` if the rate cannot be
/// expressed in a single byte
///
/// Exact halves round to even, so 400000 baud gives 2 and 80000 gives 12.
pub fn baud_divisor(baud: u32) -> Option<u8> {
    if baud == 0 {
        return None;
    }

    let (q, r) = (BAUD_CLOCK / baud, BAUD_CLOCK % baud);
    let divisor = match (2 * r as u64).cmp(&(baud as u64)) {
        Ordering::Greater => q + 1,
        Ordering::Equal if q % 2 == 1 => q + 1,
        _ => q,
    };
    match divisor {
        1..=0xff => Some(divisor as u8),
        _ => None,
    }
}

/// A bootloader request, one variant per supported command
#[derive(Debug, PartialEq, Clone)]
pub enum Request<'a> {
    FlashErase,
    FlashWrite { address: u32, data: &'a [u8] },
    FlashRead { address: u32, length: u16 },
    RamRead { address: u32, length: u16 },
    FlashId,
    ChangeBaudRate { divisor: u8 },
    SelectFlashType { flash_type: u8, custom_jump: u32 },
    ChipId,
}

impl<'a> Request<'a> {
    /// Select a flash type with the default (zero) custom jump address
    pub fn select_flash_type(flash_type: u8) -> Self {
        Request::SelectFlashType { flash_type, custom_jump: 0 }
    }

    pub fn command(&self) -> Command {
        match self {
            Request::FlashErase => Command::FlashErase,
            Request::FlashWrite { .. } => Command::FlashWrite,
            Request::FlashRead { .. } => Command::FlashRead,
            Request::RamRead { .. } => Command::RamRead,
            Request::FlashId => Command::FlashId,
            Request::ChangeBaudRate { .. } => Command::ChangeBaudRate,
            Request::SelectFlashType { .. } => Command::SelectFlashType,
            Request::ChipId => Command::ChipId,
        }
    }

    /// Payload bytes, endianness is fixed per command
    pub fn payload(&self) -> Vec<u8> {
        let mut buff = Vec::new();

        match self {
            Request::FlashErase | Request::FlashId | Request::ChipId => (),
            Request::FlashWrite { address, data } => {
                buff.extend_from_slice(&address.to_le_bytes());
                buff.extend_from_slice(data);
            }
            Request::FlashRead { address, length } | Request::RamRead { address, length } => {
                buff.extend_from_slice(&address.to_le_bytes());
                buff.extend_from_slice(&length.to_le_bytes());
            }
            Request::ChangeBaudRate { divisor } => buff.push(*divisor),
            Request::SelectFlashType { flash_type, custom_jump } => {
                buff.push(*flash_type);
                buff.extend_from_slice(&custom_jump.to_le_bytes());
            }
        }

        buff
    }

    /// Encode into a complete wire frame
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        frame::encode(self.command() as u8, &self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_divisors() {
        assert_eq!(baud_divisor(115_200), Some(9));
        assert_eq!(baud_divisor(38_400), Some(26));
        assert_eq!(baud_divisor(1_000_000), Some(1));
        assert_eq!(baud_divisor(0), None);
        assert_eq!(baud_divisor(1_200), None);
    }

    #[test]
    fn baud_divisor_halves_round_to_even() {
        // 2.5, 12.5 and 62.5
        assert_eq!(baud_divisor(400_000), Some(2));
        assert_eq!(baud_divisor(80_000), Some(12));
        assert_eq!(baud_divisor(16_000), Some(62));
        // 3.50001 is not a tie
        assert_eq!(baud_divisor(285_714), Some(4));
    }

    #[test]
    fn response_kinds() {
        assert_eq!(Command::FlashId.response_kind(), 0x26);
        assert_eq!(Command::ChangeBaudRate.response_kind(), 0x28);
        assert_eq!(Command::ChipId.response_kind(), 0x33);
    }

    #[test]
    fn empty_commands() {
        assert_eq!(Request::FlashErase.encode().unwrap(), vec![0x02, 0x07, 0x05]);
        assert_eq!(Request::FlashId.encode().unwrap(), vec![0x02, 0x25, 0x27]);
        assert_eq!(Request::ChipId.encode().unwrap(), vec![0x02, 0x32, 0x30]);
    }

    #[test]
    fn flash_read_is_little_endian() {
        let r = Request::FlashRead { address: 0x0001_0280, length: 128 };
        assert_eq!(r.payload(), vec![0x80, 0x02, 0x01, 0x00, 0x80, 0x00]);

        let f = r.encode().unwrap();
        assert_eq!(&f[..2], &[0x08, 0x0b]);
        assert_eq!(f.len(), 9);
    }

    #[test]
    fn ram_read_matches_flash_read_layout() {
        let ram = Request::RamRead { address: MAC_ADDRESS_CUSTOMER, length: MAC_ADDRESS_LEN };
        let flash = Request::FlashRead { address: MAC_ADDRESS_CUSTOMER, length: MAC_ADDRESS_LEN };
        assert_eq!(ram.payload(), flash.payload());
        assert_eq!(ram.payload(), vec![0x70, 0x15, 0x00, 0x01, 0x08, 0x00]);
    }

    #[test]
    fn flash_write_prefixes_address() {
        let data = [0xaa, 0xbb, 0xcc];
        let r = Request::FlashWrite { address: 0x100, data: &data };
        assert_eq!(r.payload(), vec![0x00, 0x01, 0x00, 0x00, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn change_baud_rate_frame() {
        let r = Request::ChangeBaudRate { divisor: baud_divisor(115_200).unwrap() };
        // 0x00 ^ 0x27 ^ 0x00 ^ 0x03 ^ 0x09
        assert_eq!(r.encode().unwrap(), vec![0x03, 0x27, 0x09, 0x2d]);
    }

    #[test]
    fn select_flash_type_payload() {
        assert_eq!(Request::select_flash_type(8).payload(), vec![0x08, 0, 0, 0, 0]);

        let r = Request::SelectFlashType { flash_type: 8, custom_jump: 0x1234_5678 };
        assert_eq!(r.payload(), vec![0x08, 0x78, 0x56, 0x34, 0x12]);
    }
}
