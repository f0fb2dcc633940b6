//! Bootloader responses and the registry mapping response types to decoders.

use core::fmt;

use crate::frame::{self, FrameError, FRAME_OVERHEAD};

pub const FLASH_ID_RESPONSE: u8 = 0x26;
pub const BAUD_RATE_RESPONSE: u8 = 0x28;
pub const CHIP_ID_RESPONSE: u8 = 0x33;

/// Type specific fields parsed from a response
#[derive(Clone, PartialEq, Debug)]
pub enum ResponseBody {
    /// Status only, used for any response without a registered decoder
    Status,
    FlashId { manufacturer_id: u8, device_id: u8 },
    BaudRate,
    ChipId(u32),
}

/// Decodes the data following the status byte of a response
pub type DecodeFn = fn(kind: u8, data: &[u8]) -> Result<ResponseBody, FrameError>;

/// A decoded bootloader response
#[derive(Clone, PartialEq, Debug)]
pub struct Response {
    pub kind: u8,
    pub status: u8,
    /// Payload following the status byte
    pub data: Vec<u8>,
    /// Checksum as received, not verified on decode
    pub checksum: u8,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    pub fn chip_id(&self) -> Option<u32> {
        match self.body {
            ResponseBody::ChipId(id) => Some(id),
            _ => None,
        }
    }

    /// Flash (manufacturer, device) ID
    pub fn flash_id(&self) -> Option<(u8, u8)> {
        match self.body {
            ResponseBody::FlashId { manufacturer_id, device_id } => Some((manufacturer_id, device_id)),
            _ => None,
        }
    }

    /// Recompute the checksum and compare it with the received one
    pub fn checksum_matches(&self) -> bool {
        let mut payload = Vec::with_capacity(self.data.len() + 1);
        payload.push(self.status);
        payload.extend_from_slice(&self.data);

        let length = payload.len() + FRAME_OVERHEAD;
        frame::checksum(self.kind as u16, length as u16, &payload) == self.checksum
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.body {
            ResponseBody::Status => write!(
                f,
                "Response(type=0x{:02x}, status={}, data=0x{}, checksum=0x{:02x})",
                self.kind,
                self.status,
                hex::encode(&self.data),
                self.checksum
            ),
            ResponseBody::FlashId { manufacturer_id, device_id } => write!(
                f,
                "ReadFlashIdResponse {} (ok={}, manufacturer_id=0x{:02x}, device_id=0x{:02x})",
                self.status,
                self.ok(),
                manufacturer_id,
                device_id
            ),
            ResponseBody::BaudRate => write!(f, "ChangeBaudRateResponse {} (ok={})", self.status, self.ok()),
            ResponseBody::ChipId(id) => write!(f, "GetChipIdResponse (ok={}, chip_id=0x{:08x})", self.ok(), id),
        }
    }
}

fn decode_flash_id(kind: u8, data: &[u8]) -> Result<ResponseBody, FrameError> {
    match data {
        [manufacturer_id, device_id] => Ok(ResponseBody::FlashId {
            manufacturer_id: *manufacturer_id,
            device_id: *device_id,
        }),
        _ => Err(FrameError::InvalidPayload { kind, len: data.len() }),
    }
}

fn decode_baud_rate(_kind: u8, _data: &[u8]) -> Result<ResponseBody, FrameError> {
    Ok(ResponseBody::BaudRate)
}

fn decode_chip_id(kind: u8, data: &[u8]) -> Result<ResponseBody, FrameError> {
    match data {
        [a, b, c, d] => Ok(ResponseBody::ChipId(u32::from_be_bytes([*a, *b, *c, *d]))),
        _ => Err(FrameError::InvalidPayload { kind, len: data.len() }),
    }
}

/// Decoders for the responses carrying more than a status byte
pub const DEFAULT_DECODERS: &[(u8, DecodeFn)] = &[
    (FLASH_ID_RESPONSE, decode_flash_id),
    (BAUD_RATE_RESPONSE, decode_baud_rate),
    (CHIP_ID_RESPONSE, decode_chip_id),
];

/// Find the first response type claimed by more than one decoder
const fn find_duplicate(table: &[(u8, DecodeFn)]) -> Option<u8> {
    let mut i = 0;
    while i < table.len() {
        let mut j = i + 1;
        while j < table.len() {
            if table[i].0 == table[j].0 {
                return Some(table[i].0);
            }
            j += 1;
        }
        i += 1;
    }
    None
}

const _: () = assert!(find_duplicate(DEFAULT_DECODERS).is_none(), "duplicate response decoder");

/// Maps response types to their decoders
#[derive(Clone)]
pub struct ResponseRegistry {
    decoders: Vec<(u8, DecodeFn)>,
}

impl ResponseRegistry {
    /// Build a registry, failing if two decoders claim the same response type
    pub fn new(table: &[(u8, DecodeFn)]) -> Result<Self, FrameError> {
        if let Some(kind) = find_duplicate(table) {
            return Err(FrameError::DuplicateRegistration(kind));
        }

        Ok(Self { decoders: table.to_vec() })
    }

    fn decoder(&self, kind: u8) -> Option<DecodeFn> {
        self.decoders.iter().find(|(k, _)| *k == kind).map(|(_, d)| *d)
    }

    /// Decode a response payload (status byte first) of the given type
    pub fn decode(&self, kind: u8, payload: &[u8], checksum: u8) -> Result<Response, FrameError> {
        let (status, data) = match payload.split_first() {
            Some((status, data)) => (*status, data),
            None => return Err(FrameError::MissingStatus(kind)),
        };

        // Failed requests carry no type specific fields
        let body = match self.decoder(kind) {
            Some(decode) if status == 0 => decode(kind, data)?,
            _ => ResponseBody::Status,
        };

        Ok(Response { kind, status, data: data.to_vec(), checksum, body })
    }
}

impl fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<u8> = self.decoders.iter().map(|(k, _)| *k).collect();
        f.debug_struct("ResponseRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self { decoders: DEFAULT_DECODERS.to_vec() }
    }
}
