//! Scripted JN516x bootloader used to exercise the programmer and session.

use std::collections::{HashMap, VecDeque};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::frame;
use crate::protocol::*;
use crate::SerialPort;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Clone, PartialEq, Debug)]
pub struct DeviceError;

/// A request as received by the device
#[derive(Clone, PartialEq, Debug)]
pub struct Received {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Received {
    /// Address field shared by the read and write requests
    pub fn address(&self) -> u32 {
        u32::from_le_bytes([self.payload[0], self.payload[1], self.payload[2], self.payload[3]])
    }

    /// Length field of a read request
    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.payload[4], self.payload[5]])
    }
}

pub struct Device {
    pub chip_id: u32,
    pub flash_id: (u8, u8),
    pub flash: Vec<u8>,
    pub ram: HashMap<u32, Vec<u8>>,

    rx: Vec<u8>,
    tx: VecDeque<u8>,
    requests: Vec<Received>,
    bauds: Vec<u32>,
    failures: Vec<(Command, usize, u8)>,
    raw: HashMap<u8, Vec<u8>>,
    silent: Vec<u8>,
}

impl Device {
    pub fn new() -> Self {
        let mut ram = HashMap::new();
        ram.insert(MAC_ADDRESS_CUSTOMER, vec![0x00, 0x15, 0x8d, 0x00, 0x01, 0x02, 0x03, 0x04]);

        Self {
            chip_id: ZIGATE_CHIP_ID,
            flash_id: ZIGATE_FLASH_ID,
            flash: vec![0xff; FLASH_END as usize],
            ram,
            rx: vec![],
            tx: VecDeque::new(),
            requests: vec![],
            bauds: vec![],
            failures: vec![],
            raw: HashMap::new(),
            silent: vec![],
        }
    }

    /// Store an image length in the first flash sector
    pub fn with_image_length(mut self, length: u32) -> Self {
        for (i, b) in self.flash.iter_mut().enumerate() {
            *b = i as u8;
        }
        self.flash[IMAGE_LENGTH_OFFSET..IMAGE_LENGTH_OFFSET + 4].copy_from_slice(&length.to_be_bytes());
        self
    }

    /// Answer the `nth` (zero based) request for `command` with `status`
    pub fn fail(&mut self, command: Command, nth: usize, status: u8) {
        self.failures.push((command, nth, status));
    }

    /// Answer every request for `command` with the given bytes
    pub fn reply_raw(&mut self, command: Command, bytes: Vec<u8>) {
        self.raw.insert(command as u8, bytes);
    }

    /// Never answer requests for `command`
    pub fn silence(&mut self, command: Command) {
        self.silent.push(command as u8);
    }

    pub fn requests(&self) -> &[Received] {
        &self.requests
    }

    pub fn requests_for(&self, command: Command) -> Vec<&Received> {
        self.requests.iter().filter(|r| r.kind == command as u8).collect()
    }

    /// Local baud rate changes
    pub fn bauds(&self) -> &[u32] {
        &self.bauds
    }

    fn status_for(&self, command: Command) -> u8 {
        let seen = self.requests_for(command).len() - 1;
        self.failures
            .iter()
            .find(|(c, nth, _)| *c == command && *nth == seen)
            .map(|(_, _, status)| *status)
            .unwrap_or(0)
    }

    fn handle(&mut self, kind: u8, payload: Vec<u8>) {
        let req = Received { kind, payload };
        self.requests.push(req.clone());

        if self.silent.contains(&kind) {
            return;
        }
        if let Some(bytes) = self.raw.get(&kind) {
            self.tx.extend(bytes.iter());
            return;
        }

        let command = match kind {
            0x07 => Command::FlashErase,
            0x09 => Command::FlashWrite,
            0x0b => Command::FlashRead,
            0x1f => Command::RamRead,
            0x25 => Command::FlashId,
            0x27 => Command::ChangeBaudRate,
            0x2c => Command::SelectFlashType,
            0x32 => Command::ChipId,
            _ => panic!("unknown command 0x{:02x}", kind),
        };

        let status = self.status_for(command);
        let mut resp = vec![status];

        if status == 0 {
            match command {
                Command::ChipId => resp.extend_from_slice(&self.chip_id.to_be_bytes()),
                Command::FlashId => resp.extend_from_slice(&[self.flash_id.0, self.flash_id.1]),
                Command::FlashRead => {
                    let start = req.address() as usize;
                    let end = start + req.length() as usize;
                    resp.extend_from_slice(&self.flash[start..end]);
                }
                Command::RamRead => {
                    let data = self.ram.get(&req.address()).cloned().unwrap_or_else(|| vec![0xff; req.length() as usize]);
                    resp.extend_from_slice(&data);
                }
                Command::FlashErase => self.flash.iter_mut().for_each(|b| *b = 0xff),
                Command::FlashWrite => {
                    let start = req.address() as usize;
                    let data = &req.payload[4..];
                    self.flash[start..start + data.len()].copy_from_slice(data);
                }
                Command::ChangeBaudRate | Command::SelectFlashType => (),
            }
        }

        let f = frame::encode(command.response_kind(), &resp).unwrap();
        self.tx.extend(f.iter());
    }
}

impl Write<u8> for Device {
    type Error = DeviceError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.rx.push(word);

        let length = self.rx[0] as usize;
        if self.rx.len() == length + 1 {
            let kind = self.rx[1];
            let payload = self.rx[2..length].to_vec();
            let checksum = self.rx[length];
            assert_eq!(checksum, frame::checksum(kind as u16, length as u16, &payload), "bad request checksum");

            self.rx.clear();
            self.handle(kind, payload);
        }

        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for Device {
    type Error = DeviceError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<DeviceError> for Device {
    fn set_baud(&mut self, baud: u32) -> Result<(), DeviceError> {
        self.bauds.push(baud);
        Ok(())
    }
}
