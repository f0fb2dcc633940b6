//! Flash session, drives the bootloader through identification, dump, erase
//! and write.
//!
//! Every step needs an ok response from the bootloader before the next one
//! runs, the first failure ends the session. Nothing is retried. Once the
//! working baud rate has been negotiated the bootloader is asked to return to
//! its initial baud rate when the session ends, on every exit path.

use core::fmt;
use std::io::{self, Read, Write};

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::*;
use crate::{Error, Programmer, SerialPort, Step};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    BaudNegotiate,
    IdentifyChip,
    IdentifyFlash,
    DiscoverMac,
    SelectFlashType,
    DumpExisting,
    EraseFlash,
    WriteNewImage,
    Completed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Init => "init",
            State::BaudNegotiate => "baud rate negotiation",
            State::IdentifyChip => "chip identification",
            State::IdentifyFlash => "flash identification",
            State::DiscoverMac => "MAC address discovery",
            State::SelectFlashType => "flash type selection",
            State::DumpExisting => "flash dump",
            State::EraseFlash => "flash erase",
            State::WriteNewImage => "flash write",
            State::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Progress reporting for the dump and write loops
pub trait Progress {
    /// A transfer of at most `total` bytes is starting
    fn start(&mut self, _label: &str, _total: u64) {}

    /// The transfer turned out to be `total` bytes long
    fn set_length(&mut self, _total: u64) {}

    fn set_position(&mut self, _position: u64) {}

    fn finish(&mut self) {}
}

impl Progress for () {}

/// Summary of a completed session
#[derive(Clone, PartialEq, Debug)]
pub struct FlashReport {
    pub chip_id: u32,
    pub flash_id: (u8, u8),
    pub mac: Option<String>,
    /// End of the image found on the device
    pub flash_end: u32,
    /// Flash bytes saved to the dump, excluding the version marker
    pub dumped: usize,
    /// Image bytes written, excluding the version marker
    pub written: usize,
}

pub struct FlashSession<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    programmer: &'a mut Programmer<P, D, E>,
    state: State,
    flash_type: u8,
    flash_end: u32,
    cursor: u32,
    /// Baud rate to restore the bootloader to on teardown
    restore: Option<u32>,
}

impl<'a, P, D, E> FlashSession<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    pub fn new(programmer: &'a mut Programmer<P, D, E>) -> Self {
        Self {
            programmer,
            state: State::Init,
            flash_type: 0,
            flash_end: FLASH_END,
            cursor: FLASH_START,
            restore: None,
        }
    }

    /// Current state, on failure the step that failed
    pub fn state(&self) -> State {
        self.state
    }

    pub fn flash_end(&self) -> u32 {
        self.flash_end
    }

    /// Run the whole session, saving the existing flash to `dump` and then
    /// replacing it with `image`
    pub fn run<W, R, G>(&mut self, dump: &mut W, image: &mut R, progress: &mut G) -> Result<FlashReport, Error<E>>
    where
        W: Write,
        R: Read,
        G: Progress,
    {
        let res = self.execute(dump, image, progress);
        self.restore_baud();

        match &res {
            Ok(_) => self.enter(State::Completed),
            Err(e) => debug!("{} failed: {}", self.state, e),
        }

        res
    }

    fn execute<W, R, G>(&mut self, dump: &mut W, image: &mut R, progress: &mut G) -> Result<FlashReport, Error<E>>
    where
        W: Write,
        R: Read,
        G: Progress,
    {
        self.negotiate_baud()?;
        let chip_id = self.identify_chip()?;
        let flash_id = self.identify_flash()?;
        let mac = self.discover_mac();
        self.select_flash_type()?;
        let dumped = self.dump(dump, progress)?;
        let flash_end = self.flash_end;
        self.erase()?;
        let written = self.write_image(image, progress)?;

        Ok(FlashReport { chip_id, flash_id, mac, flash_end, dumped, written })
    }

    fn enter(&mut self, state: State) {
        info!("=> {}", state);
        self.state = state;
    }

    /// Switch the bootloader and the local port to the working baud rate
    pub fn negotiate_baud(&mut self) -> Result<(), Error<E>> {
        self.enter(State::BaudNegotiate);

        let (initial, baud) = (self.programmer.options().initial_baud, self.programmer.options().baud);
        debug!("Changing baud rate from {} to {}", initial, baud);

        let resp = self.programmer.change_baud_rate(baud)?;
        if !resp.ok() {
            return Err(Error::BaudNegotiationFailed);
        }

        self.programmer.set_baud(baud)?;
        self.restore = Some(initial);

        Ok(())
    }

    pub fn identify_chip(&mut self) -> Result<u32, Error<E>> {
        self.enter(State::IdentifyChip);

        let resp = self.programmer.chip_id()?;
        let chip_id = match resp.chip_id() {
            Some(id) if resp.ok() => id,
            _ => return Err(Error::Status{ step: Step::ChipId, status: resp.status }),
        };

        info!("Chip ID: 0x{:08x}", chip_id);
        if chip_id != ZIGATE_CHIP_ID {
            return Err(Error::UnsupportedChip(chip_id));
        }

        Ok(chip_id)
    }

    pub fn identify_flash(&mut self) -> Result<(u8, u8), Error<E>> {
        self.enter(State::IdentifyFlash);

        let resp = self.programmer.flash_id()?;
        let (manufacturer_id, device_id) = match resp.flash_id() {
            Some(id) if resp.ok() => id,
            _ => return Err(Error::Status{ step: Step::FlashId, status: resp.status }),
        };

        info!("Flash ID: manufacturer 0x{:02x}, device 0x{:02x}", manufacturer_id, device_id);
        if (manufacturer_id, device_id) != ZIGATE_FLASH_ID {
            return Err(Error::UnsupportedFlash{ manufacturer_id, device_id });
        }

        self.flash_type = ZIGATE_FLASH_TYPE;

        Ok((manufacturer_id, device_id))
    }

    /// Look up the MAC address, failures here are reported but not fatal
    pub fn discover_mac(&mut self) -> Option<String> {
        self.enter(State::DiscoverMac);

        let mut mac = self.read_mac(MAC_ADDRESS_CUSTOMER)?;
        if mac.iter().all(|b| *b == 0xff) {
            debug!("Customer MAC address unset, using factory MAC address");
            mac = self.read_mac(MAC_ADDRESS_FACTORY)?;
        }

        let mac = format_mac(&mac);
        info!("Found MAC-address: {}", mac);

        Some(mac)
    }

    fn read_mac(&mut self, address: u32) -> Option<Vec<u8>> {
        match self.programmer.ram_read(address, MAC_ADDRESS_LEN) {
            Ok(resp) if resp.ok() => Some(resp.data),
            Ok(resp) => {
                warn!("Reading MAC address at 0x{:08x} failed, status: 0x{:x}", address, resp.status);
                None
            }
            Err(e) => {
                warn!("Reading MAC address at 0x{:08x} failed: {}", address, e);
                None
            }
        }
    }

    pub fn select_flash_type(&mut self) -> Result<(), Error<E>> {
        self.enter(State::SelectFlashType);

        let resp = self.programmer.select_flash_type(self.flash_type)?;
        if !resp.ok() {
            return Err(Error::FlashTypeSelectFailed(resp.status));
        }

        Ok(())
    }

    /// Save the current flash contents, preceded by the version marker
    ///
    /// The first chunk holds the length of the installed image, which
    /// replaces the default flash end for the rest of the dump.
    pub fn dump<W: Write, G: Progress>(&mut self, out: &mut W, progress: &mut G) -> Result<usize, Error<E>> {
        self.enter(State::DumpExisting);

        out.write_all(&ZIGATE_BINARY_VERSION).map_err(io_error)?;

        self.cursor = FLASH_START;
        self.flash_end = FLASH_END;
        let mut dumped = 0;

        progress.start("Reading", (self.flash_end - FLASH_START) as u64);

        while self.cursor < self.flash_end {
            let length = (self.flash_end - self.cursor).min(MAX_CHUNK as u32);

            let resp = self.programmer.flash_read(self.cursor, length as u16)?;
            if !resp.ok() {
                return Err(Error::ReadFailed{ address: self.cursor, status: resp.status });
            }

            if self.cursor == FLASH_START {
                self.update_flash_end(&resp.data);
                progress.set_length((self.flash_end - FLASH_START) as u64);
            }

            out.write_all(&resp.data).map_err(io_error)?;
            dumped += resp.data.len();

            self.cursor += length;
            progress.set_position((self.cursor - FLASH_START) as u64);
        }

        progress.finish();
        out.flush().map_err(io_error)?;

        info!("Read {} bytes of flash", dumped);

        Ok(dumped)
    }

    fn update_flash_end(&mut self, first: &[u8]) {
        let reported = match first.get(IMAGE_LENGTH_OFFSET..IMAGE_LENGTH_OFFSET + 4) {
            Some(&[a, b, c, d]) => u32::from_be_bytes([a, b, c, d]),
            _ => {
                warn!("First flash chunk is too short to hold the image length");
                return;
            }
        };

        if reported > FLASH_END {
            warn!("Image length 0x{:08x} exceeds flash, reading 0x{:08x}", reported, FLASH_END);
        }

        self.flash_end = reported.min(FLASH_END);
        debug!("Flash end: 0x{:08x}", self.flash_end);
    }

    pub fn erase(&mut self) -> Result<(), Error<E>> {
        self.enter(State::EraseFlash);

        let resp = self.programmer.flash_erase()?;
        if !resp.ok() {
            return Err(Error::EraseFailed(resp.status));
        }

        Ok(())
    }

    /// Write a new image, which must start with the version marker
    pub fn write_image<R: Read, G: Progress>(&mut self, image: &mut R, progress: &mut G) -> Result<usize, Error<E>> {
        self.enter(State::WriteNewImage);

        let mut version = [0u8; 4];
        let n = read_chunk(image, &mut version).map_err(io_error)?;
        if version[..n] != ZIGATE_BINARY_VERSION {
            return Err(Error::InvalidImage(version[..n].to_vec()));
        }

        // The image may be larger than the one it replaces
        self.cursor = FLASH_START;
        self.flash_end = FLASH_END;

        let mut chunk = [0u8; MAX_CHUNK];
        let mut written = 0;

        progress.start("Writing", (self.flash_end - FLASH_START) as u64);

        while self.cursor < self.flash_end {
            let n = read_chunk(image, &mut chunk).map_err(io_error)?;
            if n == 0 {
                break;
            }
            let data = &chunk[..n];

            let resp = self.programmer.flash_write(self.cursor, data)?;
            if !resp.ok() {
                return Err(Error::WriteFailed{ address: self.cursor, status: resp.status, chunk: data.to_vec() });
            }

            written += n;
            self.cursor += MAX_CHUNK as u32;
            progress.set_position(written as u64);
        }

        progress.finish();

        info!("Wrote {} bytes of flash", written);

        Ok(written)
    }

    /// Return the bootloader to its initial baud rate, at most once
    fn restore_baud(&mut self) {
        let baud = match self.restore.take() {
            Some(b) => b,
            None => return,
        };

        debug!("Restoring bootloader baud rate to {}", baud);

        let divisor = match baud_divisor(baud) {
            Some(d) => d,
            None => {
                warn!("Cannot restore baud rate {}", baud);
                return;
            }
        };

        if let Err(e) = self.programmer.send(&Request::ChangeBaudRate{ divisor }) {
            warn!("Restoring baud rate failed: {}", e);
        }
    }
}

impl<'a, P, D, E> Drop for FlashSession<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    fn drop(&mut self) {
        self.restore_baud();
    }
}

fn io_error<E>(e: io::Error) -> Error<E> {
    Error::Io(e.kind())
}

/// Fill `buff` from `r`, short only at the end of the input
fn read_chunk<R: Read>(r: &mut R, buff: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;

    while n < buff.len() {
        match r.read(&mut buff[n..]) {
            Ok(0) => break,
            Ok(c) => n += c,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}

/// Format MAC bytes as colon separated hex
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}
