//! ZiGate (JN516x) Serial Bootloader.
//!
//! Talks to the JN516x ROM bootloader over a UART to dump, erase and
//! reflash the internal flash of ZiGate devices.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod dump;
pub mod frame;
pub mod protocol;
pub mod response;
pub mod session;

#[cfg(test)]
mod mock;

pub use dump::LazyFile;
pub use frame::FrameError;
pub use protocol::{Command, Request};
pub use response::{Response, ResponseBody, ResponseRegistry};
pub use session::{FlashReport, FlashSession, Progress, State};

use protocol::*;

pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    /// Switch the local port to a new baud rate
    fn set_baud(&mut self, baud: u32) -> Result<(), E>;
}

/// Session step a bootloader status error was reported at
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    ChipId,
    FlashId,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout awaiting bootloader response")]
    ResponseTimeout,

    #[error("invalid frame: {0}")]
    Frame(#[source] FrameError),

    #[error("unexpected response type 0x{actual:02x} (expected 0x{expected:02x})")]
    UnexpectedResponse { expected: u8, actual: u8 },

    #[error("baud rate {0} is not supported by the bootloader")]
    UnsupportedBaud(u32),

    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("change baudrate failed")]
    BaudNegotiationFailed,

    #[error("getting {step:?} failed, status: 0x{status:x}")]
    Status { step: Step, status: u8 },

    #[error("unsupported chip 0x{0:08x}, patches welcome")]
    UnsupportedChip(u32),

    #[error("unsupported flash ID 0x{manufacturer_id:02x}:0x{device_id:02x}, patches welcome")]
    UnsupportedFlash { manufacturer_id: u8, device_id: u8 },

    #[error("selecting flash type failed, status: 0x{0:x}")]
    FlashTypeSelectFailed(u8),

    #[error("reading flash failed at 0x{address:08x}, status: 0x{status:x}")]
    ReadFailed { address: u32, status: u8 },

    #[error("erasing flash failed, status: 0x{0:x}")]
    EraseFailed(u8),

    #[error("not a valid image for ZiGate (version {})", hex::encode(.0))]
    InvalidImage(Vec<u8>),

    #[error("writing failed at 0x{address:08x}, status: 0x{status:x}, data: {}", hex::encode(.chunk))]
    WriteFailed { address: u32, status: u8, chunk: Vec<u8> },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Baud rate the bootloader starts at and is restored to on exit
    #[cfg_attr(feature = "structopt", structopt(long, default_value="38400"))]
    pub initial_baud: u32,

    /// Baud rate to switch to for flashing
    #[cfg_attr(feature = "structopt", structopt(long, default_value="115200"))]
    pub baud: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            poll_delay_ms: 1,
            initial_baud: DEFAULT_BAUD,
            baud: WORKING_BAUD,
        }
    }
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    registry: ResponseRegistry,
    baud: u32,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance, `port` must already run at the
    /// initial baud rate
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self::with_registry(port, delay, options, ResponseRegistry::default())
    }

    /// Create a new programmer instance with a custom response registry
    pub fn with_registry(port: P, delay: D, options: Options, registry: ResponseRegistry) -> Self {
        let baud = options.initial_baud;
        Self{options, port, delay, registry, baud, _err: PhantomData}
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Fetch the current local baud rate
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Consume the programmer, returning the underlying port
    pub fn release(self) -> P {
        self.port
    }

    /// Switch the local port baud rate
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error<E>> {
        debug!("Switching local baud rate to {}", baud);
        self.port.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    /// Encode and send a request frame
    pub fn send(&mut self, request: &Request) -> Result<(), Error<E>> {
        let data = request.encode().map_err(Error::Frame)?;

        debug!("Sending {:?} ({} bytes)", request.command(), data.len());
        trace!("TX: {:02x?}", data);

        for b in &data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Await and decode a single response frame
    pub fn read_response(&mut self) -> Result<Response, Error<E>> {
        let length = self.await_byte()?.ok_or(Error::ResponseTimeout)? as usize;
        if length < frame::FRAME_OVERHEAD {
            return Err(Error::Frame(FrameError::FrameTooShort(length)));
        }

        // A timeout part way through leaves a short frame for decode to reject
        let mut raw = Vec::with_capacity(length);
        while raw.len() < length {
            match self.await_byte()? {
                Some(b) => raw.push(b),
                None => break,
            }
        }
        trace!("RX: {:02x} {:02x?}", length, raw);

        let resp = frame::decode(length, &raw, &self.registry).map_err(Error::Frame)?;
        if !resp.checksum_matches() {
            warn!("Checksum mismatch on response 0x{:02x} (received 0x{:02x})", resp.kind, resp.checksum);
        }

        debug!("Received {}", resp);

        Ok(resp)
    }

    /// Send a request and await the matching response
    pub fn transact(&mut self, request: &Request) -> Result<Response, Error<E>> {
        self.send(request)?;

        let resp = self.read_response()?;
        let expected = request.command().response_kind();
        if resp.kind != expected {
            return Err(Error::UnexpectedResponse{ expected, actual: resp.kind });
        }

        Ok(resp)
    }

    /// Ask the bootloader to change baud rate, the local port is not changed
    pub fn change_baud_rate(&mut self, baud: u32) -> Result<Response, Error<E>> {
        let divisor = baud_divisor(baud).ok_or(Error::UnsupportedBaud(baud))?;
        self.transact(&Request::ChangeBaudRate{ divisor })
    }

    pub fn chip_id(&mut self) -> Result<Response, Error<E>> {
        self.transact(&Request::ChipId)
    }

    pub fn flash_id(&mut self) -> Result<Response, Error<E>> {
        self.transact(&Request::FlashId)
    }

    pub fn ram_read(&mut self, address: u32, length: u16) -> Result<Response, Error<E>> {
        self.transact(&Request::RamRead{ address, length })
    }

    pub fn select_flash_type(&mut self, flash_type: u8) -> Result<Response, Error<E>> {
        self.transact(&Request::select_flash_type(flash_type))
    }

    pub fn flash_read(&mut self, address: u32, length: u16) -> Result<Response, Error<E>> {
        self.transact(&Request::FlashRead{ address, length })
    }

    pub fn flash_erase(&mut self) -> Result<Response, Error<E>> {
        self.transact(&Request::FlashErase)
    }

    pub fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<Response, Error<E>> {
        self.transact(&Request::FlashWrite{ address, data })
    }

    /// Poll for a single byte, `None` on timeout
    fn await_byte(&mut self) -> Result<Option<u8>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;

            if t > self.options.response_timeout_ms {
                debug!("Receive timeout");
                return Ok(None)
            }
        }
    }
}
