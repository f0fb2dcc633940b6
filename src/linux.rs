use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

fn kind(e: SerialError) -> IoErrorKind {
    IoError::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_baud(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(kind)?;
        settings.set_baud_rate(BaudRate::from_speed(baud as usize)).map_err(kind)?;
        self.0.write_settings(&settings).map_err(kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance at the initial
    /// baud rate from `options`
    pub fn linux<P: AsRef<Path>>(
        port: P,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(options.initial_baud as usize))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return immediately, the programmer's poll delay is the only wait
        port.0.set_timeout(Duration::from_millis(0))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
