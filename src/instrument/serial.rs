//! Serial transport for the DAC.
//!
//! The DAC speaks a one-way ASCII protocol over RS-232 (`OUTPUT <ch> <code>;`).
//! The real transport sits behind the `instrument_serial` feature; without it
//! the link reports a feature error at open time so the rest of the crate
//! builds and the simulated backend keeps working.

use crate::error::RigResult;

#[cfg(feature = "instrument_serial")]
mod serial_enabled {
    use super::*;
    use crate::error::RigError;
    use log::debug;
    use serialport::SerialPort;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Write-only serial line to the DAC.
    ///
    /// The open port is held behind a [`Mutex`] so the link is `Sync`: a
    /// `Box<dyn SerialPort>` is `Send` but not `Sync`, and registered devices
    /// must be `Send + Sync`. All access goes through `&mut self`, so the lock
    /// is uncontended.
    pub struct SerialLink {
        port_name: String,
        baud_rate: u32,
        port: Mutex<Option<Box<dyn SerialPort>>>,
    }

    impl SerialLink {
        pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                port: Mutex::new(None),
            }
        }

        pub fn is_open(&self) -> bool {
            self.port
                .lock()
                .map(|guard| guard.is_some())
                .unwrap_or(false)
        }

        pub fn open(&mut self) -> RigResult<()> {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|err| {
                    RigError::Connection(format!(
                        "failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, err
                    ))
                })?;
            *self.port.lock().expect("serial port mutex poisoned") = Some(port);
            Ok(())
        }

        pub fn close(&mut self) {
            *self.port.lock().expect("serial port mutex poisoned") = None;
        }

        /// Writes one command line, ASCII with trailing newline.
        pub fn write_line(&mut self, command: &str) -> RigResult<()> {
            debug!("serial [{}] >> {}", self.port_name, command);
            let mut guard = self.port.lock().expect("serial port mutex poisoned");
            let port = guard.as_mut().ok_or_else(|| {
                RigError::Connection(format!("serial port '{}' is not open", self.port_name))
            })?;
            port.write_all(command.as_bytes())
                .and_then(|_| port.write_all(b"\n"))
                .map_err(|err| {
                    RigError::Measurement(format!("serial write '{}' failed: {}", command, err))
                })
        }
    }
}

#[cfg(not(feature = "instrument_serial"))]
mod serial_disabled {
    use super::*;
    use crate::error::RigError;

    /// Stub serial link used when the feature is disabled.
    pub struct SerialLink;

    impl SerialLink {
        pub fn new(_port_name: impl Into<String>, _baud_rate: u32) -> Self {
            Self
        }

        pub fn is_open(&self) -> bool {
            false
        }

        pub fn open(&mut self) -> RigResult<()> {
            Err(RigError::SerialFeatureDisabled)
        }

        pub fn close(&mut self) {}

        pub fn write_line(&mut self, _command: &str) -> RigResult<()> {
            Err(RigError::SerialFeatureDisabled)
        }
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial_enabled::SerialLink;

#[cfg(not(feature = "instrument_serial"))]
pub use serial_disabled::SerialLink;
