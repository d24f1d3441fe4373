//! Capability traits for instruments.
//!
//! Each instrument kind implements the subset of capabilities it actually
//! supports; callers downcast through [`Device`] accessors instead of
//! matching on a device-kind string. Operations a device does not override
//! report [`crate::error::RigError::Unsupported`].

use async_trait::async_trait;

use crate::core::{ConnectionState, InstrumentKind};
use crate::error::{RigError, RigResult};

/// Connection lifecycle. Every registered instrument is connectable.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Establishes the hardware connection (or marks the simulated backend
    /// connected). One attempt; failure surfaces as a connection error.
    async fn connect(&mut self) -> RigResult<()>;

    /// Releases the transport and marks the instrument disconnected.
    async fn close(&mut self) -> RigResult<()>;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Voltage stimulus capability: supply rails, DAC codes, DC offsets.
///
/// Devices override the operations they support; the defaults report the
/// operation as unsupported.
#[async_trait]
pub trait VoltageSource: Connectable {
    /// Programs one supply channel's voltage and current limit.
    async fn set_channel(&mut self, _channel: u8, _voltage: f64, _current: f64) -> RigResult<()> {
        Err(RigError::Unsupported { op: "set_channel" })
    }

    /// Programs over-voltage / over-current protection for one channel.
    async fn set_protection(&mut self, _channel: u8, _ovp: f64, _ocp: f64) -> RigResult<()> {
        Err(RigError::Unsupported {
            op: "set_protection",
        })
    }

    async fn output_on(&mut self, _channel: u8) -> RigResult<()> {
        Err(RigError::Unsupported { op: "output_on" })
    }

    async fn output_off(&mut self, _channel: u8) -> RigResult<()> {
        Err(RigError::Unsupported { op: "output_off" })
    }

    /// Writes a raw 16-bit code to one DAC channel.
    async fn set_output(&mut self, _channel: u8, _code: u16) -> RigResult<()> {
        Err(RigError::Unsupported { op: "set_output" })
    }

    /// Writes the shared range register for one 4-channel DAC group.
    async fn set_gear_register(&mut self, _group: u8, _register: u16) -> RigResult<()> {
        Err(RigError::Unsupported {
            op: "set_gear_register",
        })
    }

    /// Puts a signal generator channel into DC output mode.
    async fn init_dc_mode(&mut self, _channel: u8) -> RigResult<()> {
        Err(RigError::Unsupported { op: "init_dc_mode" })
    }

    /// Drives a signal generator channel's DC offset directly.
    async fn set_dc_offset(&mut self, _channel: u8, _voltage: f64) -> RigResult<()> {
        Err(RigError::Unsupported { op: "set_dc_offset" })
    }
}

/// Voltage measurement capability (multimeter front end).
#[async_trait]
pub trait VoltageMeter: Connectable {
    async fn measure_voltage(&mut self) -> RigResult<f64>;
}

/// Current measurement capability (supply readback).
#[async_trait]
pub trait CurrentMeter: Connectable {
    async fn measure_current(&mut self, channel: u8) -> RigResult<f64>;
}

/// Base trait for registered devices: identity plus capability accessors.
///
/// The accessors return `None` for capabilities the device does not carry;
/// the registry handle maps that to an unsupported-operation error.
pub trait Device: Connectable {
    fn kind(&self) -> InstrumentKind;

    fn address(&self) -> &str;

    fn simulated(&self) -> bool;

    fn as_voltage_source(&mut self) -> Option<&mut dyn VoltageSource> {
        None
    }

    fn as_voltage_meter(&mut self) -> Option<&mut dyn VoltageMeter> {
        None
    }

    fn as_current_meter(&mut self) -> Option<&mut dyn CurrentMeter> {
        None
    }
}
