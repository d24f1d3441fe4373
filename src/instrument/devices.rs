//! Concrete instrument types.
//!
//! Each device carries either the simulated backend (a handle to the shared
//! [`SimBus`]) or its real transport, and implements the capability subset
//! its hardware supports:
//!
//! | device            | capabilities                        | transport |
//! |-------------------|-------------------------------------|-----------|
//! | [`PowerSupply`]   | VoltageSource, CurrentMeter         | SCPI/TCP  |
//! | [`Dac`]           | VoltageSource (codes, gear regs)    | serial    |
//! | [`Multimeter`]    | VoltageMeter                        | SCPI/TCP  |
//! | [`SignalGenerator`] | VoltageSource (DC offset)         | SCPI/TCP  |

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{dac_volts, ConnectionState, DacRange, InstrumentKind};
use crate::error::RigResult;

use super::capabilities::{Connectable, CurrentMeter, Device, VoltageMeter, VoltageSource};
use super::scpi::ScpiLink;
use super::serial::SerialLink;
use super::sim::SimBus;

/// Settle after `*RST` before the generator accepts mode commands.
const RESET_SETTLE: Duration = Duration::from_millis(100);

// =============================================================================
// Power supply (DP)
// =============================================================================

enum PsuBackend {
    Sim(Arc<SimBus>),
    Scpi(ScpiLink),
}

/// Programmable power supply.
pub struct PowerSupply {
    address: String,
    state: ConnectionState,
    backend: PsuBackend,
}

impl PowerSupply {
    pub fn sim(address: impl Into<String>, bus: Arc<SimBus>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
            backend: PsuBackend::Sim(bus),
        }
    }

    pub fn scpi(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            backend: PsuBackend::Scpi(ScpiLink::new(address.clone())),
            address,
            state: ConnectionState::Disconnected,
        }
    }
}

#[async_trait]
impl Connectable for PowerSupply {
    async fn connect(&mut self) -> RigResult<()> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!("connect {}", self.address));
                info!("[sim] connected to power supply at {}", self.address);
            }
            PsuBackend::Scpi(link) => link.open().await?,
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        if let PsuBackend::Scpi(link) = &mut self.backend {
            link.close();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl VoltageSource for PowerSupply {
    async fn set_channel(&mut self, channel: u8, voltage: f64, current: f64) -> RigResult<()> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!(
                    "set_channel {} ch{} {}V {}A",
                    self.address, channel, voltage, current
                ));
                info!("[sim] DP set CH{}: {}V, {}A", channel, voltage, current);
                Ok(())
            }
            PsuBackend::Scpi(link) => {
                link.write_line(&format!(":APPLy CH{},{},{}", channel, voltage, current))
                    .await
            }
        }
    }

    async fn set_protection(&mut self, channel: u8, ovp: f64, ocp: f64) -> RigResult<()> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!(
                    "set_protection {} ch{} ovp={:.2} ocp={:.2}",
                    self.address, channel, ovp, ocp
                ));
                info!(
                    "[sim] DP set protection CH{}: OVP={:.2}V, OCP={:.2}A",
                    channel, ovp, ocp
                );
                Ok(())
            }
            PsuBackend::Scpi(link) => {
                link.write_line(&format!(":OUTPut:OVP:VALue CH{},{:.4}", channel, ovp))
                    .await?;
                link.write_line(&format!(":OUTPut:OVP CH{},ON", channel))
                    .await?;
                link.write_line(&format!(":OUTPut:OCP:VALue CH{},{:.4}", channel, ocp))
                    .await?;
                link.write_line(&format!(":OUTPut:OCP CH{},ON", channel))
                    .await
            }
        }
    }

    async fn output_on(&mut self, channel: u8) -> RigResult<()> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!("output_on {} ch{}", self.address, channel));
                info!("[sim] DP output ON CH{}", channel);
                Ok(())
            }
            PsuBackend::Scpi(link) => {
                link.write_line(&format!(":OUTPut CH{},ON", channel)).await
            }
        }
    }

    async fn output_off(&mut self, channel: u8) -> RigResult<()> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!("output_off {} ch{}", self.address, channel));
                info!("[sim] DP output OFF CH{}", channel);
                Ok(())
            }
            PsuBackend::Scpi(link) => {
                link.write_line(&format!(":OUTPut CH{},OFF", channel)).await
            }
        }
    }
}

#[async_trait]
impl CurrentMeter for PowerSupply {
    async fn measure_current(&mut self, channel: u8) -> RigResult<f64> {
        match &mut self.backend {
            PsuBackend::Sim(bus) => {
                bus.record(format!("measure_current {} ch{}", self.address, channel));
                Ok(bus.measure_current(channel))
            }
            PsuBackend::Scpi(link) => {
                link.query_f64(&format!(":MEASure:CURRent? CH{}", channel))
                    .await
            }
        }
    }
}

impl Device for PowerSupply {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::PowerSupply
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn simulated(&self) -> bool {
        matches!(self.backend, PsuBackend::Sim(_))
    }

    fn as_voltage_source(&mut self) -> Option<&mut dyn VoltageSource> {
        Some(self)
    }

    fn as_current_meter(&mut self) -> Option<&mut dyn CurrentMeter> {
        Some(self)
    }
}

// =============================================================================
// DAC under test
// =============================================================================

enum DacBackend {
    Sim(Arc<SimBus>),
    Serial(SerialLink),
}

/// Multi-channel DAC, driven over a one-way serial protocol.
pub struct Dac {
    address: String,
    range: DacRange,
    state: ConnectionState,
    backend: DacBackend,
}

impl Dac {
    pub fn sim(address: impl Into<String>, range: DacRange, bus: Arc<SimBus>) -> Self {
        Self {
            address: address.into(),
            range,
            state: ConnectionState::Disconnected,
            backend: DacBackend::Sim(bus),
        }
    }

    pub fn serial(address: impl Into<String>, baud_rate: u32, range: DacRange) -> Self {
        let address = address.into();
        Self {
            backend: DacBackend::Serial(SerialLink::new(address.clone(), baud_rate)),
            address,
            range,
            state: ConnectionState::Disconnected,
        }
    }
}

#[async_trait]
impl Connectable for Dac {
    async fn connect(&mut self) -> RigResult<()> {
        match &mut self.backend {
            DacBackend::Sim(bus) => {
                bus.record(format!("connect {}", self.address));
                info!("[sim] connected to DAC at {}", self.address);
            }
            DacBackend::Serial(link) => link.open()?,
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        if let DacBackend::Serial(link) = &mut self.backend {
            link.close();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl VoltageSource for Dac {
    async fn set_output(&mut self, channel: u8, code: u16) -> RigResult<()> {
        match &mut self.backend {
            DacBackend::Sim(bus) => {
                bus.record(format!("set_output {} ch{} {}", self.address, channel, code));
                // The last written channel drives the simulated chain input.
                bus.set_source_volts(dac_volts(self.range, code));
                Ok(())
            }
            DacBackend::Serial(link) => link.write_line(&format!("OUTPUT {} {};", channel, code)),
        }
    }

    async fn set_gear_register(&mut self, group: u8, register: u16) -> RigResult<()> {
        match &mut self.backend {
            DacBackend::Sim(bus) => {
                bus.record(format!(
                    "set_gear_register {} g{} 0x{:04X}",
                    self.address, group, register
                ));
                Ok(())
            }
            DacBackend::Serial(link) => link.write_line(&format!("GEAR {} {};", group, register)),
        }
    }
}

impl Device for Dac {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Dac
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn simulated(&self) -> bool {
        matches!(self.backend, DacBackend::Sim(_))
    }

    fn as_voltage_source(&mut self) -> Option<&mut dyn VoltageSource> {
        Some(self)
    }
}

// =============================================================================
// Multimeter (DM)
// =============================================================================

enum MeterBackend {
    Sim(Arc<SimBus>),
    Scpi(ScpiLink),
}

/// Digital multimeter sampling the chain output.
pub struct Multimeter {
    address: String,
    state: ConnectionState,
    backend: MeterBackend,
}

impl Multimeter {
    pub fn sim(address: impl Into<String>, bus: Arc<SimBus>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
            backend: MeterBackend::Sim(bus),
        }
    }

    pub fn scpi(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            backend: MeterBackend::Scpi(ScpiLink::new(address.clone())),
            address,
            state: ConnectionState::Disconnected,
        }
    }
}

#[async_trait]
impl Connectable for Multimeter {
    async fn connect(&mut self) -> RigResult<()> {
        match &mut self.backend {
            MeterBackend::Sim(bus) => {
                bus.record(format!("connect {}", self.address));
                info!("[sim] connected to multimeter at {}", self.address);
            }
            MeterBackend::Scpi(link) => link.open().await?,
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        if let MeterBackend::Scpi(link) = &mut self.backend {
            link.close();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl VoltageMeter for Multimeter {
    async fn measure_voltage(&mut self) -> RigResult<f64> {
        match &mut self.backend {
            MeterBackend::Sim(bus) => {
                bus.record(format!("measure_voltage {}", self.address));
                Ok(bus.measure_voltage())
            }
            MeterBackend::Scpi(link) => link.query_f64(":MEASure:VOLTage:DC?").await,
        }
    }
}

impl Device for Multimeter {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Multimeter
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn simulated(&self) -> bool {
        matches!(self.backend, MeterBackend::Sim(_))
    }

    fn as_voltage_meter(&mut self) -> Option<&mut dyn VoltageMeter> {
        Some(self)
    }
}

// =============================================================================
// Signal generator (DG)
// =============================================================================

enum GenBackend {
    Sim(Arc<SimBus>),
    Scpi(ScpiLink),
}

/// Signal generator used as an alternate DC stimulus source.
pub struct SignalGenerator {
    address: String,
    state: ConnectionState,
    backend: GenBackend,
}

impl SignalGenerator {
    pub fn sim(address: impl Into<String>, bus: Arc<SimBus>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
            backend: GenBackend::Sim(bus),
        }
    }

    pub fn scpi(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            backend: GenBackend::Scpi(ScpiLink::new(address.clone())),
            address,
            state: ConnectionState::Disconnected,
        }
    }
}

#[async_trait]
impl Connectable for SignalGenerator {
    async fn connect(&mut self) -> RigResult<()> {
        match &mut self.backend {
            GenBackend::Sim(bus) => {
                bus.record(format!("connect {}", self.address));
                info!("[sim] connected to signal generator at {}", self.address);
            }
            GenBackend::Scpi(link) => link.open().await?,
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        if let GenBackend::Scpi(link) = &mut self.backend {
            link.close();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl VoltageSource for SignalGenerator {
    async fn init_dc_mode(&mut self, channel: u8) -> RigResult<()> {
        match &mut self.backend {
            GenBackend::Sim(bus) => {
                bus.record(format!("init_dc_mode {} ch{}", self.address, channel));
                info!("[sim] DG initialize DC mode CH{}", channel);
                Ok(())
            }
            GenBackend::Scpi(link) => {
                link.write_line("*RST").await?;
                tokio::time::sleep(RESET_SETTLE).await;
                link.write_line(&format!("SOUR{}:FUNC DC", channel)).await?;
                link.write_line(&format!("SOUR{}:VOLT 0", channel)).await?;
                link.write_line(&format!("SOUR{}:VOLT:OFFS 0", channel))
                    .await?;
                link.write_line(&format!("OUTP{}:LOAD 50", channel)).await?;
                link.write_line(&format!("OUTP{} ON", channel)).await
            }
        }
    }

    async fn set_dc_offset(&mut self, channel: u8, voltage: f64) -> RigResult<()> {
        match &mut self.backend {
            GenBackend::Sim(bus) => {
                bus.record(format!(
                    "set_dc_offset {} ch{} {}V",
                    self.address, channel, voltage
                ));
                bus.set_source_volts(voltage);
                Ok(())
            }
            GenBackend::Scpi(link) => {
                link.write_line(&format!("SOUR{}:VOLT:OFFS {}", channel, voltage))
                    .await
            }
        }
    }
}

impl Device for SignalGenerator {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::SignalGenerator
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn simulated(&self) -> bool {
        matches!(self.backend, GenBackend::Sim(_))
    }

    fn as_voltage_source(&mut self) -> Option<&mut dyn VoltageSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimSettings;
    use crate::core::dac_code;
    use crate::error::RigError;

    fn bus() -> Arc<SimBus> {
        Arc::new(SimBus::new(SimSettings::default()))
    }

    #[tokio::test]
    async fn test_sim_dac_drives_chain_input() {
        let bus = bus();
        let mut dac = Dac::sim("/dev/null", DacRange::R10V, Arc::clone(&bus));
        dac.connect().await.unwrap();
        dac.set_output(10, dac_code(DacRange::R10V, 0.25))
            .await
            .unwrap();
        assert!((bus.source_volts() - 0.25).abs() < 3.1e-4);
    }

    #[tokio::test]
    async fn test_sim_generator_drives_chain_input_exactly() {
        let bus = bus();
        let mut dg = SignalGenerator::sim("sim", Arc::clone(&bus));
        dg.connect().await.unwrap();
        dg.set_dc_offset(1, -0.125).await.unwrap();
        assert_eq!(bus.source_volts(), -0.125);
    }

    #[tokio::test]
    async fn test_capability_subsets() {
        let bus = bus();
        let mut dm = Multimeter::sim("sim", Arc::clone(&bus));
        assert!(dm.as_voltage_meter().is_some());
        assert!(dm.as_voltage_source().is_none());
        assert!(dm.as_current_meter().is_none());

        let mut dp = PowerSupply::sim("sim", Arc::clone(&bus));
        assert!(dp.as_voltage_source().is_some());
        assert!(dp.as_current_meter().is_some());
        assert!(dp.as_voltage_meter().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_operation_reports_error() {
        let bus = bus();
        let mut dac = Dac::sim("sim", DacRange::R10V, bus);
        dac.connect().await.unwrap();
        let err = dac.set_channel(1, 5.0, 1.0).await.unwrap_err();
        assert!(matches!(err, RigError::Unsupported { op: "set_channel" }));
    }

    #[tokio::test]
    async fn test_connection_state_round_trip() {
        let bus = bus();
        let mut dp = PowerSupply::sim("sim", bus);
        assert!(!dp.is_connected());
        dp.connect().await.unwrap();
        assert!(dp.is_connected());
        dp.close().await.unwrap();
        assert!(!dp.is_connected());
    }
}
