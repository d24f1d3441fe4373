//! Instrument registry: alias → capability-typed handle.
//!
//! The registry owns every instrument. Registration and removal take the
//! write lock; lookups are concurrent reads, safe while a scan is running.
//! Each handle serializes hardware commands through a per-instrument mutex,
//! so at most one command is in flight per alias at any time, while commands
//! to different aliases proceed independently.
//!
//! Every hardware call goes through a bounded wait (`command_timeout`); an
//! unresponsive device surfaces a timeout error instead of hanging the run.

use futures::future::join_all;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::config::RigSettings;
use crate::core::{DacRange, InstrumentKind};
use crate::error::{RigError, RigResult};

use super::capabilities::Device;
use super::devices::{Dac, Multimeter, PowerSupply, SignalGenerator};
use super::sim::SimBus;

/// Runs `fut` under the configured per-command timeout.
async fn bounded<T>(
    op: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = RigResult<T>>,
) -> RigResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RigError::Timeout {
            op: op.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Handle to one registered instrument.
///
/// This is the per-capability façade the rest of the crate talks to. The
/// device behind it is locked per command; operations the device does not
/// support report [`RigError::Unsupported`].
pub struct InstrumentHandle {
    alias: String,
    kind: InstrumentKind,
    simulated: bool,
    command_timeout: Duration,
    device: Mutex<Box<dyn Device>>,
}

impl std::fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("alias", &self.alias)
            .field("kind", &self.kind)
            .field("simulated", &self.simulated)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl InstrumentHandle {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn simulated(&self) -> bool {
        self.simulated
    }

    pub async fn is_connected(&self) -> bool {
        self.device.lock().await.is_connected()
    }

    pub async fn connect(&self) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        bounded("connect", self.command_timeout, dev.connect()).await
    }

    /// Connects only if not already connected.
    pub async fn ensure_connected(&self) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        if dev.is_connected() {
            return Ok(());
        }
        bounded("connect", self.command_timeout, dev.connect()).await
    }

    pub async fn close(&self) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        bounded("close", self.command_timeout, dev.close()).await
    }

    pub async fn set_channel(&self, channel: u8, voltage: f64, current: f64) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev
            .as_voltage_source()
            .ok_or(RigError::Unsupported { op: "set_channel" })?;
        bounded(
            "set_channel",
            self.command_timeout,
            src.set_channel(channel, voltage, current),
        )
        .await
    }

    pub async fn set_protection(&self, channel: u8, ovp: f64, ocp: f64) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev.as_voltage_source().ok_or(RigError::Unsupported {
            op: "set_protection",
        })?;
        bounded(
            "set_protection",
            self.command_timeout,
            src.set_protection(channel, ovp, ocp),
        )
        .await
    }

    pub async fn output_on(&self, channel: u8) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev
            .as_voltage_source()
            .ok_or(RigError::Unsupported { op: "output_on" })?;
        bounded("output_on", self.command_timeout, src.output_on(channel)).await
    }

    pub async fn output_off(&self, channel: u8) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev
            .as_voltage_source()
            .ok_or(RigError::Unsupported { op: "output_off" })?;
        bounded("output_off", self.command_timeout, src.output_off(channel)).await
    }

    pub async fn set_output(&self, channel: u8, code: u16) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev
            .as_voltage_source()
            .ok_or(RigError::Unsupported { op: "set_output" })?;
        bounded(
            "set_output",
            self.command_timeout,
            src.set_output(channel, code),
        )
        .await
    }

    pub async fn set_gear_register(&self, group: u8, register: u16) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev.as_voltage_source().ok_or(RigError::Unsupported {
            op: "set_gear_register",
        })?;
        bounded(
            "set_gear_register",
            self.command_timeout,
            src.set_gear_register(group, register),
        )
        .await
    }

    pub async fn init_dc_mode(&self, channel: u8) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev
            .as_voltage_source()
            .ok_or(RigError::Unsupported { op: "init_dc_mode" })?;
        bounded(
            "init_dc_mode",
            self.command_timeout,
            src.init_dc_mode(channel),
        )
        .await
    }

    pub async fn set_dc_offset(&self, channel: u8, voltage: f64) -> RigResult<()> {
        let mut dev = self.device.lock().await;
        let src = dev.as_voltage_source().ok_or(RigError::Unsupported {
            op: "set_dc_offset",
        })?;
        bounded(
            "set_dc_offset",
            self.command_timeout,
            src.set_dc_offset(channel, voltage),
        )
        .await
    }

    pub async fn measure_voltage(&self) -> RigResult<f64> {
        let mut dev = self.device.lock().await;
        let meter = dev.as_voltage_meter().ok_or(RigError::Unsupported {
            op: "measure_voltage",
        })?;
        bounded(
            "measure_voltage",
            self.command_timeout,
            meter.measure_voltage(),
        )
        .await
    }

    pub async fn measure_current(&self, channel: u8) -> RigResult<f64> {
        let mut dev = self.device.lock().await;
        let meter = dev.as_current_meter().ok_or(RigError::Unsupported {
            op: "measure_current",
        })?;
        bounded(
            "measure_current",
            self.command_timeout,
            meter.measure_current(channel),
        )
        .await
    }
}

/// Owns the alias table. No process-wide singleton: the registry is built at
/// startup and passed into the sequencer explicitly.
pub struct InstrumentRegistry {
    simulation: bool,
    command_timeout: Duration,
    dac_range: DacRange,
    dac_baud: u32,
    sim_bus: Arc<SimBus>,
    instruments: RwLock<HashMap<String, Arc<InstrumentHandle>>>,
}

impl InstrumentRegistry {
    pub fn new(settings: &RigSettings) -> Self {
        Self {
            simulation: settings.simulation,
            command_timeout: settings.delays.command_timeout,
            dac_range: settings.scan.dac_range,
            dac_baud: settings.dac.baud_rate,
            sim_bus: Arc::new(SimBus::new(settings.sim.clone())),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    pub fn simulation(&self) -> bool {
        self.simulation
    }

    /// Shared simulated-bench state. Only meaningful in simulation mode;
    /// tests use it to inspect the hardware traffic a run produced.
    pub fn sim_bus(&self) -> Arc<SimBus> {
        Arc::clone(&self.sim_bus)
    }

    /// Registers a new instrument. Alias uniqueness is enforced here.
    pub async fn register(
        &self,
        alias: &str,
        kind: InstrumentKind,
        address: &str,
    ) -> RigResult<Arc<InstrumentHandle>> {
        let device: Box<dyn Device> = if self.simulation {
            let bus = Arc::clone(&self.sim_bus);
            match kind {
                InstrumentKind::PowerSupply => Box::new(PowerSupply::sim(address, bus)),
                InstrumentKind::Dac => Box::new(Dac::sim(address, self.dac_range, bus)),
                InstrumentKind::Multimeter => Box::new(Multimeter::sim(address, bus)),
                InstrumentKind::SignalGenerator => Box::new(SignalGenerator::sim(address, bus)),
            }
        } else {
            match kind {
                InstrumentKind::PowerSupply => Box::new(PowerSupply::scpi(address)),
                InstrumentKind::Dac => {
                    Box::new(Dac::serial(address, self.dac_baud, self.dac_range))
                }
                InstrumentKind::Multimeter => Box::new(Multimeter::scpi(address)),
                InstrumentKind::SignalGenerator => Box::new(SignalGenerator::scpi(address)),
            }
        };

        let handle = Arc::new(InstrumentHandle {
            alias: alias.to_string(),
            kind,
            simulated: self.simulation,
            command_timeout: self.command_timeout,
            device: Mutex::new(device),
        });

        let mut table = self.instruments.write().await;
        if table.contains_key(alias) {
            return Err(RigError::DuplicateAlias {
                alias: alias.to_string(),
            });
        }
        info!("registered {} '{}' at {}", kind, alias, address);
        table.insert(alias.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub async fn lookup(&self, alias: &str) -> RigResult<Arc<InstrumentHandle>> {
        self.instruments
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| RigError::NotFound {
                alias: alias.to_string(),
            })
    }

    /// Removes an instrument, closing it first if connected.
    pub async fn remove(&self, alias: &str) -> RigResult<()> {
        let handle = {
            let mut table = self.instruments.write().await;
            table.remove(alias).ok_or_else(|| RigError::NotFound {
                alias: alias.to_string(),
            })?
        };
        if handle.is_connected().await {
            if let Err(err) = handle.close().await {
                warn!("error closing '{}' during removal: {}", alias, err);
            }
        }
        Ok(())
    }

    pub async fn aliases(&self) -> Vec<String> {
        self.instruments.read().await.keys().cloned().collect()
    }

    async fn snapshot(&self) -> Vec<Arc<InstrumentHandle>> {
        self.instruments.read().await.values().cloned().collect()
    }

    /// Connects every registered instrument concurrently. Failures are
    /// logged and skipped; returns the number of connected instruments.
    pub async fn connect_all(&self) -> usize {
        let handles = self.snapshot().await;
        let results = join_all(handles.iter().map(|h| h.connect())).await;
        let mut connected = 0;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(()) => connected += 1,
                Err(err) => warn!("failed to connect '{}': {}", handle.alias(), err),
            }
        }
        connected
    }

    /// Closes every registered instrument.
    pub async fn disconnect_all(&self) {
        let handles = self.snapshot().await;
        let results = join_all(handles.iter().map(|h| h.close())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(err) = result {
                warn!("failed to close '{}': {}", handle.alias(), err);
            }
        }
    }

    /// True when at least one connected instrument of `kind` is registered.
    pub async fn any_connected(&self, kind: InstrumentKind) -> bool {
        for handle in self.snapshot().await {
            if handle.kind() == kind && handle.is_connected().await {
                return true;
            }
        }
        false
    }
}

/// Builds a registry and registers every instrument from the settings.
pub async fn build_registry(settings: &RigSettings) -> RigResult<Arc<InstrumentRegistry>> {
    let registry = Arc::new(InstrumentRegistry::new(settings));
    for spec in &settings.instruments {
        registry
            .register(&spec.alias, spec.kind, &spec.address)
            .await?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_settings() -> RigSettings {
        RigSettings::default()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = InstrumentRegistry::new(&sim_settings());
        registry
            .register("DP1", InstrumentKind::PowerSupply, "sim")
            .await
            .unwrap();
        let handle = registry.lookup("DP1").await.unwrap();
        assert_eq!(handle.alias(), "DP1");
        assert_eq!(handle.kind(), InstrumentKind::PowerSupply);
        assert!(handle.simulated());
    }

    #[tokio::test]
    async fn test_lookup_missing_alias_is_not_found() {
        let registry = InstrumentRegistry::new(&sim_settings());
        let err = registry.lookup("DM9").await.unwrap_err();
        assert!(matches!(err, RigError::NotFound { alias } if alias == "DM9"));
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let registry = InstrumentRegistry::new(&sim_settings());
        registry
            .register("DAC1", InstrumentKind::Dac, "sim")
            .await
            .unwrap();
        let err = registry
            .register("DAC1", InstrumentKind::Dac, "sim")
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::DuplicateAlias { .. }));
    }

    #[tokio::test]
    async fn test_connect_all_and_roles() {
        let settings = sim_settings();
        let registry = build_registry(&settings).await.unwrap();
        assert_eq!(registry.connect_all().await, settings.instruments.len());
        assert!(registry.any_connected(InstrumentKind::PowerSupply).await);
        assert!(registry.any_connected(InstrumentKind::Dac).await);
        assert!(registry.any_connected(InstrumentKind::Multimeter).await);
        registry.disconnect_all().await;
        assert!(!registry.any_connected(InstrumentKind::Dac).await);
    }

    #[tokio::test]
    async fn test_remove_closes_instrument() {
        let registry = InstrumentRegistry::new(&sim_settings());
        let handle = registry
            .register("DM1", InstrumentKind::Multimeter, "sim")
            .await
            .unwrap();
        handle.connect().await.unwrap();
        registry.remove("DM1").await.unwrap();
        assert!(registry.lookup("DM1").await.is_err());
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_unsupported_capability_via_handle() {
        let registry = InstrumentRegistry::new(&sim_settings());
        let handle = registry
            .register("DM1", InstrumentKind::Multimeter, "sim")
            .await
            .unwrap();
        handle.connect().await.unwrap();
        let err = handle.measure_current(1).await.unwrap_err();
        assert!(matches!(err, RigError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_lookups() {
        let settings = sim_settings();
        let registry = build_registry(&settings).await.unwrap();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.lookup("DM1").await.map(|h| h.kind()) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), InstrumentKind::Multimeter);
        }
    }
}
