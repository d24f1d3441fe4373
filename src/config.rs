//! Configuration loading and the per-stage configuration provider.
//!
//! Settings are loaded exactly once, from a TOML file merged with
//! `LINRIG_`-prefixed environment variables (Figment), into fixed validated
//! record types. Optional fields resolve to documented defaults at load time
//! and are never re-interpreted at a use site.
//!
//! The stage rules themselves (which DAC channels move to −4.5 V at which
//! stage, the per-stage power-rail target) live in [`StagePlan`], the
//! [`ConfigProvider`] implementation the sequencer pulls from. The original
//! bench rewrote its config files on disk before every stage and re-read
//! them; the plan computes the same records in memory.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    CurrentLimit, DacChannelTarget, DacRange, InstrumentKind, PowerChannelTarget, SourceKind,
    StageConfig, StageIndex,
};
use crate::error::{RigError, RigResult};

/// Number of DAC channels on the device under test.
pub const DAC_CHANNEL_COUNT: u8 = 32;

/// DAC channels `1..=STAGE_RULE_CHANNELS` participate in the stage rule;
/// channels above it keep their base targets.
pub const STAGE_RULE_CHANNELS: u8 = 7;

// =============================================================================
// Settings records
// =============================================================================

/// Top-level settings for the rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigSettings {
    /// Run every instrument against the simulated backend.
    #[serde(default = "default_true")]
    pub simulation: bool,
    #[serde(default)]
    pub delays: DelaySettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub sim: SimSettings,
    #[serde(default = "default_instruments")]
    pub instruments: Vec<InstrumentSpec>,
    #[serde(default)]
    pub power: PowerSettings,
    #[serde(default)]
    pub dac: DacSettings,
    /// Directory the CSV recorders append into.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            simulation: true,
            delays: DelaySettings::default(),
            scan: ScanSettings::default(),
            limits: LimitSettings::default(),
            sim: SimSettings::default(),
            instruments: default_instruments(),
            power: PowerSettings::default(),
            dac: DacSettings::default(),
            results_dir: default_results_dir(),
        }
    }
}

impl RigSettings {
    /// Loads settings from `path` (or `linrig.toml` in the working directory)
    /// merged with `LINRIG_`-prefixed environment variables, then validates.
    pub fn load(path: Option<&Path>) -> RigResult<Self> {
        let file = path.unwrap_or_else(|| Path::new("linrig.toml"));
        let settings: RigSettings = Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("LINRIG_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> RigResult<()> {
        if self.scan.point_count < 2 {
            return Err(RigError::Config(format!(
                "scan.point_count must be at least 2, got {}",
                self.scan.point_count
            )));
        }
        if !(1..=DAC_CHANNEL_COUNT).contains(&self.scan.dac_channel) {
            return Err(RigError::Config(format!(
                "scan.dac_channel must be in 1..={}, got {}",
                DAC_CHANNEL_COUNT, self.scan.dac_channel
            )));
        }
        if self.limits.input_safety_limit_v <= 0.0 {
            return Err(RigError::Config(
                "limits.input_safety_limit_v must be positive".to_string(),
            ));
        }
        for spec in &self.dac.channels {
            if !(1..=DAC_CHANNEL_COUNT).contains(&spec.channel) {
                return Err(RigError::Config(format!(
                    "dac channel override {} out of 1..={}",
                    spec.channel, DAC_CHANNEL_COUNT
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for inst in &self.instruments {
            if !seen.insert(inst.alias.as_str()) {
                return Err(RigError::Config(format!(
                    "duplicate instrument alias '{}'",
                    inst.alias
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Named delay parameters. The source implementation used anonymous
/// hard-coded sleeps for all of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySettings {
    /// Wait between driving the source and sampling the meter.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    /// Wait after a power rail is switched on, before measuring it.
    #[serde(with = "humantime_serde", default = "default_stabilization")]
    pub stabilization: Duration,
    /// Pause between consecutive configuration writes to one instrument.
    #[serde(with = "humantime_serde", default = "default_inter_command")]
    pub inter_command: Duration,
    /// Pause after each rail is switched off during the power-down walk.
    #[serde(with = "humantime_serde", default = "default_power_off")]
    pub power_off: Duration,
    /// Bounded wait for any single hardware call; expiry surfaces as a
    /// timeout error instead of hanging on an unresponsive device.
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            stabilization: default_stabilization(),
            inter_command: default_inter_command(),
            power_off: default_power_off(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_settle() -> Duration {
    Duration::from_millis(200)
}

fn default_stabilization() -> Duration {
    Duration::from_secs(1)
}

fn default_inter_command() -> Duration {
    Duration::from_millis(50)
}

fn default_power_off() -> Duration {
    Duration::from_millis(500)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Scan wiring: which aliases drive and sample the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Stimulus path for the sweep.
    #[serde(default = "default_source_kind")]
    pub source: SourceKind,
    #[serde(default = "default_dac_alias")]
    pub dac_alias: String,
    /// DAC channel driven during the sweep.
    #[serde(default = "default_dac_channel")]
    pub dac_channel: u8,
    #[serde(default = "default_generator_alias")]
    pub generator_alias: String,
    /// Signal-generator output channel used in DC mode.
    #[serde(default = "default_generator_channel")]
    pub generator_channel: u8,
    #[serde(default = "default_meter_alias")]
    pub meter_alias: String,
    #[serde(default = "default_point_count")]
    pub point_count: usize,
    /// Range the sweep codes are computed against.
    #[serde(default = "default_scan_range")]
    pub dac_range: DacRange,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            source: default_source_kind(),
            dac_alias: default_dac_alias(),
            dac_channel: default_dac_channel(),
            generator_alias: default_generator_alias(),
            generator_channel: default_generator_channel(),
            meter_alias: default_meter_alias(),
            point_count: default_point_count(),
            dac_range: default_scan_range(),
        }
    }
}

fn default_source_kind() -> SourceKind {
    SourceKind::Dac
}

fn default_dac_alias() -> String {
    "DAC1".to_string()
}

fn default_dac_channel() -> u8 {
    10
}

fn default_generator_alias() -> String {
    "DG1".to_string()
}

fn default_generator_channel() -> u8 {
    1
}

fn default_meter_alias() -> String {
    "DM1".to_string()
}

fn default_point_count() -> usize {
    101
}

fn default_scan_range() -> DacRange {
    DacRange::R10V
}

/// Pass/fail thresholds and safety bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// A stage fails when its nonlinearity exceeds this percentage of FSR.
    #[serde(default = "default_nonlinearity_limit")]
    pub nonlinearity_limit_pct: f64,
    /// Record limit violations as PASS_IGNORED instead of failing the stage.
    #[serde(default)]
    pub ignore_linearity_fail: bool,
    /// Target output amplitude the scan aims for, volts.
    #[serde(default = "default_target_output")]
    pub target_output_v: f64,
    /// Hard bound on the computed input amplitude; exceeding it clamps the
    /// sweep and logs a safety warning.
    #[serde(default = "default_input_safety_limit")]
    pub input_safety_limit_v: f64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            nonlinearity_limit_pct: default_nonlinearity_limit(),
            ignore_linearity_fail: false,
            target_output_v: default_target_output(),
            input_safety_limit_v: default_input_safety_limit(),
        }
    }
}

fn default_nonlinearity_limit() -> f64 {
    1.0
}

fn default_target_output() -> f64 {
    0.25
}

fn default_input_safety_limit() -> f64 {
    0.5
}

/// Behavior of the simulated signal chain. With `noise` at zero the chain is
/// fully deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    #[serde(default = "default_sim_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
    /// Quadratic distortion coefficient; nonzero makes a stage fail
    /// deterministically.
    #[serde(default)]
    pub distortion: f64,
    /// Uniform noise amplitude added to simulated readings.
    #[serde(default)]
    pub noise: f64,
    /// Current reported by the simulated supply, amps.
    #[serde(default = "default_base_current")]
    pub base_current: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            gain: default_sim_gain(),
            offset: 0.0,
            distortion: 0.0,
            noise: 0.0,
            base_current: default_base_current(),
        }
    }
}

fn default_sim_gain() -> f64 {
    1.0
}

fn default_base_current() -> f64 {
    0.4
}

/// One instrument to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub alias: String,
    pub kind: InstrumentKind,
    /// Transport address: `host:port` for bus instruments, a serial port
    /// path for the DAC. Ignored by the simulated backend.
    pub address: String,
}

fn default_instruments() -> Vec<InstrumentSpec> {
    vec![
        InstrumentSpec {
            alias: "DP1".to_string(),
            kind: InstrumentKind::PowerSupply,
            address: "192.168.0.10:5025".to_string(),
        },
        InstrumentSpec {
            alias: "DAC1".to_string(),
            kind: InstrumentKind::Dac,
            address: "/dev/ttyUSB0".to_string(),
        },
        InstrumentSpec {
            alias: "DM1".to_string(),
            kind: InstrumentKind::Multimeter,
            address: "192.168.0.11:5025".to_string(),
        },
        InstrumentSpec {
            alias: "DG1".to_string(),
            kind: InstrumentKind::SignalGenerator,
            address: "192.168.0.12:5025".to_string(),
        },
    ]
}

/// Power rail sequencing and limit records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSettings {
    /// Rails in power-on order; power-off walks this list in reverse.
    #[serde(default = "default_power_sequence")]
    pub sequence: Vec<PowerChannelTarget>,
    /// Current-limit records checked after power-on.
    #[serde(default)]
    pub limits: Vec<CurrentLimit>,
    /// Supply alias whose rail tracks the stage formula.
    #[serde(default = "default_stage_instrument")]
    pub stage_instrument: String,
    #[serde(default = "default_stage_channel")]
    pub stage_channel: u8,
    /// Current limit used for the stage rail when no sequence entry matches.
    #[serde(default = "default_stage_current")]
    pub stage_current: f64,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            sequence: default_power_sequence(),
            limits: Vec::new(),
            stage_instrument: default_stage_instrument(),
            stage_channel: default_stage_channel(),
            stage_current: default_stage_current(),
        }
    }
}

fn default_power_sequence() -> Vec<PowerChannelTarget> {
    vec![
        PowerChannelTarget {
            instrument: "DP1".to_string(),
            channel: 1,
            voltage: 5.0,
            current: 1.0,
        },
        PowerChannelTarget {
            instrument: "DP1".to_string(),
            channel: 2,
            voltage: 1.9,
            current: 0.5,
        },
    ]
}

fn default_stage_instrument() -> String {
    "DP1".to_string()
}

fn default_stage_channel() -> u8 {
    2
}

fn default_stage_current() -> f64 {
    0.5
}

/// Base DAC channel targets the stage rule modifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacSettings {
    /// Range applied to channels without an explicit override.
    #[serde(default = "default_scan_range")]
    pub default_range: DacRange,
    /// Voltage applied to channels without an explicit override.
    #[serde(default)]
    pub default_voltage: f64,
    /// Per-channel overrides of range and/or base voltage.
    #[serde(default)]
    pub channels: Vec<DacChannelSpec>,
    /// Serial baud rate for the real DAC transport.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for DacSettings {
    fn default() -> Self {
        Self {
            default_range: default_scan_range(),
            default_voltage: 0.0,
            channels: Vec::new(),
            baud_rate: default_baud_rate(),
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

/// Override record for one DAC channel's base target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacChannelSpec {
    pub channel: u8,
    pub range: Option<DacRange>,
    pub voltage: Option<f64>,
}

// =============================================================================
// Configuration provider
// =============================================================================

/// Supplies per-stage hardware targets and limit records to the sequencer.
pub trait ConfigProvider: Send + Sync {
    fn stage_config(&self, stage: StageIndex) -> RigResult<StageConfig>;
    fn power_limits(&self) -> RigResult<Vec<CurrentLimit>>;
    /// Rails in power-on order.
    fn power_sequence(&self) -> RigResult<Vec<PowerChannelTarget>>;
}

/// Stage-rail voltage target: `round(1.6 + 0.3 * stage, 2)` volts.
pub fn stage_power_voltage(stage: StageIndex) -> f64 {
    let v = 1.6 + 0.3 * f64::from(stage.get());
    (v * 100.0).round() / 100.0
}

/// [`ConfigProvider`] that derives every stage's records from the loaded
/// settings using the stage rules.
pub struct StagePlan {
    settings: Arc<RigSettings>,
}

impl StagePlan {
    pub fn new(settings: Arc<RigSettings>) -> Self {
        Self { settings }
    }

    /// The 32 base channel targets before any stage rule is applied.
    fn base_channels(&self) -> Vec<DacChannelTarget> {
        let dac = &self.settings.dac;
        let mut channels: Vec<DacChannelTarget> = (1..=DAC_CHANNEL_COUNT)
            .map(|channel| DacChannelTarget {
                channel,
                range: dac.default_range,
                voltage: dac.default_voltage,
            })
            .collect();
        for spec in &dac.channels {
            if let Some(target) = channels.iter_mut().find(|t| t.channel == spec.channel) {
                if let Some(range) = spec.range {
                    target.range = range;
                }
                if let Some(voltage) = spec.voltage {
                    target.voltage = voltage;
                }
            }
        }
        channels
    }
}

impl ConfigProvider for StagePlan {
    fn stage_config(&self, stage: StageIndex) -> RigResult<StageConfig> {
        let mut channels = self.base_channels();
        // Stage rule: channels 1..=i sit at -4.5 V, i+1..=7 at -2.5 V,
        // channels above 7 keep their base targets.
        for target in channels
            .iter_mut()
            .filter(|t| (1..=STAGE_RULE_CHANNELS).contains(&t.channel))
        {
            target.voltage = if target.channel <= stage.get() {
                -4.5
            } else {
                -2.5
            };
        }

        let power_cfg = &self.settings.power;
        let current = power_cfg
            .sequence
            .iter()
            .find(|t| {
                t.instrument == power_cfg.stage_instrument && t.channel == power_cfg.stage_channel
            })
            .map_or(power_cfg.stage_current, |t| t.current);

        Ok(StageConfig {
            stage,
            dac_channels: channels,
            power: PowerChannelTarget {
                instrument: power_cfg.stage_instrument.clone(),
                channel: power_cfg.stage_channel,
                voltage: stage_power_voltage(stage),
                current,
            },
        })
    }

    fn power_limits(&self) -> RigResult<Vec<CurrentLimit>> {
        Ok(self.settings.power.limits.clone())
    }

    fn power_sequence(&self) -> RigResult<Vec<PowerChannelTarget>> {
        Ok(self.settings.power.sequence.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn plan() -> StagePlan {
        StagePlan::new(Arc::new(RigSettings::default()))
    }

    #[test]
    fn test_stage_power_voltage_formula() {
        assert_eq!(stage_power_voltage(StageIndex::new(1).unwrap()), 1.9);
        assert_eq!(stage_power_voltage(StageIndex::new(7).unwrap()), 3.7);
    }

    #[test]
    fn test_stage_rule_channel_partition() {
        let cfg = plan().stage_config(StageIndex::new(2).unwrap()).unwrap();
        assert_eq!(cfg.dac_channels.len(), usize::from(DAC_CHANNEL_COUNT));
        assert_eq!(cfg.dac_channels[0].voltage, -4.5); // DAC1
        assert_eq!(cfg.dac_channels[1].voltage, -4.5); // DAC2
        for ch in 3..=7 {
            assert_eq!(cfg.dac_channels[ch - 1].voltage, -2.5, "DAC{}", ch);
        }
        // Channels 8..=32 keep the base target.
        for ch in 8..=32 {
            assert_eq!(cfg.dac_channels[ch - 1].voltage, 0.0, "DAC{}", ch);
        }
    }

    #[test]
    fn test_stage_config_power_target() {
        let cfg = plan().stage_config(StageIndex::new(7).unwrap()).unwrap();
        assert_eq!(cfg.power.voltage, 3.7);
        assert_eq!(cfg.power.instrument, "DP1");
        assert_eq!(cfg.power.channel, 2);
        // Current comes from the matching power-on sequence entry.
        assert_eq!(cfg.power.current, 0.5);
    }

    #[test]
    fn test_channel_override_applies_to_base() {
        let mut settings = RigSettings::default();
        settings.dac.channels.push(DacChannelSpec {
            channel: 20,
            range: Some(DacRange::R5V),
            voltage: Some(1.25),
        });
        let plan = StagePlan::new(Arc::new(settings));
        let cfg = plan.stage_config(StageIndex::new(3).unwrap()).unwrap();
        let ch20 = &cfg.dac_channels[19];
        assert_eq!(ch20.range, DacRange::R5V);
        assert_eq!(ch20.voltage, 1.25);
    }

    #[test]
    fn test_validate_rejects_bad_scan_channel() {
        let mut settings = RigSettings::default();
        settings.scan.dac_channel = 40;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_alias() {
        let mut settings = RigSettings::default();
        let dup = settings.instruments[0].clone();
        settings.instruments.push(dup);
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("LINRIG_SIMULATION", "false");
        let settings = RigSettings::load(Some(Path::new("/nonexistent/linrig.toml"))).unwrap();
        assert!(!settings.simulation);
        std::env::remove_var("LINRIG_SIMULATION");
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let settings = RigSettings::load(Some(Path::new("/nonexistent/linrig.toml"))).unwrap();
        assert!(settings.simulation);
        assert_eq!(settings.scan.point_count, 101);
        assert_eq!(settings.scan.dac_channel, 10);
        assert_eq!(settings.delays.settle, Duration::from_millis(200));
        assert_eq!(settings.limits.nonlinearity_limit_pct, 1.0);
    }
}
