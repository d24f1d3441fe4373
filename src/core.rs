//! Core data types for the linearity test rig.
//!
//! This module defines the shared data model: instrument classification,
//! stage indices, DAC ranges and their gear-register encoding, per-stage
//! configuration records, scan series, linearity metrics, and the result
//! records produced by a run.
//!
//! Everything here is plain data. The state-machine logic lives in
//! [`crate::sequencer`] and [`crate::site`]; the numeric analysis in
//! [`crate::analysis`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RigError, RigResult};

// =============================================================================
// Instruments
// =============================================================================

/// The kind of instrument behind a registry alias.
///
/// Each kind implements a fixed subset of the capability traits in
/// [`crate::instrument::capabilities`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Programmable power supply ("DP").
    #[serde(alias = "DP")]
    PowerSupply,
    /// Multi-channel DAC under test ("DAC").
    #[serde(alias = "DAC")]
    Dac,
    /// Digital multimeter ("DM").
    #[serde(alias = "DM")]
    Multimeter,
    /// Signal generator with a DC output mode ("DG").
    #[serde(alias = "DG")]
    SignalGenerator,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::PowerSupply => "power supply",
            InstrumentKind::Dac => "DAC",
            InstrumentKind::Multimeter => "multimeter",
            InstrumentKind::SignalGenerator => "signal generator",
        };
        write!(f, "{}", name)
    }
}

/// Connection lifecycle state of a registered instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Stimulus source driven during a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// DAC channel, driven through the 16-bit code path.
    Dac,
    /// Signal generator in DC mode, driven as a direct offset voltage.
    SignalGenerator,
}

// =============================================================================
// Stages
// =============================================================================

/// Validated stage index in `1..=7`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StageIndex(u8);

impl StageIndex {
    /// Number of gain stages in a full sequence.
    pub const COUNT: u8 = 7;

    /// The first stage.
    pub const FIRST: StageIndex = StageIndex(1);

    pub fn new(index: u8) -> RigResult<Self> {
        if (1..=Self::COUNT).contains(&index) {
            Ok(StageIndex(index))
        } else {
            Err(RigError::StageIndex(index))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Iterate stages 1..=7 in order.
    pub fn all() -> impl Iterator<Item = StageIndex> {
        (1..=Self::COUNT).map(StageIndex)
    }
}

impl TryFrom<u8> for StageIndex {
    type Error = RigError;

    fn try_from(value: u8) -> RigResult<Self> {
        StageIndex::new(value)
    }
}

impl From<StageIndex> for u8 {
    fn from(value: StageIndex) -> u8 {
        value.0
    }
}

impl fmt::Display for StageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// DAC ranges and gear registers
// =============================================================================

/// Symmetric DAC output range ("gear"). Range `R` spans `[-R, +R]` volts.
///
/// Channels are grouped four to a gear register; see [`gear_register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum DacRange {
    R2V5,
    R5V,
    R10V,
    R20V,
}

impl DacRange {
    /// Full-scale voltage `R` of the symmetric `[-R, +R]` span.
    pub fn full_scale_volts(self) -> f64 {
        match self {
            DacRange::R2V5 => 2.5,
            DacRange::R5V => 5.0,
            DacRange::R10V => 10.0,
            DacRange::R20V => 20.0,
        }
    }

    /// 4-bit code written into the shared gear register for this range.
    pub fn gear_nibble(self) -> u16 {
        match self {
            DacRange::R2V5 => 14,
            DacRange::R5V => 9,
            DacRange::R10V => 10,
            DacRange::R20V => 12,
        }
    }
}

impl TryFrom<f64> for DacRange {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        match value {
            v if v == 2.5 => Ok(DacRange::R2V5),
            v if v == 5.0 => Ok(DacRange::R5V),
            v if v == 10.0 => Ok(DacRange::R10V),
            v if v == 20.0 => Ok(DacRange::R20V),
            other => Err(format!(
                "invalid DAC range {} (expected 2.5, 5, 10 or 20)",
                other
            )),
        }
    }
}

impl From<DacRange> for f64 {
    fn from(value: DacRange) -> f64 {
        value.full_scale_volts()
    }
}

/// Packs the ranges of one 4-channel group into its shared 16-bit gear
/// register: `(g3 << 12) | (g2 << 8) | (g1 << 4) | g0`.
pub fn gear_register(ranges: [DacRange; 4]) -> u16 {
    (ranges[3].gear_nibble() << 12)
        | (ranges[2].gear_nibble() << 8)
        | (ranges[1].gear_nibble() << 4)
        | ranges[0].gear_nibble()
}

/// Converts a voltage to the 16-bit DAC control code for the given range.
///
/// The voltage is clamped to the symmetric span `[-R, +R]` first; the code
/// is clamped to `0..=65535`.
pub fn dac_code(range: DacRange, voltage: f64) -> u16 {
    let fs = range.full_scale_volts();
    let v = voltage.clamp(-fs, fs);
    let code = ((fs + v) * 65535.0 / (2.0 * fs)).round();
    code.clamp(0.0, 65535.0) as u16
}

/// Inverse of [`dac_code`]: the output voltage a code produces on a range.
pub fn dac_volts(range: DacRange, code: u16) -> f64 {
    let fs = range.full_scale_volts();
    f64::from(code) * (2.0 * fs) / 65535.0 - fs
}

// =============================================================================
// Configuration records
// =============================================================================

/// Target for one DAC channel within a stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DacChannelTarget {
    /// Channel index, `1..=32`.
    pub channel: u8,
    pub range: DacRange,
    pub voltage: f64,
}

/// Target for one power-supply channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerChannelTarget {
    /// Registry alias of the supply (e.g. "DP1").
    pub instrument: String,
    pub channel: u8,
    pub voltage: f64,
    pub current: f64,
}

/// Configured current bounds for one supply channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentLimit {
    pub instrument: String,
    pub channel: u8,
    #[serde(default = "neg_infinity")]
    pub min_current: f64,
    #[serde(default = "infinity")]
    pub max_current: f64,
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

fn infinity() -> f64 {
    f64::INFINITY
}

impl CurrentLimit {
    /// Classifies a measured current against these bounds.
    pub fn check(&self, measured: f64) -> LimitStatus {
        if self.min_current <= measured && measured <= self.max_current {
            LimitStatus::Pass
        } else {
            LimitStatus::Fail
        }
    }
}

/// Complete hardware configuration for one stage: 32 DAC channel targets and
/// one power channel target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: StageIndex,
    pub dac_channels: Vec<DacChannelTarget>,
    pub power: PowerChannelTarget,
}

// =============================================================================
// Scan data
// =============================================================================

/// One (commanded, measured) voltage pair captured during a scan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub commanded: f64,
    pub measured: f64,
}

/// Parallel commanded/measured series collected by a scan. Append-only while
/// the scan runs; a cancelled scan simply stops short.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanSeries {
    pub commanded: Vec<f64>,
    pub measured: Vec<f64>,
}

impl ScanSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commanded: Vec::with_capacity(capacity),
            measured: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: ScanPoint) {
        self.commanded.push(point.commanded);
        self.measured.push(point.measured);
    }

    pub fn len(&self) -> usize {
        self.commanded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commanded.is_empty()
    }
}

// =============================================================================
// Metrics and verdicts
// =============================================================================

/// Linearity metrics derived from one scan. Immutable once computed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearityMetrics {
    /// Fitted slope of measured vs. commanded.
    pub gain: f64,
    /// Fitted intercept, volts.
    pub offset: f64,
    /// Expected output step per input step; never exactly zero.
    pub lsb_ideal: f64,
    /// Integral nonlinearity per point, LSB units.
    pub inl: Vec<f64>,
    /// Differential nonlinearity per point, LSB units. `dnl[0]` is 0.
    pub dnl: Vec<f64>,
    pub max_inl: f64,
    pub max_dnl: f64,
    /// Maximum fit deviation as a percentage of full-scale measured range.
    pub nonlinearity_pct: f64,
}

/// Outcome of one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageVerdict {
    Pass,
    /// The nonlinearity limit was exceeded but the ignore-failure policy is
    /// on; recorded distinctly so the sheet shows what happened.
    PassIgnored,
    Fail,
}

impl StageVerdict {
    pub fn is_passing(self) -> bool {
        matches!(self, StageVerdict::Pass | StageVerdict::PassIgnored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageVerdict::Pass => "PASS",
            StageVerdict::PassIgnored => "PASS_IGNORED",
            StageVerdict::Fail => "FAIL",
        }
    }
}

impl fmt::Display for StageVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass/fail classification of a measured value against configured bounds.
/// Not inherently fatal; the configured policy decides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitStatus {
    Pass,
    Fail,
    /// Failed, but the run was configured to continue.
    FailIgnored,
    /// No limit configured for this channel.
    NoLimit,
}

impl LimitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitStatus::Pass => "PASS",
            LimitStatus::Fail => "FAIL",
            LimitStatus::FailIgnored => "FAIL (Ignored)",
            LimitStatus::NoLimit => "NO_LIMIT",
        }
    }
}

impl fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageIndex,
    /// Configured gain for this stage, dB.
    pub gain_config_db: f64,
    /// Input amplitude actually driven, volts (after any safety clamp).
    pub input_amplitude: f64,
    /// `None` when the scan produced fewer than two points or setup failed.
    pub metrics: Option<LinearityMetrics>,
    pub verdict: StageVerdict,
}

// =============================================================================
// Run records
// =============================================================================

/// Why a sequence was aborted. Carried in result records verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    PowerLimit,
    Stage1Fail,
    ConnectionCheck,
    ConfigError,
    UserStop,
    SystemError,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::PowerLimit => "Power_Limit",
            AbortReason::Stage1Fail => "Stage1_Fail",
            AbortReason::ConnectionCheck => "Connection_Check",
            AbortReason::ConfigError => "Config_Error",
            AbortReason::UserStop => "User_Stop",
            AbortReason::SystemError => "System_Error",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict of a per-site run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalVerdict {
    Pending,
    Pass,
    Partial,
    Fail,
}

impl FinalVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalVerdict::Pending => "PENDING",
            FinalVerdict::Pass => "PASS",
            FinalVerdict::Partial => "PARTIAL",
            FinalVerdict::Fail => "FAIL",
        }
    }
}

impl fmt::Display for FinalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete result of one wafer-site test. Created at run start, mutated only
/// by the owning runner, persisted exactly once at run end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteTestRecord {
    pub site_id: String,
    pub row: u32,
    pub col: u32,
    pub tested_at: DateTime<Utc>,
    /// Highest current measured during the power check, amps.
    pub power_current: f64,
    pub power_check: LimitStatus,
    /// Per-stage results in stage order; may be short if the run aborted.
    pub stages: Vec<StageResult>,
    pub final_verdict: FinalVerdict,
    pub fail_reason: Option<AbortReason>,
}

impl SiteTestRecord {
    pub fn new(site_id: impl Into<String>, row: u32, col: u32) -> Self {
        Self {
            site_id: site_id.into(),
            row,
            col,
            tested_at: Utc::now(),
            power_current: 0.0,
            power_check: LimitStatus::NoLimit,
            stages: Vec::new(),
            final_verdict: FinalVerdict::Pending,
            fail_reason: None,
        }
    }

    /// Result for a given stage, if it executed.
    pub fn stage(&self, index: StageIndex) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_index_bounds() {
        assert!(StageIndex::new(0).is_err());
        assert!(StageIndex::new(8).is_err());
        assert_eq!(StageIndex::new(7).unwrap().get(), 7);
        assert_eq!(StageIndex::all().count(), 7);
    }

    #[test]
    fn test_gear_register_packing() {
        // All four channels on the 10 V gear: nibble 10 = 0xA.
        let reg = gear_register([DacRange::R10V; 4]);
        assert_eq!(reg, 0xAAAA);

        // Mixed gears pack low channel into the low nibble.
        let reg = gear_register([DacRange::R2V5, DacRange::R5V, DacRange::R10V, DacRange::R20V]);
        assert_eq!(reg, (12 << 12) | (10 << 8) | (9 << 4) | 14);
    }

    #[test]
    fn test_dac_range_from_f64() {
        assert_eq!(DacRange::try_from(10.0).unwrap(), DacRange::R10V);
        assert!(DacRange::try_from(7.5).is_err());
    }

    #[test]
    fn test_dac_code_endpoints() {
        assert_eq!(dac_code(DacRange::R10V, -10.0), 0);
        assert_eq!(dac_code(DacRange::R10V, 10.0), 65535);
        assert_eq!(dac_code(DacRange::R10V, 0.0), 32768);
    }

    #[test]
    fn test_dac_code_clamps_out_of_range_voltage() {
        assert_eq!(dac_code(DacRange::R2V5, -3.0), 0);
        assert_eq!(dac_code(DacRange::R2V5, 3.0), 65535);
    }

    #[test]
    fn test_dac_code_volts_round_trip() {
        for &v in &[-9.5, -4.5, -2.5, 0.0, 0.25, 7.75] {
            let code = dac_code(DacRange::R10V, v);
            let back = dac_volts(DacRange::R10V, code);
            // One code step on the 10 V range is ~0.3 mV.
            assert!((back - v).abs() < 3.1e-4, "v={} back={}", v, back);
        }
    }

    #[test]
    fn test_current_limit_check() {
        let limit = CurrentLimit {
            instrument: "DP1".to_string(),
            channel: 1,
            min_current: 0.1,
            max_current: 0.8,
        };
        assert_eq!(limit.check(0.5), LimitStatus::Pass);
        assert_eq!(limit.check(0.9), LimitStatus::Fail);
        assert_eq!(limit.check(0.05), LimitStatus::Fail);
    }

    #[test]
    fn test_scan_series_push() {
        let mut series = ScanSeries::with_capacity(4);
        series.push(ScanPoint {
            commanded: -0.25,
            measured: -0.24,
        });
        assert_eq!(series.len(), 1);
        assert!(!series.is_empty());
    }

    #[test]
    fn test_abort_reason_strings() {
        assert_eq!(AbortReason::PowerLimit.as_str(), "Power_Limit");
        assert_eq!(AbortReason::Stage1Fail.as_str(), "Stage1_Fail");
    }
}
