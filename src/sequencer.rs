//! Stage sequencer: the run state machine.
//!
//! Phases: `Idle → PoweringOn → CheckingConnections → CheckingPowerLimits →
//! RunningStage(1..=7) → PoweringOff → Done`. An abort from any non-terminal
//! phase still routes through `PoweringOff` before `Done`; power-off runs
//! exactly once per run on every path.
//!
//! Long-running hardware work (the power sequences, each scan) runs as a
//! spawned task whose `JoinHandle` the sequencer awaits directly, so the
//! control flow never blocks on hardware I/O and completion is an explicit
//! future, not a listener attached after a delay.
//!
//! Both power-limit policies are first-class: *WarnOnly* logs a failed check
//! and continues, *AbortOnFail* aborts with reason `Power_Limit`. The caller
//! picks one; nothing here hard-codes a choice.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analysis;
use crate::config::{ConfigProvider, DelaySettings, LimitSettings, ScanSettings};
use crate::core::{
    dac_code, gear_register, AbortReason, CurrentLimit, InstrumentKind, LimitStatus,
    PowerChannelTarget, ScanSeries, SourceKind, StageIndex, StageResult, StageVerdict,
};
use crate::error::{RigError, RigResult};
use crate::instrument::InstrumentRegistry;
use crate::progress::RunContext;
use crate::recorder::ResultRecorder;
use crate::scan::{run_scan, ScanRequest};

/// Configured gain per stage, dB.
const STAGE_GAIN_DB: [f64; StageIndex::COUNT as usize] = [-9.6, -3.6, 0.0, 2.0, 4.0, 6.0, 8.0];

/// Gain configured for a stage, dB.
pub fn stage_gain_db(stage: StageIndex) -> f64 {
    STAGE_GAIN_DB[usize::from(stage.get()) - 1]
}

/// Computed sweep parameters for one stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanParams {
    /// Input amplitude, volts, after any safety clamp.
    pub amplitude: f64,
    pub start_voltage: f64,
    pub step_voltage: f64,
    pub point_count: usize,
    /// True when the computed amplitude exceeded the safety bound and was
    /// clamped.
    pub clamped: bool,
}

/// Derives the sweep for a stage: the input amplitude that produces the
/// target output through the stage's linear gain, clamped to the safety
/// bound, swept symmetrically around zero.
pub fn scan_params_for_stage(
    stage: StageIndex,
    point_count: usize,
    target_output_v: f64,
    safety_limit_v: f64,
) -> ScanParams {
    let gain_db = stage_gain_db(stage);
    let lin_gain = 10f64.powf(gain_db / 20.0);
    let raw = target_output_v / lin_gain;
    let clamped = raw > safety_limit_v;
    let amplitude = raw.clamp(0.0, safety_limit_v);
    ScanParams {
        amplitude,
        start_voltage: -amplitude,
        step_voltage: 2.0 * amplitude / (point_count - 1) as f64,
        point_count,
        clamped,
    }
}

/// Which way a power sequence walks the rail list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PowerMode {
    On,
    Off,
}

/// Current readback for one rail during the power-on walk.
#[derive(Clone, Debug)]
pub struct PowerReading {
    pub instrument: String,
    pub channel: u8,
    pub current: f64,
    pub status: LimitStatus,
}

/// Aggregate outcome of the power-limit check.
#[derive(Clone, Debug)]
pub struct PowerCheckOutcome {
    pub status: LimitStatus,
    /// Highest current measured across all checked channels, amps.
    pub max_current: f64,
    pub readings: Vec<PowerReading>,
}

/// What to do when the power-limit check fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerLimitPolicy {
    /// Log the failure and continue the run.
    WarnOnly,
    /// Abort immediately with reason `Power_Limit`.
    AbortOnFail,
}

/// Run policies for one sequencer execution.
#[derive(Clone, Debug)]
pub struct SequencerOptions {
    pub power_limit_policy: PowerLimitPolicy,
    /// Abort the whole run when stage 1 fails (per-site mode).
    pub abort_on_stage1_fail: bool,
    pub ignore_linearity_fail: bool,
    pub nonlinearity_limit_pct: f64,
    pub target_output_v: f64,
    pub input_safety_limit_v: f64,
}

impl SequencerOptions {
    /// Bench automation defaults: continue past a failed power check, record
    /// individual stage failures and keep going.
    pub fn bench(limits: &LimitSettings) -> Self {
        Self {
            power_limit_policy: PowerLimitPolicy::WarnOnly,
            abort_on_stage1_fail: false,
            ignore_linearity_fail: limits.ignore_linearity_fail,
            nonlinearity_limit_pct: limits.nonlinearity_limit_pct,
            target_output_v: limits.target_output_v,
            input_safety_limit_v: limits.input_safety_limit_v,
        }
    }

    /// Per-site defaults: a failed power check or a stage-1 failure aborts.
    pub fn site(limits: &LimitSettings) -> Self {
        Self {
            power_limit_policy: PowerLimitPolicy::AbortOnFail,
            abort_on_stage1_fail: true,
            ..Self::bench(limits)
        }
    }

    pub fn with_policy(mut self, policy: PowerLimitPolicy) -> Self {
        self.power_limit_policy = policy;
        self
    }
}

/// Phase of the sequencer state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencePhase {
    Idle,
    PoweringOn,
    CheckingConnections,
    CheckingPowerLimits,
    RunningStage(StageIndex),
    PoweringOff,
    Done,
}

/// Observable sequencer state, published on a watch channel.
#[derive(Clone, Debug)]
pub struct SequenceState {
    pub phase: SequencePhase,
    pub current_stage: Option<StageIndex>,
    pub running: bool,
    pub abort_reason: Option<AbortReason>,
}

impl SequenceState {
    fn idle() -> Self {
        Self {
            phase: SequencePhase::Idle,
            current_stage: None,
            running: false,
            abort_reason: None,
        }
    }
}

/// Everything one sequence run produced.
#[derive(Clone, Debug, Default)]
pub struct SequenceOutcome {
    /// Per-rail readbacks from the power-on walk.
    pub power_readings: Vec<PowerReading>,
    /// Power-limit check result; `None` if the run aborted before it.
    pub power_check: Option<PowerCheckOutcome>,
    /// Stage results in execution order; short if the run aborted.
    pub stages: Vec<StageResult>,
    pub abort_reason: Option<AbortReason>,
}

impl SequenceOutcome {
    /// True when every stage ran and none failed outright.
    pub fn all_stages_passed(&self) -> bool {
        self.stages.len() == usize::from(StageIndex::COUNT)
            && self.stages.iter().all(|s| s.verdict.is_passing())
    }
}

/// Drives one full multi-stage run against the registry.
pub struct StageSequencer {
    registry: Arc<InstrumentRegistry>,
    provider: Arc<dyn ConfigProvider>,
    recorder: Option<Arc<dyn ResultRecorder>>,
    options: SequencerOptions,
    delays: DelaySettings,
    scan: ScanSettings,
    state_tx: watch::Sender<SequenceState>,
}

impl StageSequencer {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        provider: Arc<dyn ConfigProvider>,
        options: SequencerOptions,
        delays: DelaySettings,
        scan: ScanSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SequenceState::idle());
        Self {
            registry,
            provider,
            recorder: None,
            options,
            delays,
            scan,
            state_tx,
        }
    }

    /// Attaches a recorder; each completed stage is appended as it finishes.
    pub fn with_recorder(mut self, recorder: Arc<dyn ResultRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Subscribes to state-machine updates.
    pub fn state(&self) -> watch::Receiver<SequenceState> {
        self.state_tx.subscribe()
    }

    fn set_phase(&self, phase: SequencePhase) {
        self.state_tx.send_modify(|state| {
            state.phase = phase;
            state.current_stage = match phase {
                SequencePhase::RunningStage(stage) => Some(stage),
                _ => None,
            };
            state.running = !matches!(phase, SequencePhase::Idle | SequencePhase::Done);
        });
    }

    /// Runs the full sequence. The returned outcome carries an abort reason
    /// instead of this method erroring: power-off and the terminal `Done`
    /// phase happen on every path.
    pub async fn run(&self, ctx: &RunContext) -> SequenceOutcome {
        info!("=== starting {}-stage sequence ===", StageIndex::COUNT);
        let mut outcome = SequenceOutcome::default();

        if let Err(reason) = self.run_inner(ctx, &mut outcome).await {
            warn!("sequence aborted: {}", reason);
            outcome.abort_reason = Some(reason);
            self.state_tx
                .send_modify(|state| state.abort_reason = Some(reason));
        }

        // Unconditional power-off, exactly once, before Done.
        self.set_phase(SequencePhase::PoweringOff);
        match self.spawn_power_sequence(PowerMode::Off, ctx.clone()) {
            Ok(handle) => match handle.await {
                Ok(Ok(_)) => info!("power off sequence completed"),
                Ok(Err(err)) => error!("power off sequence failed: {}", err),
                Err(err) => error!("power off task failed: {}", err),
            },
            Err(err) => error!("could not start power off sequence: {}", err),
        }
        self.set_phase(SequencePhase::Done);
        info!("=== sequence done ===");
        outcome
    }

    async fn run_inner(
        &self,
        ctx: &RunContext,
        outcome: &mut SequenceOutcome,
    ) -> Result<(), AbortReason> {
        self.set_phase(SequencePhase::PoweringOn);
        let connected = self.registry.connect_all().await;
        info!("{} instruments connected", connected);

        let power_on = self
            .spawn_power_sequence(PowerMode::On, ctx.clone())
            .map_err(|err| {
                error!("power on sequence could not start: {}", err);
                AbortReason::ConfigError
            })?;
        outcome.power_readings = match power_on.await {
            Ok(Ok(readings)) => readings,
            Ok(Err(err)) => {
                error!("power on sequence failed: {}", err);
                return Err(AbortReason::SystemError);
            }
            Err(err) => {
                error!("power on task failed: {}", err);
                return Err(AbortReason::SystemError);
            }
        };
        if ctx.is_cancelled() {
            return Err(AbortReason::UserStop);
        }

        self.set_phase(SequencePhase::CheckingConnections);
        self.check_connections().await?;

        self.set_phase(SequencePhase::CheckingPowerLimits);
        let limits = self.provider.power_limits().map_err(|err| {
            error!("could not read power limits: {}", err);
            AbortReason::ConfigError
        })?;
        let mut check = self.check_power_limits(&limits).await;
        if check.status == LimitStatus::Fail {
            match self.options.power_limit_policy {
                PowerLimitPolicy::AbortOnFail => {
                    error!("power limit check failed; aborting");
                    outcome.power_check = Some(check);
                    return Err(AbortReason::PowerLimit);
                }
                PowerLimitPolicy::WarnOnly => {
                    warn!("power limit check failed; continuing per policy");
                    check.status = LimitStatus::FailIgnored;
                }
            }
        }
        outcome.power_check = Some(check);

        for stage in StageIndex::all() {
            if ctx.is_cancelled() {
                return Err(AbortReason::UserStop);
            }
            self.set_phase(SequencePhase::RunningStage(stage));
            info!("--- running stage {}/{} ---", stage, StageIndex::COUNT);

            let result = self.run_stage(stage, ctx).await;
            if let Some(recorder) = &self.recorder {
                if let Err(err) = recorder.append_stage_result(&result).await {
                    warn!("failed to record stage {} result: {}", stage, err);
                }
            }
            let failed = result.verdict == StageVerdict::Fail;
            outcome.stages.push(result);

            if failed && stage == StageIndex::FIRST && self.options.abort_on_stage1_fail {
                error!("stage 1 failed; aborting run");
                return Err(AbortReason::Stage1Fail);
            }
        }
        Ok(())
    }

    /// At least one connected instrument per required role.
    async fn check_connections(&self) -> Result<(), AbortReason> {
        let mut ok = true;
        for kind in [
            InstrumentKind::PowerSupply,
            InstrumentKind::Dac,
            InstrumentKind::Multimeter,
        ] {
            if !self.registry.any_connected(kind).await {
                error!("no connected {} available", kind);
                ok = false;
            }
        }
        if ok {
            Ok(())
        } else {
            Err(AbortReason::ConnectionCheck)
        }
    }

    /// Measures every limited channel and classifies it. A measurement error
    /// fails the check; an unregistered instrument skips its record.
    async fn check_power_limits(&self, limits: &[CurrentLimit]) -> PowerCheckOutcome {
        if limits.is_empty() {
            info!("no power limits configured");
            return PowerCheckOutcome {
                status: LimitStatus::NoLimit,
                max_current: 0.0,
                readings: Vec::new(),
            };
        }

        let mut overall = LimitStatus::Pass;
        let mut max_current: f64 = 0.0;
        let mut readings = Vec::new();
        for limit in limits {
            let handle = match self.registry.lookup(&limit.instrument).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!("power limit check: {}; record skipped", err);
                    continue;
                }
            };
            if let Err(err) = handle.ensure_connected().await {
                warn!(
                    "power limit check: cannot connect '{}': {}",
                    limit.instrument, err
                );
                overall = LimitStatus::Fail;
                continue;
            }
            match handle.measure_current(limit.channel).await {
                Ok(measured) => {
                    max_current = max_current.max(measured);
                    let status = limit.check(measured);
                    if status == LimitStatus::Fail {
                        overall = LimitStatus::Fail;
                        warn!(
                            "FAIL: {} CH{} current {:.4} A out of ({}, {})",
                            limit.instrument,
                            limit.channel,
                            measured,
                            limit.min_current,
                            limit.max_current
                        );
                    } else {
                        info!(
                            "{} CH{} current {:.4} A ({})",
                            limit.instrument, limit.channel, measured, status
                        );
                    }
                    readings.push(PowerReading {
                        instrument: limit.instrument.clone(),
                        channel: limit.channel,
                        current: measured,
                        status,
                    });
                }
                Err(err) => {
                    warn!(
                        "error measuring {} CH{}: {}",
                        limit.instrument, limit.channel, err
                    );
                    overall = LimitStatus::Fail;
                }
            }
        }
        PowerCheckOutcome {
            status: overall,
            max_current,
            readings,
        }
    }

    /// One stage: configure, scan, analyze, classify. Setup and scan errors
    /// fold into a FAIL result for this stage; the caller decides whether
    /// the sequence continues.
    async fn run_stage(&self, stage: StageIndex, ctx: &RunContext) -> StageResult {
        let gain_db = stage_gain_db(stage);
        let params = scan_params_for_stage(
            stage,
            self.scan.point_count,
            self.options.target_output_v,
            self.options.input_safety_limit_v,
        );
        if params.clamped {
            warn!(
                "safety clamp: stage {} input amplitude limited to {:.2} V",
                stage, params.amplitude
            );
        }
        info!(
            "stage {} params: start={:.4} V, step={:.6} V, points={}",
            stage, params.start_voltage, params.step_voltage, params.point_count
        );

        let mut result = StageResult {
            stage,
            gain_config_db: gain_db,
            input_amplitude: params.amplitude,
            metrics: None,
            verdict: StageVerdict::Fail,
        };

        let config = match self.provider.stage_config(stage) {
            Ok(config) => config,
            Err(err) => {
                error!("stage {} configuration error: {}", stage, err);
                return result;
            }
        };
        if let Err(err) = self.apply_stage_config(&config).await {
            error!("stage {} setup failed: {}", stage, err);
            return result;
        }

        let (source_alias, channel) = match self.scan.source {
            SourceKind::Dac => (self.scan.dac_alias.clone(), self.scan.dac_channel),
            SourceKind::SignalGenerator => (
                self.scan.generator_alias.clone(),
                self.scan.generator_channel,
            ),
        };
        let request = ScanRequest {
            source: self.scan.source,
            source_alias,
            meter_alias: self.scan.meter_alias.clone(),
            channel,
            start_voltage: params.start_voltage,
            step_voltage: params.step_voltage,
            point_count: params.point_count,
            dac_range: self.scan.dac_range,
            settle: self.delays.settle,
        };

        let series = match self.spawn_scan(request, ctx.clone()).await {
            Ok(Ok(series)) => series,
            Ok(Err(err)) => {
                error!("stage {} scan failed: {}", stage, err);
                return result;
            }
            Err(err) => {
                error!("stage {} scan task failed: {}", stage, err);
                return result;
            }
        };
        if series.len() < 2 {
            warn!(
                "stage {} scan stopped early with {} points; no metrics",
                stage,
                series.len()
            );
            return result;
        }

        let metrics = match analysis::analyze_series(&series) {
            Some(metrics) => metrics,
            None => {
                warn!("stage {}: insufficient data for analysis", stage);
                return result;
            }
        };
        info!(
            "stage {} metrics: gain={:.6}, offset={:.6} V, nonlinearity={:.4}% FSR, \
             max INL={:.4} LSB, max DNL={:.4} LSB",
            stage,
            metrics.gain,
            metrics.offset,
            metrics.nonlinearity_pct,
            metrics.max_inl,
            metrics.max_dnl
        );

        result.verdict = if metrics.nonlinearity_pct > self.options.nonlinearity_limit_pct {
            if self.options.ignore_linearity_fail {
                warn!(
                    "stage {} nonlinearity {:.4}% > {:.4}% (ignored)",
                    stage, metrics.nonlinearity_pct, self.options.nonlinearity_limit_pct
                );
                StageVerdict::PassIgnored
            } else {
                error!(
                    "FAIL: stage {} nonlinearity {:.4}% > {:.4}%",
                    stage, metrics.nonlinearity_pct, self.options.nonlinearity_limit_pct
                );
                StageVerdict::Fail
            }
        } else {
            StageVerdict::Pass
        };
        result.metrics = Some(metrics);
        result
    }

    /// Pushes one stage's configuration: gear registers first (each group of
    /// four channels shares one range register), then per-channel codes,
    /// then the stage power rail.
    async fn apply_stage_config(&self, config: &crate::core::StageConfig) -> RigResult<()> {
        let dac = self.registry.lookup(&self.scan.dac_alias).await?;
        dac.ensure_connected().await?;

        for (group, chunk) in config.dac_channels.chunks(4).enumerate() {
            if chunk.len() < 4 {
                continue;
            }
            let register =
                gear_register([chunk[0].range, chunk[1].range, chunk[2].range, chunk[3].range]);
            dac.set_gear_register(group as u8, register).await?;
            tokio::time::sleep(self.delays.inter_command).await;
        }
        for target in &config.dac_channels {
            let code = dac_code(target.range, target.voltage);
            debug!(
                "set DAC{} ({} V range) to {} V -> code {}",
                target.channel,
                target.range.full_scale_volts(),
                target.voltage,
                code
            );
            dac.set_output(target.channel, code).await?;
            tokio::time::sleep(self.delays.inter_command).await;
        }

        let supply = self.registry.lookup(&config.power.instrument).await?;
        supply.ensure_connected().await?;
        info!(
            "set {} CH{}: {} V, {} A",
            config.power.instrument, config.power.channel, config.power.voltage,
            config.power.current
        );
        supply
            .set_channel(config.power.channel, config.power.voltage, config.power.current)
            .await?;
        tokio::time::sleep(self.delays.stabilization).await;
        Ok(())
    }

    fn spawn_scan(
        &self,
        request: ScanRequest,
        ctx: RunContext,
    ) -> JoinHandle<RigResult<ScanSeries>> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move { run_scan(&registry, &request, &ctx).await })
    }

    fn spawn_power_sequence(
        &self,
        mode: PowerMode,
        ctx: RunContext,
    ) -> RigResult<JoinHandle<RigResult<Vec<PowerReading>>>> {
        let mut items = self.provider.power_sequence()?;
        if items.is_empty() {
            return Err(RigError::Config("power sequence is empty".to_string()));
        }
        if mode == PowerMode::Off {
            items.reverse();
        }
        let limits = if mode == PowerMode::On {
            self.provider.power_limits().unwrap_or_default()
        } else {
            Vec::new()
        };
        let registry = Arc::clone(&self.registry);
        let delays = self.delays.clone();
        Ok(tokio::spawn(power_sequence_task(
            registry, items, limits, delays, mode, ctx,
        )))
    }
}

/// Worker body for one power walk. Items whose instrument is missing or
/// unreachable are logged and skipped; the walk itself only fails on task
/// level errors. Power-off ignores the stop flag: a cancelled run still
/// powers down.
async fn power_sequence_task(
    registry: Arc<InstrumentRegistry>,
    items: Vec<PowerChannelTarget>,
    limits: Vec<CurrentLimit>,
    delays: DelaySettings,
    mode: PowerMode,
    ctx: RunContext,
) -> RigResult<Vec<PowerReading>> {
    let label = match mode {
        PowerMode::On => "ON",
        PowerMode::Off => "OFF",
    };
    info!("starting power {} sequence ({} rails)", label, items.len());

    let mut readings = Vec::new();
    for item in items {
        if mode == PowerMode::On && ctx.is_cancelled() {
            info!("power {} sequence stopped by user", label);
            break;
        }
        let handle = match registry.lookup(&item.instrument).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("power sequence: {}; rail skipped", err);
                continue;
            }
        };
        if let Err(err) = handle.ensure_connected().await {
            warn!(
                "power sequence: failed to connect '{}': {}",
                item.instrument, err
            );
            continue;
        }

        match mode {
            PowerMode::On => {
                info!(
                    "processing {} CH{}: set {} V, {} A",
                    item.instrument, item.channel, item.voltage, item.current
                );
                // OVP/OCP at a 20 % guard band above the commanded rail.
                if let Err(err) = handle
                    .set_protection(item.channel, item.voltage * 1.2, item.current * 1.2)
                    .await
                {
                    warn!(
                        "{} CH{} protection setup failed: {}",
                        item.instrument, item.channel, err
                    );
                }
                if let Err(err) = handle
                    .set_channel(item.channel, item.voltage, item.current)
                    .await
                {
                    warn!("{} CH{} set failed: {}", item.instrument, item.channel, err);
                    continue;
                }
                if let Err(err) = handle.output_on(item.channel).await {
                    warn!(
                        "{} CH{} output on failed: {}",
                        item.instrument, item.channel, err
                    );
                    continue;
                }
                tokio::time::sleep(delays.stabilization).await;
                match handle.measure_current(item.channel).await {
                    Ok(current) => {
                        let status = limits
                            .iter()
                            .find(|l| l.instrument == item.instrument && l.channel == item.channel)
                            .map_or(LimitStatus::NoLimit, |l| l.check(current));
                        info!("CH{} current: {:.4} A ({})", item.channel, current, status);
                        readings.push(PowerReading {
                            instrument: item.instrument.clone(),
                            channel: item.channel,
                            current,
                            status,
                        });
                    }
                    Err(err) => warn!(
                        "error measuring {} CH{}: {}",
                        item.instrument, item.channel, err
                    ),
                }
            }
            PowerMode::Off => {
                if let Err(err) = handle.output_off(item.channel).await {
                    warn!(
                        "{} CH{} output off failed: {}",
                        item.instrument, item.channel, err
                    );
                }
                info!("CH{} OFF", item.channel);
                tokio::time::sleep(delays.power_off).await;
            }
        }
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(i: u8) -> StageIndex {
        StageIndex::new(i).unwrap()
    }

    #[test]
    fn test_gain_table() {
        assert_eq!(stage_gain_db(stage(1)), -9.6);
        assert_eq!(stage_gain_db(stage(2)), -3.6);
        assert_eq!(stage_gain_db(stage(3)), 0.0);
        assert_eq!(stage_gain_db(stage(7)), 8.0);
    }

    #[test]
    fn test_scan_params_unity_gain_stage() {
        // Stage 3: 0 dB -> gain 1 -> amplitude 0.25, start -0.25, step 0.005.
        let params = scan_params_for_stage(stage(3), 101, 0.25, 0.5);
        assert!(!params.clamped);
        assert!((params.amplitude - 0.25).abs() < 1e-12);
        assert!((params.start_voltage + 0.25).abs() < 1e-12);
        assert!((params.step_voltage - 0.005).abs() < 1e-12);
        assert_eq!(params.point_count, 101);
    }

    #[test]
    fn test_scan_params_attenuating_stage_clamps() {
        // Stage 1: -9.6 dB -> gain 0.331 -> raw amplitude 0.755, clamped.
        let params = scan_params_for_stage(stage(1), 101, 0.25, 0.5);
        assert!(params.clamped);
        assert_eq!(params.amplitude, 0.5);
        assert_eq!(params.start_voltage, -0.5);
        assert!((params.step_voltage - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_scan_params_amplifying_stage() {
        // Stage 7: +8 dB -> gain ~2.512 -> amplitude ~0.0995, no clamp.
        let params = scan_params_for_stage(stage(7), 101, 0.25, 0.5);
        assert!(!params.clamped);
        let expected = 0.25 / 10f64.powf(8.0 / 20.0);
        assert!((params.amplitude - expected).abs() < 1e-12);
        assert!((params.step_voltage - 2.0 * expected / 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_every_stage_symmetric_sweep() {
        for stage in StageIndex::all() {
            let params = scan_params_for_stage(stage, 101, 0.25, 0.5);
            assert_eq!(params.start_voltage, -params.amplitude);
            let end = params.start_voltage + 100.0 * params.step_voltage;
            assert!((end - params.amplitude).abs() < 1e-9, "stage {}", stage);
        }
    }

    #[test]
    fn test_options_constructors() {
        let limits = LimitSettings::default();
        let bench = SequencerOptions::bench(&limits);
        assert_eq!(bench.power_limit_policy, PowerLimitPolicy::WarnOnly);
        assert!(!bench.abort_on_stage1_fail);

        let site = SequencerOptions::site(&limits);
        assert_eq!(site.power_limit_policy, PowerLimitPolicy::AbortOnFail);
        assert!(site.abort_on_stage1_fail);

        let flipped = bench.with_policy(PowerLimitPolicy::AbortOnFail);
        assert_eq!(flipped.power_limit_policy, PowerLimitPolicy::AbortOnFail);
    }
}
