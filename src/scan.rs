//! Scan engine: cancellable voltage sweep against one source and one meter.
//!
//! For each point the engine drives the source (DAC code path or signal
//! generator DC offset), waits the configured settle delay, samples the
//! meter, and reports integer-percent progress. The cancellation flag is
//! checked once per iteration; a cancelled scan returns the partial series;
//! callers treat a short series as "stopped early" and only fail a stage
//! when fewer than two points were collected.

use log::{debug, info};
use std::time::Duration;

use crate::core::{dac_code, DacRange, ScanPoint, ScanSeries, SourceKind};
use crate::error::RigResult;
use crate::instrument::InstrumentRegistry;
use crate::progress::RunContext;

/// Everything a single sweep needs.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub source: SourceKind,
    /// Alias of the stimulus instrument (DAC or signal generator).
    pub source_alias: String,
    pub meter_alias: String,
    /// Source channel driven during the sweep.
    pub channel: u8,
    pub start_voltage: f64,
    pub step_voltage: f64,
    pub point_count: usize,
    /// Range the DAC codes are computed against. Unused on the
    /// signal-generator path.
    pub dac_range: DacRange,
    /// Wait between driving the source and sampling the meter.
    pub settle: Duration,
}

/// Runs one sweep. Returns the collected series, short if cancelled.
pub async fn run_scan(
    registry: &InstrumentRegistry,
    request: &ScanRequest,
    ctx: &RunContext,
) -> RigResult<ScanSeries> {
    let source = registry.lookup(&request.source_alias).await?;
    let meter = registry.lookup(&request.meter_alias).await?;
    meter.ensure_connected().await?;
    source.ensure_connected().await?;

    if request.source == SourceKind::SignalGenerator {
        source.init_dc_mode(request.channel).await?;
    }

    info!(
        "starting scan: {} points from {:.4} V, step {:.6} V, source '{}' ch{}, meter '{}'",
        request.point_count,
        request.start_voltage,
        request.step_voltage,
        request.source_alias,
        request.channel,
        request.meter_alias
    );

    let mut series = ScanSeries::with_capacity(request.point_count);
    for k in 0..request.point_count {
        if ctx.is_cancelled() {
            info!("scan stopped at point {}/{}", k, request.point_count);
            break;
        }

        let v = request.start_voltage + k as f64 * request.step_voltage;
        match request.source {
            SourceKind::Dac => {
                let code = dac_code(request.dac_range, v);
                source.set_output(request.channel, code).await?;
            }
            SourceKind::SignalGenerator => {
                source.set_dc_offset(request.channel, v).await?;
            }
        }

        tokio::time::sleep(request.settle).await;

        let measured = meter.measure_voltage().await?;
        debug!("set: {:.4} V, meas: {:.4} V", v, measured);
        series.push(ScanPoint {
            commanded: v,
            measured,
        });

        let percent = ((k + 1) as f64 * 100.0 / request.point_count as f64).round() as u8;
        ctx.report_progress(percent);
    }

    info!("scan collected {} points", series.len());
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RigSettings;
    use crate::core::SourceKind;
    use crate::instrument::build_registry;
    use tokio::sync::mpsc;

    fn request(points: usize) -> ScanRequest {
        ScanRequest {
            source: SourceKind::Dac,
            source_alias: "DAC1".to_string(),
            meter_alias: "DM1".to_string(),
            channel: 10,
            start_voltage: -0.25,
            step_voltage: 0.005,
            point_count: points,
            dac_range: DacRange::R10V,
            settle: Duration::from_millis(1),
        }
    }

    async fn sim_registry() -> std::sync::Arc<crate::instrument::InstrumentRegistry> {
        let registry = build_registry(&RigSettings::default()).await.unwrap();
        registry.connect_all().await;
        registry
    }

    #[tokio::test]
    async fn test_full_scan_collects_every_point() {
        let registry = sim_registry().await;
        let ctx = RunContext::new();
        let series = run_scan(&registry, &request(21), &ctx).await.unwrap();
        assert_eq!(series.len(), 21);
        assert_eq!(series.commanded[0], -0.25);
        assert!((series.commanded[20] - (-0.25 + 20.0 * 0.005)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_progress_is_monotone_and_reaches_100() {
        let registry = sim_registry().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = RunContext::with_progress(tx);
        run_scan(&registry, &request(10), &ctx).await.unwrap();
        drop(ctx);
        let mut last = 0;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert!(event.percent >= last, "progress went backwards");
            last = event.percent;
            events.push(event.percent);
        }
        assert_eq!(events.len(), 10);
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_series() {
        let registry = sim_registry().await;
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        let mut req = request(200);
        req.settle = Duration::from_millis(10);

        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            canceller.request_stop();
        });

        let series = run_scan(&registry, &req, &ctx).await.unwrap();
        stop.await.unwrap();
        // Stopped early, but not an error.
        assert!(series.len() >= 1);
        assert!(series.len() < 200);
    }

    #[tokio::test]
    async fn test_pre_cancelled_scan_is_empty_not_error() {
        let registry = sim_registry().await;
        let ctx = RunContext::new();
        ctx.request_stop();
        let series = run_scan(&registry, &request(50), &ctx).await.unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_missing_meter_is_not_found() {
        let settings = RigSettings::default();
        let registry = crate::instrument::InstrumentRegistry::new(&settings);
        registry
            .register("DAC1", crate::core::InstrumentKind::Dac, "sim")
            .await
            .unwrap();
        let ctx = RunContext::new();
        let err = run_scan(&registry, &request(5), &ctx).await.unwrap_err();
        assert!(matches!(err, crate::error::RigError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_generator_path_drives_offsets() {
        let registry = sim_registry().await;
        let ctx = RunContext::new();
        let mut req = request(5);
        req.source = SourceKind::SignalGenerator;
        req.source_alias = "DG1".to_string();
        req.channel = 1;
        let series = run_scan(&registry, &req, &ctx).await.unwrap();
        assert_eq!(series.len(), 5);
        // DC offsets bypass code quantization entirely.
        assert_eq!(series.measured[0], series.commanded[0]);
        // DC mode was initialized exactly once.
        assert_eq!(registry.sim_bus().count_calls("init_dc_mode"), 1);
    }
}
